//! Batch launch and the aggregation loop

use super::pool::{DispatchStats, WorkerPool};
use super::{BatchEvent, BatchItem, BatchSnapshot, BatchSummary, BatchWorker};
use chrono::Utc;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a finished batch produced
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub summary: BatchSummary,
    /// Items in completion order
    pub results: Vec<T>,
}

/// Configured batch, ready to launch
pub struct BatchRunner<W: BatchWorker> {
    worker: Arc<W>,
    pool_size: usize,
    progress_interval: Duration,
}

impl<W: BatchWorker> BatchRunner<W> {
    pub fn new(worker: Arc<W>, pool_size: usize, progress_interval: Duration) -> Self {
        Self {
            worker,
            pool_size: pool_size.max(1),
            progress_interval: progress_interval.max(Duration::from_millis(1)),
        }
    }

    /// Start the batch; events go to `events` in aggregation order
    pub fn launch(
        self,
        targets: Vec<Ipv4Addr>,
        events: mpsc::UnboundedSender<BatchEvent<W::Output>>,
    ) -> RunningBatch<W::Output> {
        let batch_id = Uuid::new_v4();
        let total = targets.len();
        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(BatchSnapshot::new(total));
        let (result_tx, result_rx) = mpsc::channel(self.pool_size * 2);

        log::info!(
            "Batch {} started: {} targets, pool size {}",
            batch_id,
            total,
            self.pool_size
        );

        let pool = WorkerPool::new(self.pool_size, cancel.clone());
        let dispatcher = tokio::spawn(pool.dispatch(self.worker, targets, result_tx));

        let aggregator = Aggregator {
            batch_id,
            events,
            snapshot: snapshot_tx,
            progress_interval: self.progress_interval,
        };
        let handle = tokio::spawn(aggregator.run(total, result_rx, dispatcher));

        RunningBatch {
            batch_id,
            cancel,
            snapshot: snapshot_rx,
            handle,
        }
    }
}

/// Handle to a launched batch
#[derive(Debug)]
pub struct RunningBatch<T> {
    batch_id: Uuid,
    cancel: CancellationToken,
    snapshot: watch::Receiver<BatchSnapshot>,
    handle: JoinHandle<BatchReport<T>>,
}

impl<T> RunningBatch<T> {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Stop handing out new targets; in-flight work still finishes
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Latest counters published by the aggregator
    pub fn snapshot(&self) -> BatchSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait for the terminal event and collect the report
    pub async fn wait(self) -> Option<BatchReport<T>> {
        match self.handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                log::error!("Batch {} aggregator failed: {}", self.batch_id, e);
                None
            }
        }
    }
}

struct Aggregator<T> {
    batch_id: Uuid,
    events: mpsc::UnboundedSender<BatchEvent<T>>,
    snapshot: watch::Sender<BatchSnapshot>,
    progress_interval: Duration,
}

impl<T: BatchItem> Aggregator<T> {
    fn emit(&self, event: BatchEvent<T>) {
        // Receiver dropped means nobody is listening any more
        let _ = self.events.send(event);
    }

    async fn run(
        self,
        total: usize,
        mut results: mpsc::Receiver<T>,
        dispatcher: JoinHandle<DispatchStats>,
    ) -> BatchReport<T> {
        let started = Instant::now();
        let mut state = BatchSnapshot::new(total);
        let mut collected = Vec::with_capacity(total);

        self.emit(BatchEvent::Started {
            batch_id: self.batch_id,
            total,
        });

        let mut ticker = time::interval_at(
            time::Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !state.all_done() {
            tokio::select! {
                received = results.recv() => match received {
                    Some(item) => {
                        state.record(&item);
                        self.emit(BatchEvent::Item(item.clone()));
                        collected.push(item);
                        self.snapshot.send_replace(state.clone());
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(percent) = state.advance_progress() {
                        self.snapshot.send_replace(state.clone());
                        self.emit(BatchEvent::Progress {
                            batch_id: self.batch_id,
                            percent,
                        });
                    }
                }
            }
        }
        drop(results);

        match dispatcher.await {
            Ok(stats) => log::debug!("Batch {} dispatch finished: {:?}", self.batch_id, stats),
            Err(e) => log::error!("Batch {} dispatcher failed: {}", self.batch_id, e),
        }

        let stopped = !state.all_done();
        state.finished = true;
        if !stopped {
            state.percent = 100;
        }

        let summary = BatchSummary {
            batch_id: self.batch_id,
            total,
            completed: state.completed,
            hosts_online: state.hosts_online,
            open_ports: state.open_ports,
            stopped,
            duration: started.elapsed(),
            finished_at: Utc::now(),
        };

        log::info!(
            "Batch {} {}: {}/{} completed, {} online, {} open ports in {:.2?}",
            self.batch_id,
            if stopped { "stopped" } else { "completed" },
            summary.completed,
            summary.total,
            summary.hosts_online,
            summary.open_ports,
            summary.duration
        );

        self.snapshot.send_replace(state);
        self.emit(BatchEvent::Completed(summary.clone()));
        if !stopped {
            self.emit(BatchEvent::Progress {
                batch_id: self.batch_id,
                percent: 100,
            });
        }

        BatchReport {
            summary,
            results: collected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HostResult;
    use async_trait::async_trait;

    struct SlowWorker(Duration);

    #[async_trait]
    impl BatchWorker for SlowWorker {
        type Output = HostResult;

        async fn process(&self, target: Ipv4Addr) -> HostResult {
            tokio::time::sleep(self.0).await;
            let mut result = HostResult::offline(target);
            result.is_online = target.octets()[3] % 2 == 0;
            result
        }
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<BatchEvent<T>>) -> Vec<BatchEvent<T>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = BatchRunner::new(
            Arc::new(SlowWorker(Duration::ZERO)),
            4,
            Duration::from_millis(10),
        );
        let report = runner.launch(Vec::new(), tx).wait().await.unwrap();

        assert_eq!(report.summary.total, 0);
        assert!(!report.summary.stopped);
        let events = drain(&mut rx);
        assert!(matches!(events[0], BatchEvent::Started { total: 0, .. }));
        assert!(matches!(events[1], BatchEvent::Completed(_)));
    }

    #[tokio::test]
    async fn test_terminal_event_once_after_all_items() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let targets: Vec<Ipv4Addr> = (1..=12).map(|i| Ipv4Addr::new(10, 9, 0, i)).collect();
        let runner = BatchRunner::new(
            Arc::new(SlowWorker(Duration::from_millis(5))),
            4,
            Duration::from_millis(2),
        );
        let report = runner.launch(targets, tx).wait().await.unwrap();

        assert_eq!(report.results.len(), 12);
        assert_eq!(report.summary.hosts_online, 6);

        let events = drain(&mut rx);
        let completed_at: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, BatchEvent::Completed(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(completed_at.len(), 1);
        let items_before = events[..completed_at[0]]
            .iter()
            .filter(|e| matches!(e, BatchEvent::Item(_)))
            .count();
        assert_eq!(items_before, 12);

        let mut last = 0;
        for event in &events {
            if let BatchEvent::Progress { percent, .. } = event {
                assert!(*percent > last);
                last = *percent;
            }
        }
        assert_eq!(last, 100);
    }
}
