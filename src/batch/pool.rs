//! Bounded worker pool for one batch

use super::BatchWorker;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What the dispatcher managed to hand out before it returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub skipped: usize,
    pub panicked: usize,
}

/// Semaphore-bounded pool owned by one coordinator's batch
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `worker` over `targets`, at most `size` at a time
    ///
    /// Once the token is cancelled no new target is started; work already
    /// in flight runs to completion and still reports its result.
    pub async fn dispatch<W: BatchWorker>(
        self,
        worker: Arc<W>,
        targets: Vec<Ipv4Addr>,
        results: mpsc::Sender<W::Output>,
    ) -> DispatchStats {
        let total = targets.len();
        let mut stats = DispatchStats::default();
        let mut in_flight = JoinSet::new();

        for target in targets {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Arc::clone(&worker);
            let results = results.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let output = worker.process(target).await;
                if results.send(output).await.is_err() {
                    log::debug!("Aggregator gone, dropping result for {}", target);
                }
            });
            stats.dispatched += 1;
        }
        stats.skipped = total - stats.dispatched;
        drop(results);

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                stats.panicked += 1;
                log::error!("Batch worker task failed: {}", e);
            }
        }

        if stats.skipped > 0 {
            log::info!(
                "Batch stopped: {} targets dispatched, {} skipped",
                stats.dispatched,
                stats.skipped
            );
        }
        stats
    }
}
