//! Host discovery batches

use crate::audit::{AuditCategory, AuditEntry, AuditSink};
use crate::batch::{BatchEvent, BatchReport, BatchRunner, BatchSnapshot, BatchWorker, RunningBatch};
use crate::config::DiscoveryConfig;
use crate::error::OpsResult;
use crate::events::EventBus;
use crate::network::{HostProbe, HostResult};
use crate::utils::{parse_ports, TargetParser};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Events published by [`DiscoveryCoordinator`]
pub type DiscoveryEvent = BatchEvent<HostResult>;

/// Adapts a [`HostProbe`] to the batch engine for one port list
struct ProbeWorker {
    prober: Arc<dyn HostProbe>,
    ports: Arc<Vec<u16>>,
}

#[async_trait]
impl BatchWorker for ProbeWorker {
    type Output = HostResult;

    async fn process(&self, target: Ipv4Addr) -> HostResult {
        self.prober.probe(target, &self.ports).await
    }
}

struct ActiveDiscovery {
    batch: RunningBatch<HostResult>,
    forwarder: JoinHandle<()>,
    /// Cancelled once the forwarder has published the terminal event
    relayed: CancellationToken,
}

impl ActiveDiscovery {
    fn is_running(&self) -> bool {
        !(self.batch.is_finished() && self.forwarder.is_finished())
    }

    async fn finish(self) -> Option<BatchReport<HostResult>> {
        let report = self.batch.wait().await;
        if let Err(e) = self.forwarder.await {
            log::error!("Discovery event forwarder failed: {}", e);
        }
        report
    }
}

/// Runs one discovery batch at a time over a bounded worker pool
pub struct DiscoveryCoordinator {
    prober: Arc<dyn HostProbe>,
    config: DiscoveryConfig,
    parser: TargetParser,
    events: EventBus<DiscoveryEvent>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<DiscoveryState>,
}

#[derive(Default)]
struct DiscoveryState {
    /// Stays here until its terminal event has been relayed
    active: Option<ActiveDiscovery>,
    last_report: Option<BatchReport<HostResult>>,
}

impl DiscoveryCoordinator {
    pub fn new(prober: Arc<dyn HostProbe>, config: DiscoveryConfig, audit: Arc<dyn AuditSink>) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            prober,
            config,
            parser: TargetParser::default(),
            events,
            audit,
            state: Mutex::new(DiscoveryState::default()),
        }
    }

    /// Use a custom target parser (e.g. with hostname resolution)
    pub fn with_target_parser(mut self, parser: TargetParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Start a batch; returns `false` without side effects when one is
    /// already running
    pub async fn start(&self, target_spec: &str, port_spec: &str, concurrency: usize) -> OpsResult<bool> {
        let targets = self.parser.expand_async(target_spec).await;

        let mut state = self.state.lock().await;
        if state.active.as_ref().map_or(false, ActiveDiscovery::is_running) {
            log::warn!("Discovery already in progress, ignoring start request");
            return Ok(false);
        }

        let ports = parse_ports(port_spec);
        let pool_size = self.config.clamp_concurrency(concurrency);

        log::info!(
            "Starting discovery of {} hosts x {} ports with {} workers",
            targets.len(),
            ports.len(),
            pool_size
        );
        self.audit.record(AuditEntry::new(
            AuditCategory::Discovery,
            "scan started",
            target_spec,
            "running",
        ));

        let worker = Arc::new(ProbeWorker {
            prober: Arc::clone(&self.prober),
            ports: Arc::new(ports),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let batch = BatchRunner::new(worker, pool_size, self.config.progress_interval()).launch(targets, tx);

        let relayed = CancellationToken::new();
        let forwarder = tokio::spawn(forward_events(
            rx,
            self.events.clone(),
            Arc::clone(&self.audit),
            target_spec.to_string(),
            relayed.clone(),
        ));

        state.active = Some(ActiveDiscovery {
            batch,
            forwarder,
            relayed,
        });
        Ok(true)
    }

    /// Whether a batch is currently running
    pub async fn is_active(&self) -> bool {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map_or(false, ActiveDiscovery::is_running)
    }

    /// Live counters of the batch not yet collected by `wait` or `stop`
    pub async fn snapshot(&self) -> Option<BatchSnapshot> {
        self.state.lock().await.active.as_ref().map(|a| a.batch.snapshot())
    }

    /// Cancel pending work, let in-flight probes finish, then force the
    /// terminal event. No-op when nothing is running.
    pub async fn stop(&self) -> Option<BatchReport<HostResult>> {
        let (batch_id, relayed) = {
            let state = self.state.lock().await;
            let current = state.active.as_ref().filter(|a| a.is_running())?;
            log::info!("Stopping discovery batch {}", current.batch.batch_id());
            current.batch.cancel();
            (current.batch.batch_id(), current.relayed.clone())
        };
        self.collect(batch_id, relayed).await
    }

    /// Wait for the current batch to reach its terminal event; with no
    /// batch running, returns the last report
    pub async fn wait(&self) -> Option<BatchReport<HostResult>> {
        let (batch_id, relayed) = {
            let state = self.state.lock().await;
            match state.active.as_ref() {
                Some(current) => (current.batch.batch_id(), current.relayed.clone()),
                None => return state.last_report.clone(),
            }
        };
        self.collect(batch_id, relayed).await
    }

    async fn collect(&self, batch_id: Uuid, relayed: CancellationToken) -> Option<BatchReport<HostResult>> {
        relayed.cancelled().await;

        let mut state = self.state.lock().await;
        let owned = state
            .active
            .as_ref()
            .map_or(false, |a| a.batch.batch_id() == batch_id);
        if owned {
            if let Some(current) = state.active.take() {
                state.last_report = current.finish().await;
            }
        }
        state
            .last_report
            .as_ref()
            .filter(|report| report.summary.batch_id == batch_id)
            .cloned()
    }
}

async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    bus: EventBus<DiscoveryEvent>,
    audit: Arc<dyn AuditSink>,
    target_spec: String,
    relayed: CancellationToken,
) {
    let _relayed = relayed.drop_guard();
    while let Some(event) = rx.recv().await {
        match &event {
            BatchEvent::Item(host) if host.is_online => {
                log::info!("Host discovered: {} ({} open ports)", host.address, host.open_ports.len());
            }
            BatchEvent::Completed(summary) => {
                let status = if summary.stopped { "stopped" } else { "completed" };
                audit.record(AuditEntry::new(
                    AuditCategory::Discovery,
                    format!("scan {}: {} hosts online", status, summary.hosts_online),
                    &target_spec,
                    status,
                ));
            }
            _ => {}
        }
        bus.publish(event);
    }
}
