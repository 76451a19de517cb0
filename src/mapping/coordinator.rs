//! Profiling batches, ARP snapshot and topology state

use super::profiler::ProfileHost;
use super::topology::{build_topology, TopologyNode};
use super::{HostProfile, MappingEvent, MappingMode};
use crate::audit::{AuditCategory, AuditEntry, AuditSink};
use crate::batch::{BatchEvent, BatchReport, BatchRunner, BatchWorker, RunningBatch};
use crate::config::MappingConfig;
use crate::error::OpsResult;
use crate::events::EventBus;
use crate::network::{ArpEntry, ArpSource};
use crate::output::{self, ExportFormat};
use crate::utils::TargetParser;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct ProfileWorker {
    profiler: Arc<dyn ProfileHost>,
}

#[async_trait]
impl BatchWorker for ProfileWorker {
    type Output = HostProfile;

    async fn process(&self, target: Ipv4Addr) -> HostProfile {
        self.profiler.profile(target).await
    }
}

struct ActiveMapping {
    batch: RunningBatch<HostProfile>,
    forwarder: JoinHandle<()>,
    /// Cancelled once topology and the terminal event are published
    relayed: CancellationToken,
}

impl ActiveMapping {
    fn is_running(&self) -> bool {
        !(self.batch.is_finished() && self.forwarder.is_finished())
    }

    async fn finish(self) -> Option<BatchReport<HostProfile>> {
        let report = self.batch.wait().await;
        if let Err(e) = self.forwarder.await {
            log::error!("Mapping event forwarder failed: {}", e);
        }
        report
    }
}

#[derive(Default)]
struct MappingState {
    active: Option<ActiveMapping>,
    last_report: Option<BatchReport<HostProfile>>,
    mode: Option<MappingMode>,
    /// Online hosts of the current run, in completion order
    profiles: Vec<HostProfile>,
    topology: Vec<TopologyNode>,
    arp_table: Vec<ArpEntry>,
}

/// Runs one profiling batch at a time and keeps its results
pub struct MappingCoordinator {
    profiler: Arc<dyn ProfileHost>,
    arp: Arc<dyn ArpSource>,
    config: MappingConfig,
    parser: TargetParser,
    events: EventBus<MappingEvent>,
    audit: Arc<dyn AuditSink>,
    state: Arc<Mutex<MappingState>>,
}

impl MappingCoordinator {
    pub fn new(
        profiler: Arc<dyn ProfileHost>,
        arp: Arc<dyn ArpSource>,
        config: MappingConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            profiler,
            arp,
            config,
            parser: TargetParser::default(),
            events,
            audit,
            state: Arc::new(Mutex::new(MappingState::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.events.subscribe()
    }

    /// Profile hosts currently in the ARP cache with the quick pool
    pub async fn start_quick_mapping(&self) -> OpsResult<bool> {
        let entries = self.annotated_arp_table().await;
        let targets: Vec<Ipv4Addr> = entries.iter().map(|entry| entry.ip).collect();
        if targets.is_empty() {
            log::warn!("ARP cache is empty, nothing to map");
        }
        self.launch(targets, MappingMode::Quick, Some(entries), "arp-cache")
            .await
    }

    /// Profile every host of `subnet` with the full pool
    pub async fn start_full_mapping(&self, subnet: &str) -> OpsResult<bool> {
        let targets = self.parser.expand_async(subnet).await;
        let entries = self.annotated_arp_table().await;
        self.launch(targets, MappingMode::Full, Some(entries), subnet)
            .await
    }

    /// Profile an explicit target list
    pub async fn start_mapping(&self, targets: Vec<Ipv4Addr>, mode: MappingMode) -> OpsResult<bool> {
        let label = format!("{} hosts", targets.len());
        self.launch(targets, mode, None, &label).await
    }

    async fn annotated_arp_table(&self) -> Vec<ArpEntry> {
        let vendors = self.profiler.vendors();
        self.arp
            .snapshot()
            .await
            .into_iter()
            .map(|mut entry| {
                entry.vendor = vendors.lookup(&entry.mac);
                entry
            })
            .collect()
    }

    async fn launch(
        &self,
        targets: Vec<Ipv4Addr>,
        mode: MappingMode,
        arp_table: Option<Vec<ArpEntry>>,
        label: &str,
    ) -> OpsResult<bool> {
        let mut state = self.state.lock().await;
        if state.active.as_ref().map_or(false, ActiveMapping::is_running) {
            log::warn!("Mapping already in progress, ignoring start request");
            return Ok(false);
        }

        let pool_size = match mode {
            MappingMode::Quick => self.config.quick_pool_size,
            MappingMode::Full => self.config.full_pool_size,
        };
        log::info!(
            "Starting {} mapping of {} hosts with {} workers",
            mode,
            targets.len(),
            pool_size
        );
        self.audit.record(AuditEntry::new(
            AuditCategory::Mapping,
            format!("{} mapping started", mode),
            label,
            "running",
        ));

        state.mode = Some(mode);
        state.profiles.clear();
        state.topology.clear();
        if let Some(entries) = arp_table {
            state.arp_table = entries.clone();
            self.events.publish(MappingEvent::ArpTableUpdated(entries));
        }

        let worker = Arc::new(ProfileWorker {
            profiler: Arc::clone(&self.profiler),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let batch = BatchRunner::new(worker, pool_size, self.config.progress_interval())
            .launch(targets, tx);

        let relayed = CancellationToken::new();
        let forwarder = tokio::spawn(forward_events(
            rx,
            mode,
            self.events.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.audit),
            label.to_string(),
            relayed.clone(),
        ));

        state.active = Some(ActiveMapping {
            batch,
            forwarder,
            relayed,
        });
        Ok(true)
    }

    pub async fn is_active(&self) -> bool {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map_or(false, ActiveMapping::is_running)
    }

    /// Cancel pending hosts; in-flight profiles finish and are kept
    pub async fn stop(&self) -> Option<BatchReport<HostProfile>> {
        let (batch_id, relayed) = {
            let state = self.state.lock().await;
            let current = state.active.as_ref().filter(|a| a.is_running())?;
            log::info!("Stopping mapping batch {}", current.batch.batch_id());
            current.batch.cancel();
            (current.batch.batch_id(), current.relayed.clone())
        };
        self.collect(batch_id, relayed).await
    }

    /// Wait until the current mapping has built its topology; with no
    /// mapping running, returns the last report
    pub async fn wait(&self) -> Option<BatchReport<HostProfile>> {
        let (batch_id, relayed) = {
            let state = self.state.lock().await;
            match state.active.as_ref() {
                Some(current) => (current.batch.batch_id(), current.relayed.clone()),
                None => return state.last_report.clone(),
            }
        };
        self.collect(batch_id, relayed).await
    }

    async fn collect(&self, batch_id: Uuid, relayed: CancellationToken) -> Option<BatchReport<HostProfile>> {
        // The forwarder takes the state lock itself, so it must be done first
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

    /// Online host profiles of the current or last run
    pub async fn profiles(&self) -> Vec<HostProfile> {
        self.state.lock().await.profiles.clone()
    }

    pub async fn topology(&self) -> Vec<TopologyNode> {
        self.state.lock().await.topology.clone()
    }

    /// ARP snapshot taken at the start of the last mapping
    pub async fn arp_table(&self) -> Vec<ArpEntry> {
        self.state.lock().await.arp_table.clone()
    }

    pub async fn mode(&self) -> Option<MappingMode> {
        self.state.lock().await.mode
    }

    /// Write the current profile set to `path`
    pub async fn export(&self, format: ExportFormat, path: &Path) -> OpsResult<()> {
        let profiles = self.profiles().await;
        let result = output::export_profiles(&profiles, format, path);
        let status = if result.is_ok() { "completed" } else { "failed" };
        self.audit.record(AuditEntry::new(
            AuditCategory::Export,
            format!("export {} hosts as {}", profiles.len(), format),
            path.display().to_string(),
            status,
        ));
        result
    }
}

async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<BatchEvent<HostProfile>>,
    mode: MappingMode,
    bus: EventBus<MappingEvent>,
    state: Arc<Mutex<MappingState>>,
    audit: Arc<dyn AuditSink>,
    label: String,
    relayed: CancellationToken,
) {
    let _relayed = relayed.drop_guard();
    while let Some(event) = rx.recv().await {
        match event {
            BatchEvent::Started { batch_id, total } => {
                bus.publish(MappingEvent::Started { batch_id, total, mode });
            }
            BatchEvent::Item(profile) => {
                if profile.is_online() {
                    state.lock().await.profiles.push(profile.clone());
                    bus.publish(MappingEvent::HostProfiled(profile));
                }
            }
            BatchEvent::Progress { batch_id, percent } => {
                bus.publish(MappingEvent::Progress { batch_id, percent });
            }
            BatchEvent::Completed(summary) => {
                let topology = {
                    let mut state = state.lock().await;
                    let topology = build_topology(&state.profiles);
                    state.topology = topology.clone();
                    topology
                };
                let status = if summary.stopped { "stopped" } else { "completed" };
                audit.record(AuditEntry::new(
                    AuditCategory::Mapping,
                    format!("{} mapping {}: {} hosts profiled", mode, status, summary.hosts_online),
                    &label,
                    status,
                ));
                bus.publish(MappingEvent::TopologyBuilt(topology));
                bus.publish(MappingEvent::Completed(summary));
            }
        }
    }
}
