//! Integration tests for discovery batches

use async_trait::async_trait;
use netsecops::{
    audit::{ChannelAuditSink, NullAuditSink},
    config::DiscoveryConfig,
    network::{HostProbe, HostResult},
    BatchEvent, DiscoveryCoordinator, DiscoveryEvent,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Even last octets are online with every requested port open
struct FakeProbe {
    delay: Duration,
    /// Scale the delay by `21 - last octet` so low hosts answer last
    reversed: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeProbe {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            reversed: false,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn reversed(step: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: step,
            reversed: true,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn delay_for(&self, host: Ipv4Addr) -> Duration {
        if self.reversed {
            self.delay * u32::from(21u8.saturating_sub(host.octets()[3]))
        } else {
            self.delay
        }
    }
}

#[async_trait]
impl HostProbe for FakeProbe {
    async fn probe(&self, host: Ipv4Addr, ports: &[u16]) -> HostResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay_for(host)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut result = HostResult::offline(host);
        if host.octets()[3] % 2 == 0 {
            result.is_online = true;
            result.open_ports = ports.to_vec();
        }
        result
    }
}

fn config() -> DiscoveryConfig {
    DiscoveryConfig::default().with_progress_interval(Duration::from_millis(10))
}

fn drain(rx: &mut broadcast::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_batch_emits_every_host_then_completes_once() {
    let probe = FakeProbe::new(Duration::from_millis(5));
    let coordinator = DiscoveryCoordinator::new(probe.clone(), config(), Arc::new(NullAuditSink));
    let mut rx = coordinator.subscribe();

    assert!(coordinator.start("10.0.0.1-20", "22,80", 4).await.unwrap());
    let report = timeout(Duration::from_secs(10), coordinator.wait())
        .await
        .expect("batch should finish")
        .expect("report");

    assert_eq!(report.summary.total, 20);
    assert_eq!(report.summary.completed, 20);
    assert_eq!(report.summary.hosts_online, 10);
    assert_eq!(report.summary.open_ports, 20);
    assert!(!report.summary.stopped);
    assert!(probe.peak.load(Ordering::SeqCst) <= 4);

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(BatchEvent::Started { total: 20, .. })));

    let completed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, BatchEvent::Completed(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(completed.len(), 1);

    let items_after_completion = events[completed[0]..]
        .iter()
        .filter(|e| matches!(e, BatchEvent::Item(_)))
        .count();
    assert_eq!(items_after_completion, 0);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress.last(), Some(&100));
    assert!(matches!(events.last(), Some(BatchEvent::Progress { percent: 100, .. })));
}

#[tokio::test]
async fn test_reverse_arrival_still_completes_once() {
    let probe = FakeProbe::reversed(Duration::from_millis(10));
    let coordinator = DiscoveryCoordinator::new(probe, config(), Arc::new(NullAuditSink));
    let mut rx = coordinator.subscribe();

    assert!(coordinator.start("10.0.3.1-20", "443", 20).await.unwrap());
    let report = timeout(Duration::from_secs(10), coordinator.wait())
        .await
        .expect("batch should finish")
        .expect("report");
    assert_eq!(report.summary.completed, 20);
    assert!(!report.summary.stopped);

    let events = drain(&mut rx);
    let arrival: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::Item(host) => Some(host.address.octets()[3]),
            _ => None,
        })
        .collect();
    assert_eq!(arrival.len(), 20);
    assert_eq!(arrival.first(), Some(&20));
    assert_eq!(arrival.last(), Some(&1));

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
    assert_eq!(items_before, 20);
}

#[tokio::test]
async fn test_pending_wait_keeps_batch_active() {
    let probe = FakeProbe::new(Duration::from_millis(50));
    let coordinator = Arc::new(DiscoveryCoordinator::new(probe, config(), Arc::new(NullAuditSink)));

    assert!(coordinator.start("10.0.4.1-40", "80", 1).await.unwrap());
    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(coordinator.is_active().await);
    assert!(!coordinator.start("10.0.5.1-3", "80", 1).await.unwrap());

    let stopped = timeout(Duration::from_secs(5), coordinator.stop())
        .await
        .expect("stop should not hang")
        .expect("running batch");
    assert!(stopped.summary.stopped);
    assert_eq!(stopped.summary.total, 40);
    assert!(stopped.summary.completed < 40);
    assert!(stopped.results.iter().all(|h| h.address.octets()[2] == 4));

    let waited = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should resolve")
        .unwrap()
        .expect("report for the waited batch");
    assert_eq!(waited.summary.batch_id, stopped.summary.batch_id);
    assert!(!coordinator.is_active().await);
}

#[tokio::test]
async fn test_start_while_active_is_ignored() {
    let probe = FakeProbe::new(Duration::from_millis(100));
    let coordinator = DiscoveryCoordinator::new(probe, config(), Arc::new(NullAuditSink));

    assert!(coordinator.start("10.0.1.1-10", "80", 2).await.unwrap());
    assert!(coordinator.is_active().await);
    assert!(!coordinator.start("10.0.2.1-10", "80", 2).await.unwrap());

    let report = coordinator.stop().await.expect("running batch");
    assert!(report.results.iter().all(|h| h.address.octets()[2] == 1));
    assert!(!coordinator.is_active().await);
}

#[tokio::test]
async fn test_stop_forces_single_terminal_event() {
    let probe = FakeProbe::new(Duration::from_millis(150));
    let coordinator = DiscoveryCoordinator::new(probe, config(), Arc::new(NullAuditSink));
    let mut rx = coordinator.subscribe();

    coordinator.start("192.168.50.0/26", "22", 2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = timeout(Duration::from_secs(5), coordinator.stop())
        .await
        .expect("stop should not hang")
        .expect("report");
    assert!(report.summary.stopped);
    assert!(report.summary.completed < report.summary.total);
    assert_eq!(report.summary.completed, report.results.len());

    let events = drain(&mut rx);
    let terminal = events
        .iter()
        .filter(|e| matches!(e, BatchEvent::Completed(_)))
        .count();
    assert_eq!(terminal, 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, BatchEvent::Progress { percent: 100, .. })));

    // Nothing to stop any more
    assert!(coordinator.stop().await.is_none());
}

#[tokio::test]
async fn test_invalid_tokens_are_dropped() {
    let probe = FakeProbe::new(Duration::ZERO);
    let coordinator = DiscoveryCoordinator::new(probe, config(), Arc::new(NullAuditSink));

    coordinator
        .start("10.9.9.2, not-a-host; 10.9.9.300 10.9.9.2", "80,0,70000,90-85", 1)
        .await
        .unwrap();
    let report = coordinator.wait().await.unwrap();

    assert_eq!(report.summary.total, 1);
    assert_eq!(report.results[0].address, Ipv4Addr::new(10, 9, 9, 2));
    assert_eq!(report.results[0].open_ports, vec![80]);
}

#[tokio::test]
async fn test_empty_target_completes_immediately() {
    let probe = FakeProbe::new(Duration::ZERO);
    let (audit, mut audit_rx) = ChannelAuditSink::new();
    let coordinator = DiscoveryCoordinator::new(probe, config(), Arc::new(audit));
    let mut rx = coordinator.subscribe();

    assert!(coordinator.start("", "80", 10).await.unwrap());
    let report = coordinator.wait().await.unwrap();
    assert_eq!(report.summary.total, 0);
    assert!(!report.summary.stopped);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, BatchEvent::Completed(_))));

    let first = audit_rx.recv().await.unwrap();
    assert_eq!(first.status, "running");
    let second = audit_rx.recv().await.unwrap();
    assert_eq!(second.status, "completed");
}
