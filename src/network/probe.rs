//! Per-host availability and port probing

use super::arp::{ArpSource, SystemArpCache};
use super::dns;
use super::icmp::SystemPinger;
use super::socket::ConnectProber;
use super::HostResult;
use crate::config::DiscoveryConfig;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ports tried for TCP liveness when ping gets no answer
pub const LIVENESS_PORTS: [u16; 6] = [80, 443, 22, 135, 139, 445];

/// Stateless probe of one host
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self, host: Ipv4Addr, ports: &[u16]) -> HostResult;
}

/// Ping first, TCP liveness second, then the requested ports
pub struct NetworkProber {
    pinger: SystemPinger,
    connector: ConnectProber,
    arp: Option<Arc<dyn ArpSource>>,
    resolve_hostnames: bool,
}

impl NetworkProber {
    pub fn new(config: &DiscoveryConfig) -> Self {
        let arp: Option<Arc<dyn ArpSource>> = if config.lookup_mac {
            Some(Arc::new(SystemArpCache))
        } else {
            None
        };
        Self {
            pinger: SystemPinger::new(config.ping_timeout()),
            connector: ConnectProber::new(config.connect_timeout(), config.port_parallelism),
            arp,
            resolve_hostnames: config.resolve_hostnames,
        }
    }

    /// Replace the connect timeout (profiling uses a longer one)
    pub fn with_connect_timeout(mut self, timeout: Duration, parallelism: usize) -> Self {
        self.connector = ConnectProber::new(timeout, parallelism);
        self
    }

    /// Use a specific ARP source for MAC lookups
    pub fn with_arp_source(mut self, arp: Arc<dyn ArpSource>) -> Self {
        self.arp = Some(arp);
        self
    }

    async fn liveness(&self, host: Ipv4Addr) -> Option<Duration> {
        let start = Instant::now();
        let ping = self.pinger.ping(host).await;
        if ping.success {
            return Some(ping.rtt.unwrap_or_else(|| start.elapsed()));
        }
        if let Some(error) = ping.error {
            log::trace!("ping {} inconclusive: {}", host, error);
        }

        let port = self.connector.first_open(host, &LIVENESS_PORTS).await?;
        log::trace!("{} answered TCP liveness on {}", host, port);
        Some(start.elapsed())
    }
}

#[async_trait]
impl HostProbe for NetworkProber {
    async fn probe(&self, host: Ipv4Addr, ports: &[u16]) -> HostResult {
        let start = Instant::now();
        let alive = self.liveness(host).await;
        let open_ports = self.connector.open_ports(host, ports).await;

        let is_online = alive.is_some() || !open_ports.is_empty();
        let mut result = HostResult {
            address: host,
            is_online,
            open_ports,
            hostname: None,
            mac: None,
            response_time: alive.unwrap_or_else(|| start.elapsed()),
        };

        if is_online {
            if self.resolve_hostnames {
                result.hostname = dns::resolve_hostname(host).await;
            }
            if let Some(arp) = &self.arp {
                result.mac = arp.lookup(host).await;
            }
            log::debug!(
                "{} online, {} open ports",
                host,
                result.open_ports.len()
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_localhost_open_port_marks_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { while let Ok(_) = listener.accept().await {} });

        let mut config = DiscoveryConfig::default();
        config.resolve_hostnames = false;
        config.lookup_mac = false;
        config.ping_timeout_ms = 200;
        let prober = NetworkProber::new(&config);

        let result = prober.probe(Ipv4Addr::LOCALHOST, &[port]).await;
        assert!(result.is_online);
        assert_eq!(result.open_ports, vec![port]);
        assert!(result.hostname.is_none());
    }
}
