//! Network probing: liveness, port tests, ARP and reverse DNS

pub mod arp;
pub mod dns;
pub mod icmp;
pub mod probe;
pub mod socket;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

pub use arp::{ArpEntry, ArpSource, SystemArpCache};
pub use probe::{HostProbe, NetworkProber, LIVENESS_PORTS};

/// Result of probing one host; immutable once produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResult {
    pub address: Ipv4Addr,
    pub is_online: bool,
    /// Sorted subset of the requested ports
    pub open_ports: Vec<u16>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    #[serde(with = "duration_ms")]
    pub response_time: Duration,
}

impl HostResult {
    /// Offline result with no evidence
    pub fn offline(address: Ipv4Addr) -> Self {
        Self {
            address,
            is_online: false,
            open_ports: Vec::new(),
            hostname: None,
            mac: None,
            response_time: Duration::ZERO,
        }
    }

    /// Reverse-resolved name, falling back to the address
    pub fn display_name(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
