//! Network mapping: profiling discovered hosts and building the topology
//!
//! The [`MappingCoordinator`] runs profiling batches on the shared batch
//! engine. Each host is probed, then classified (OS, services, vendor,
//! device type); online hosts form the profile set that topology and export
//! work from.

pub mod coordinator;
pub mod profiler;
pub mod topology;

use crate::batch::{BatchItem, BatchSummary};
use crate::intelligence::{DeviceType, ServiceInfo, UNKNOWN};
use crate::network::{ArpEntry, HostResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use coordinator::MappingCoordinator;
pub use profiler::{HostProfiler, ProfileHost};
pub use topology::{build_topology, TopologyNode};

/// A probed and classified host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    #[serde(flatten)]
    pub host: HostResult,
    pub os_guess: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub services: Vec<ServiceInfo>,
}

impl HostProfile {
    /// Profile of a host that gave no sign of life
    pub fn unreachable(host: HostResult) -> Self {
        Self {
            host,
            os_guess: UNKNOWN.to_string(),
            vendor: UNKNOWN.to_string(),
            device_type: DeviceType::Unknown,
            services: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.host.is_online
    }
}

impl BatchItem for HostProfile {
    fn is_online(&self) -> bool {
        self.host.is_online
    }

    fn open_port_count(&self) -> usize {
        self.host.open_ports.len()
    }
}

/// How a mapping batch picks its targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    /// Hosts currently in the ARP cache
    Quick,
    /// Every host of a subnet
    Full,
}

impl fmt::Display for MappingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingMode::Quick => f.write_str("quick"),
            MappingMode::Full => f.write_str("full"),
        }
    }
}

/// Events published by [`MappingCoordinator`]
#[derive(Debug, Clone)]
pub enum MappingEvent {
    Started {
        batch_id: Uuid,
        total: usize,
        mode: MappingMode,
    },
    ArpTableUpdated(Vec<ArpEntry>),
    HostProfiled(HostProfile),
    Progress {
        batch_id: Uuid,
        percent: u8,
    },
    TopologyBuilt(Vec<TopologyNode>),
    Completed(BatchSummary),
}
