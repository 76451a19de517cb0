//! Per-host profiling pipeline

use super::HostProfile;
use crate::config::{DiscoveryConfig, MappingConfig};
use crate::intelligence::{
    classify_device, DeviceEvidence, NmapConfig, NmapEngine, OsFingerprinter, ServiceDetector,
    VendorDatabase, UNKNOWN,
};
use crate::network::{HostProbe, NetworkProber};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Produces the profile of one host
#[async_trait]
pub trait ProfileHost: Send + Sync {
    async fn profile(&self, target: Ipv4Addr) -> HostProfile;

    /// Vendor table used for ARP snapshot annotation
    fn vendors(&self) -> &VendorDatabase;
}

/// Probe, then fingerprint, enumerate services and classify
pub struct HostProfiler {
    prober: Arc<dyn HostProbe>,
    ports: Vec<u16>,
    os: OsFingerprinter,
    services: ServiceDetector,
    vendors: Arc<VendorDatabase>,
}

impl HostProfiler {
    pub fn new(
        prober: Arc<dyn HostProbe>,
        ports: Vec<u16>,
        os: OsFingerprinter,
        services: ServiceDetector,
        vendors: Arc<VendorDatabase>,
    ) -> Self {
        Self {
            prober,
            ports,
            os,
            services,
            vendors,
        }
    }

    /// Profiler wired to the real network, nmap (when enabled) and the
    /// configured vendor file
    pub fn from_config(discovery: &DiscoveryConfig, mapping: &MappingConfig) -> Self {
        let prober = NetworkProber::new(discovery)
            .with_connect_timeout(mapping.connect_timeout(), discovery.port_parallelism);
        let nmap = mapping
            .use_nmap
            .then(|| Arc::new(NmapEngine::new(NmapConfig::from(mapping))));
        let vendors = VendorDatabase::load_or_builtin(mapping.vendor_csv.as_deref());

        Self::new(
            Arc::new(prober),
            mapping.profile_ports.clone(),
            OsFingerprinter::new(nmap.clone()),
            ServiceDetector::new(nmap),
            Arc::new(vendors),
        )
    }
}

#[async_trait]
impl ProfileHost for HostProfiler {
    async fn profile(&self, target: Ipv4Addr) -> HostProfile {
        let host = self.prober.probe(target, &self.ports).await;
        if !host.is_online {
            return HostProfile::unreachable(host);
        }

        let os_guess = self.os.detect(target, &host.open_ports).await;
        let services = self.services.enumerate(target, &host.open_ports).await;
        let vendor = host
            .mac
            .as_deref()
            .map(|mac| self.vendors.lookup(mac))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let device_type = classify_device(&DeviceEvidence {
            ip: target,
            open_ports: &host.open_ports,
            vendor: &vendor,
        });

        log::debug!(
            "Profiled {}: os={}, vendor={}, device={}",
            target,
            os_guess,
            vendor,
            device_type
        );

        HostProfile {
            host,
            os_guess,
            vendor,
            device_type,
            services,
        }
    }

    fn vendors(&self) -> &VendorDatabase {
        &self.vendors
    }
}
