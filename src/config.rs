//! Configuration module for netsecops

use crate::error::{OpsError, OpsResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling on the discovery worker pool
pub const MAX_DISCOVERY_CONCURRENCY: usize = 100;

/// Top-level configuration, loaded from `~/.netsecops.toml` when present
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub discovery: DiscoveryConfig,
    pub mapping: MappingConfig,
    pub execution: ExecutionConfig,
    /// Credential entries for the in-memory credential store
    pub credentials: Vec<CredentialEntry>,
}

/// Settings for host discovery batches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Worker pool size used when the caller does not specify one
    pub default_concurrency: usize,
    /// Upper clamp applied to any requested pool size
    pub max_concurrency: usize,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// System ping timeout in milliseconds
    pub ping_timeout_ms: u64,
    /// Progress recomputation period in milliseconds
    pub progress_interval_ms: u64,
    /// Parallel connects per host when testing its port list
    pub port_parallelism: usize,
    /// Reverse-resolve hostnames of online hosts
    pub resolve_hostnames: bool,
    /// Look up MAC addresses of online hosts in the ARP cache
    pub lookup_mac: bool,
    /// Capacity of the broadcast event channel
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 50,
            max_concurrency: MAX_DISCOVERY_CONCURRENCY,
            connect_timeout_ms: 800,
            ping_timeout_ms: 1000,
            progress_interval_ms: 500,
            port_parallelism: 32,
            resolve_hostnames: true,
            lookup_mac: true,
            event_capacity: 1024,
        }
    }
}

impl DiscoveryConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get ping timeout as Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Clamp a requested pool size to `[1, max_concurrency]`
    pub fn clamp_concurrency(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_concurrency.max(1))
    }

    /// Set the progress interval
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Settings for host profiling (mapping) batches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Pool size for quick (ARP sourced) mapping
    pub quick_pool_size: usize,
    /// Pool size for full subnet mapping
    pub full_pool_size: usize,
    /// TCP connect timeout in milliseconds while profiling
    pub connect_timeout_ms: u64,
    /// Ports tested on every profiled host
    pub profile_ports: Vec<u16>,
    /// Delegate OS and service detection to nmap when it is installed
    pub use_nmap: bool,
    /// nmap executable name or path
    pub nmap_path: String,
    pub os_detection_timeout_secs: u64,
    pub service_detection_timeout_secs: u64,
    /// Optional `OUI,VendorName` CSV merged into the vendor table
    pub vendor_csv: Option<PathBuf>,
    pub progress_interval_ms: u64,
    pub event_capacity: usize,
}

/// Common service ports tested during profiling
pub const PROFILE_PORTS: [u16; 20] = [
    21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 443, 445, 993, 995, 1433, 3306, 3389, 5432, 5900,
    8080,
];

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            quick_pool_size: 10,
            full_pool_size: 50,
            connect_timeout_ms: 1000,
            profile_ports: PROFILE_PORTS.to_vec(),
            use_nmap: true,
            nmap_path: "nmap".to_string(),
            os_detection_timeout_secs: 30,
            service_detection_timeout_secs: 15,
            vendor_csv: None,
            progress_interval_ms: 500,
            event_capacity: 1024,
        }
    }
}

impl MappingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn os_detection_timeout(&self) -> Duration {
        Duration::from_secs(self.os_detection_timeout_secs)
    }

    pub fn service_detection_timeout(&self) -> Duration {
        Duration::from_secs(self.service_detection_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Disable or enable nmap delegation
    pub fn with_nmap(mut self, enabled: bool) -> Self {
        self.use_nmap = enabled;
        self
    }
}

/// Settings for the remote execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum jobs with a live child process at once, before the
    /// platform process budget is applied
    pub max_concurrent_jobs: usize,
    /// Time allowed for a child process to start, in milliseconds
    pub start_timeout_ms: u64,
    /// Time allowed for a killed child to exit, in milliseconds
    pub kill_timeout_ms: u64,
    /// `ConnectTimeout` passed to ssh/scp, in seconds
    pub ssh_connect_timeout_secs: u64,
    /// Output retained per job; later lines are dropped beyond this
    pub max_output_bytes: usize,
    pub event_capacity: usize,
}

fn default_max_jobs() -> usize {
    num_cpus::get().saturating_mul(4).clamp(4, 64)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_jobs(),
            start_timeout_ms: 5000,
            kill_timeout_ms: 3000,
            ssh_connect_timeout_secs: 10,
            max_output_bytes: 1024 * 1024,
            event_capacity: 1024,
        }
    }
}

impl ExecutionConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Set the maximum number of concurrently running jobs
    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs;
        self
    }
}

/// One credential as written in the config file
///
/// The secret itself never lives in the file: `secret_env` names the
/// environment variable holding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub name: String,
    /// Exact address, `a.b.c.*` wildcard, CIDR, or `*`
    pub host_pattern: String,
    pub username: String,
    pub secret_env: String,
    #[serde(default)]
    pub kind: crate::execution::credentials::CredentialKind,
    /// Hosts for which this credential is the explicit default
    #[serde(default)]
    pub default_for: Vec<String>,
}

impl OpsConfig {
    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> OpsResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            OpsError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: OpsConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".netsecops.toml")
    }

    /// Load configuration from default locations
    pub fn load_default_config() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::from_toml_file(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> OpsResult<()> {
        let d = &self.discovery;
        if d.max_concurrency == 0 || d.max_concurrency > MAX_DISCOVERY_CONCURRENCY {
            return Err(OpsError::ConfigError(format!(
                "discovery.max_concurrency must be between 1 and {}",
                MAX_DISCOVERY_CONCURRENCY
            )));
        }
        if d.connect_timeout_ms == 0 || d.ping_timeout_ms == 0 {
            return Err(OpsError::ConfigError(
                "discovery timeouts must be greater than 0".to_string(),
            ));
        }
        if d.progress_interval_ms == 0 || self.mapping.progress_interval_ms == 0 {
            return Err(OpsError::ConfigError(
                "progress_interval_ms must be greater than 0".to_string(),
            ));
        }
        if d.port_parallelism == 0 {
            return Err(OpsError::ConfigError(
                "discovery.port_parallelism must be greater than 0".to_string(),
            ));
        }
        if self.mapping.quick_pool_size == 0 || self.mapping.full_pool_size == 0 {
            return Err(OpsError::ConfigError(
                "mapping pool sizes must be greater than 0".to_string(),
            ));
        }
        if self.mapping.profile_ports.contains(&0) {
            return Err(OpsError::ConfigError(
                "mapping.profile_ports cannot contain port 0".to_string(),
            ));
        }
        if self.execution.max_concurrent_jobs == 0 {
            return Err(OpsError::ConfigError(
                "execution.max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        for entry in &self.credentials {
            if entry.host_pattern.trim().is_empty() || entry.secret_env.trim().is_empty() {
                return Err(OpsError::ConfigError(format!(
                    "credential '{}' needs host_pattern and secret_env",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}
