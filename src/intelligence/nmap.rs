//! nmap as an optional external fingerprinting facility

use crate::error::{OpsError, OpsResult};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;

/// Captured output of one nmap run
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// nmap-specific configuration
#[derive(Debug, Clone)]
pub struct NmapConfig {
    /// Path to nmap binary
    pub nmap_path: String,
    pub os_timeout: Duration,
    pub service_timeout: Duration,
}

impl Default for NmapConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            os_timeout: Duration::from_secs(30),
            service_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&crate::config::MappingConfig> for NmapConfig {
    fn from(config: &crate::config::MappingConfig) -> Self {
        Self {
            nmap_path: config.nmap_path.clone(),
            os_timeout: config.os_detection_timeout(),
            service_timeout: config.service_detection_timeout(),
        }
    }
}

/// nmap integration engine; probes for the binary once and caches the answer
#[derive(Debug)]
pub struct NmapEngine {
    config: NmapConfig,
    available: OnceCell<bool>,
}

impl NmapEngine {
    pub fn new(config: NmapConfig) -> Self {
        Self {
            config,
            available: OnceCell::new(),
        }
    }

    /// Whether the nmap binary can be executed
    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let probe = Command::new(&self.config.nmap_path)
                    .arg("--version")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status();
                match timeout(Duration::from_secs(5), probe).await {
                    Ok(Ok(status)) if status.success() => {
                        log::info!("nmap found, delegating OS and service detection");
                        true
                    }
                    _ => {
                        log::info!("nmap not available, using built-in heuristics");
                        false
                    }
                }
            })
            .await
    }

    /// `nmap -O --osscan-guess <ip>`
    pub async fn os_scan(&self, target: Ipv4Addr) -> OpsResult<CommandOutput> {
        let args = vec![
            "-O".to_string(),
            "--osscan-guess".to_string(),
            target.to_string(),
        ];
        self.execute(&args, self.config.os_timeout).await
    }

    /// `nmap -sV -p <ports> <ip>`
    pub async fn service_scan(&self, target: Ipv4Addr, ports: &[u16]) -> OpsResult<CommandOutput> {
        let port_list = ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let args = vec![
            "-sV".to_string(),
            "-p".to_string(),
            port_list,
            target.to_string(),
        ];
        self.execute(&args, self.config.service_timeout).await
    }

    async fn execute(&self, args: &[String], limit: Duration) -> OpsResult<CommandOutput> {
        let mut cmd = Command::new(&self.config.nmap_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("Running {} {}", self.config.nmap_path, args.join(" "));
        let output = timeout(limit, cmd.output())
            .await?
            .map_err(|e| OpsError::NetworkError(format!("Failed to execute nmap: {}", e)))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }
}
