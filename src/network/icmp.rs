//! ICMP reachability through the system `ping` utility
//!
//! Raw ICMP sockets need elevated privileges; the platform ping binary is
//! setuid or capability-enabled almost everywhere, so we shell out to it.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Outcome of one echo request
#[derive(Debug, Clone)]
pub struct PingResult {
    pub target: Ipv4Addr,
    pub success: bool,
    pub rtt: Option<Duration>,
    pub error: Option<String>,
}

/// Pinger backed by the platform ping binary
#[derive(Debug, Clone)]
pub struct SystemPinger {
    timeout: Duration,
}

impl Default for SystemPinger {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl SystemPinger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Send a single echo request and wait at most the configured timeout
    pub async fn ping(&self, target: Ipv4Addr) -> PingResult {
        let start = Instant::now();
        let mut command = self.command(target);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // The utility has its own wait; allow a little slack for process start.
        let budget = self.timeout + Duration::from_millis(500);
        match timeout(budget, command.output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let success = reply_received(output.status.success(), &stdout);
                PingResult {
                    target,
                    success,
                    rtt: success.then(|| start.elapsed()),
                    error: None,
                }
            }
            Ok(Err(e)) => PingResult {
                target,
                success: false,
                rtt: None,
                error: Some(format!("ping unavailable: {}", e)),
            },
            Err(_) => PingResult {
                target,
                success: false,
                rtt: None,
                error: Some("Timeout".to_string()),
            },
        }
    }

    #[cfg(windows)]
    fn command(&self, target: Ipv4Addr) -> Command {
        let mut command = Command::new("ping");
        command
            .arg("-n")
            .arg("1")
            .arg("-w")
            .arg(self.timeout.as_millis().to_string())
            .arg(target.to_string());
        command
    }

    #[cfg(not(windows))]
    fn command(&self, target: Ipv4Addr) -> Command {
        let wait_secs = self.timeout.as_secs().max(1);
        let mut command = Command::new("ping");
        command
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg(target.to_string());
        command
    }
}

/// Windows ping exits 0 for "destination unreachable" replies, so only a
/// TTL line proves an echo reply there.
fn reply_received(exit_ok: bool, stdout: &str) -> bool {
    if cfg!(windows) {
        stdout.contains("TTL=")
    } else {
        exit_ok
    }
}
