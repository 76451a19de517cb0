//! Read-only view of the local ARP cache
//!
//! Used for MAC lookup of discovered hosts and as the target source for
//! quick mapping. Nothing here sends ARP traffic.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const ARP_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d{1,3}){3})").expect("ipv4 pattern is valid"));

static MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9a-fA-F]{1,2}(?:[:-][0-9a-fA-F]{1,2}){5})").expect("mac pattern is valid")
});

/// One ARP cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    /// Upper-case, colon separated
    pub mac: String,
    pub vendor: String,
    /// `dynamic` or `static`
    pub entry_type: String,
}

/// Source of ARP snapshots
#[async_trait]
pub trait ArpSource: Send + Sync {
    async fn snapshot(&self) -> Vec<ArpEntry>;

    async fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.snapshot()
            .await
            .into_iter()
            .find(|entry| entry.ip == ip)
            .map(|entry| entry.mac)
    }
}

/// ARP cache of the local operating system
#[derive(Debug, Clone, Default)]
pub struct SystemArpCache;

#[async_trait]
impl ArpSource for SystemArpCache {
    async fn snapshot(&self) -> Vec<ArpEntry> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(table) = tokio::fs::read_to_string("/proc/net/arp").await {
                return parse_proc_net_arp(&table);
            }
        }

        match run_arp(&["-a"]).await {
            Some(output) => parse_arp_output(&output),
            None => Vec::new(),
        }
    }

    async fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(table) = tokio::fs::read_to_string("/proc/net/arp").await {
                return parse_proc_net_arp(&table)
                    .into_iter()
                    .find(|entry| entry.ip == ip)
                    .map(|entry| entry.mac);
            }
        }

        let flag = if cfg!(windows) { "-a" } else { "-n" };
        let output = run_arp(&[flag, &ip.to_string()]).await?;
        parse_arp_output(&output)
            .into_iter()
            .find(|entry| entry.ip == ip)
            .map(|entry| entry.mac)
    }
}

async fn run_arp(args: &[&str]) -> Option<String> {
    let mut command = Command::new("arp");
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match timeout(ARP_COMMAND_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(e)) => {
            log::debug!("arp unavailable: {}", e);
            None
        }
        Err(_) => {
            log::warn!("arp did not answer within {:?}", ARP_COMMAND_TIMEOUT);
            None
        }
    }
}

/// Normalize a MAC to upper-case colon form with two digits per octet
pub fn normalize_mac(raw: &str) -> Option<String> {
    let octets: Vec<&str> = raw.split(|c| c == ':' || c == '-').collect();
    if octets.len() != 6 {
        return None;
    }
    let mut normalized = Vec::with_capacity(6);
    for octet in octets {
        let value = u8::from_str_radix(octet, 16).ok()?;
        normalized.push(format!("{:02X}", value));
    }
    Some(normalized.join(":"))
}

/// Broadcast, multicast and incomplete entries carry no host identity
fn is_host_mac(mac: &str) -> bool {
    mac != "FF:FF:FF:FF:FF:FF" && mac != "00:00:00:00:00:00" && !mac.starts_with("01:00:5E")
}

/// Parse `arp -a` / `arp -n` output from Windows, macOS, BSD or Linux
pub fn parse_arp_output(output: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let Some(ip) = IPV4
            .captures(line)
            .and_then(|caps| Ipv4Addr::from_str(&caps[1]).ok())
        else {
            continue;
        };
        let Some(mac) = MAC.captures(line).and_then(|caps| normalize_mac(&caps[1])) else {
            continue;
        };
        if !is_host_mac(&mac) {
            continue;
        }

        let lower = line.to_ascii_lowercase();
        let entry_type = if lower.contains("static") || lower.contains("permanent") {
            "static"
        } else {
            "dynamic"
        };

        entries.push(ArpEntry {
            ip,
            mac,
            vendor: String::new(),
            entry_type: entry_type.to_string(),
        });
    }

    entries
}

/// Parse the Linux `/proc/net/arp` table
pub fn parse_proc_net_arp(table: &str) -> Vec<ArpEntry> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let ip = Ipv4Addr::from_str(fields[0]).ok()?;
            let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
            // ATF_COM: entry is complete
            if flags & 0x2 == 0 {
                return None;
            }
            let mac = normalize_mac(fields[3])?;
            if !is_host_mac(&mac) {
                return None;
            }
            // ATF_PERM
            let entry_type = if flags & 0x4 != 0 { "static" } else { "dynamic" };
            Some(ArpEntry {
                ip,
                mac,
                vendor: String::new(),
                entry_type: entry_type.to_string(),
            })
        })
        .collect()
}
