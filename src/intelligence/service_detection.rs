//! Service enumeration for open ports

use super::nmap::NmapEngine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One identified service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub port: u16,
    pub name: String,
    pub version: Option<String>,
}

impl ServiceInfo {
    /// `name` or `name version`
    pub fn label(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {}", self.name, version),
            None => self.name.clone(),
        }
    }
}

static WELL_KNOWN_SERVICES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (21, "FTP"),
        (22, "SSH"),
        (23, "Telnet"),
        (25, "SMTP"),
        (53, "DNS"),
        (80, "HTTP"),
        (110, "POP3"),
        (135, "RPC"),
        (139, "NetBIOS"),
        (143, "IMAP"),
        (443, "HTTPS"),
        (445, "SMB"),
        (993, "IMAPS"),
        (995, "POP3S"),
        (1433, "MSSQL"),
        (3306, "MySQL"),
        (3389, "RDP"),
        (5432, "PostgreSQL"),
        (5900, "VNC"),
        (8080, "HTTP-Alt"),
    ])
});

static NMAP_SERVICE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)/tcp\s+open\s+(\S+)(?:\s+(.*\S))?\s*$").expect("service line pattern is valid")
});

/// Name from the static table, if the port is one we know
pub fn well_known_service(port: u16) -> Option<&'static str> {
    WELL_KNOWN_SERVICES.get(&port).copied()
}

/// Static-table services for every open port that has an entry
pub fn services_from_table(open_ports: &[u16]) -> Vec<ServiceInfo> {
    open_ports
        .iter()
        .filter_map(|&port| {
            well_known_service(port).map(|name| ServiceInfo {
                port,
                name: name.to_string(),
                version: None,
            })
        })
        .collect()
}

/// Parse the port table of `nmap -sV` output
pub fn parse_service_output(output: &str) -> Vec<ServiceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let caps = NMAP_SERVICE_LINE.captures(line.trim_end())?;
            let port = caps.get(1)?.as_str().parse().ok()?;
            let name = caps.get(2)?.as_str().to_string();
            let version = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty());
            Some(ServiceInfo { port, name, version })
        })
        .collect()
}

/// Service enumerator with optional nmap delegation
#[derive(Debug, Clone, Default)]
pub struct ServiceDetector {
    nmap: Option<Arc<NmapEngine>>,
}

impl ServiceDetector {
    pub fn new(nmap: Option<Arc<NmapEngine>>) -> Self {
        Self { nmap }
    }

    pub async fn enumerate(&self, target: Ipv4Addr, open_ports: &[u16]) -> Vec<ServiceInfo> {
        if open_ports.is_empty() {
            return Vec::new();
        }
        if let Some(nmap) = &self.nmap {
            if nmap.is_available().await {
                match nmap.service_scan(target, open_ports).await {
                    Ok(output) => {
                        let services = parse_service_output(&output.stdout);
                        if !services.is_empty() {
                            return services;
                        }
                    }
                    Err(e) => log::debug!("nmap service scan of {} failed: {}", target, e),
                }
            }
        }
        services_from_table(open_ports)
    }
}
