//! Target parsing utilities
//!
//! Turns a free-form target specification into the ordered set of IPv4
//! hosts a batch will touch. Accepted tokens:
//! - single addresses (`10.0.0.5`)
//! - CIDR blocks (`10.0.0.0/24`), network and broadcast excluded
//! - last-octet ranges (`10.0.0.10-20`)
//! - full ranges inside one /24 (`10.0.0.10-10.0.0.20`)
//! - hostnames, when resolution is enabled
//!
//! Tokens are separated by commas, semicolons or whitespace. Anything that
//! does not parse is dropped with a warning so one bad token never sinks a
//! request.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Maximum number of targets produced for one request
pub const MAX_TARGETS: usize = 254;

/// Separator accepted between target and port tokens
pub(crate) static TOKEN_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,;\s]+").expect("separator pattern is valid"));

static OCTET_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.)(\d{1,3})-(\d{1,3})$")
        .expect("octet range pattern is valid")
});

/// Target parser with optional hostname resolution
#[derive(Debug, Clone)]
pub struct TargetParser {
    max_targets: usize,
    resolve_hostnames: bool,
}

impl Default for TargetParser {
    fn default() -> Self {
        Self {
            max_targets: MAX_TARGETS,
            resolve_hostnames: false,
        }
    }
}

impl TargetParser {
    pub fn new(max_targets: usize, resolve_hostnames: bool) -> Self {
        Self {
            max_targets: max_targets.min(MAX_TARGETS),
            resolve_hostnames,
        }
    }

    /// Enable hostname resolution for tokens that are not addresses
    pub fn with_hostname_resolution(mut self, enabled: bool) -> Self {
        self.resolve_hostnames = enabled;
        self
    }

    /// Expand a target specification into deduplicated hosts, first-seen order
    pub fn expand(&self, spec: &str) -> Vec<Ipv4Addr> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for token in TOKEN_SEPARATOR.split(spec.trim()).filter(|t| !t.is_empty()) {
            let hosts = match self.parse_token(token) {
                Some(hosts) => hosts,
                None => {
                    log::warn!("Dropping invalid target token '{}'", token);
                    continue;
                }
            };

            for host in hosts {
                if targets.len() >= self.max_targets {
                    log::warn!(
                        "Target list truncated to {} hosts",
                        self.max_targets
                    );
                    return targets;
                }
                if seen.insert(host) {
                    targets.push(host);
                }
            }
        }

        targets
    }

    /// [`expand`](Self::expand) on the blocking pool when hostname resolution
    /// is enabled, since the resolver call blocks
    pub async fn expand_async(&self, spec: &str) -> Vec<Ipv4Addr> {
        if !self.resolve_hostnames {
            return self.expand(spec);
        }
        let parser = self.clone();
        let spec = spec.to_string();
        match tokio::task::spawn_blocking(move || parser.expand(&spec)).await {
            Ok(targets) => targets,
            Err(e) => {
                log::error!("Target expansion task failed: {}", e);
                Vec::new()
            }
        }
    }

    fn parse_token(&self, token: &str) -> Option<Vec<Ipv4Addr>> {
        if token.contains('/') {
            return parse_cidr(token);
        }
        if let Ok(addr) = Ipv4Addr::from_str(token) {
            return Some(vec![addr]);
        }
        if token.contains('-') {
            if let Some(hosts) = parse_octet_range(token).or_else(|| parse_full_range(token)) {
                return Some(hosts);
            }
        }
        if self.resolve_hostnames {
            return resolve_hostname(token).map(|addr| vec![addr]);
        }
        None
    }
}

/// Expand a target specification with default settings
pub fn expand(spec: &str) -> Vec<Ipv4Addr> {
    TargetParser::default().expand(spec)
}

/// Hosts strictly between network and broadcast, at most [`MAX_TARGETS`]
fn parse_cidr(token: &str) -> Option<Vec<Ipv4Addr>> {
    let (addr, prefix) = token.split_once('/')?;
    let addr = Ipv4Addr::from_str(addr).ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }

    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    let available = broadcast.saturating_sub(network).saturating_sub(1);
    let count = available.min(MAX_TARGETS as u32);

    if count == 0 {
        log::warn!("CIDR {} has no usable host addresses", token);
    }

    Some((1..=count).map(|offset| Ipv4Addr::from(network + offset)).collect())
}

/// `a.b.c.start-end`
fn parse_octet_range(token: &str) -> Option<Vec<Ipv4Addr>> {
    let caps = OCTET_RANGE.captures(token)?;
    let prefix = caps.get(1)?.as_str();
    let start: u8 = caps.get(2)?.as_str().parse().ok()?;
    let end: u8 = caps.get(3)?.as_str().parse().ok()?;
    if start > end {
        return None;
    }
    (start..=end)
        .map(|octet| Ipv4Addr::from_str(&format!("{}{}", prefix, octet)).ok())
        .collect()
}

/// `a.b.c.d-a.b.c.e`, both ends inside the same /24
fn parse_full_range(token: &str) -> Option<Vec<Ipv4Addr>> {
    let (start, end) = token.split_once('-')?;
    let start = Ipv4Addr::from_str(start).ok()?;
    let end = Ipv4Addr::from_str(end).ok()?;
    let (s, e) = (start.octets(), end.octets());
    if s[..3] != e[..3] || s[3] > e[3] {
        return None;
    }
    Some(
        (s[3]..=e[3])
            .map(|octet| Ipv4Addr::new(s[0], s[1], s[2], octet))
            .collect(),
    )
}

fn resolve_hostname(hostname: &str) -> Option<Ipv4Addr> {
    let addrs = format!("{}:0", hostname).to_socket_addrs().ok()?;
    addrs.into_iter().find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_expand_async_matches_blocking_expand() {
        let parser = TargetParser::default().with_hostname_resolution(true);
        let spec = "10.0.0.1-3, 10.0.0.2; 10.0.1.0/30";

        let targets = parser.expand_async(spec).await;
        assert_eq!(targets, parser.expand(spec));
        assert_eq!(targets.len(), 5);
        assert_eq!(TargetParser::default().expand_async(spec).await, targets);
    }

    #[test]
    fn test_single_address() {
        assert_eq!(expand("192.168.1.10"), vec![Ipv4Addr::new(192, 168, 1, 10)]);
    }

    #[test]
    fn test_cidr_excludes_network_and_broadcast() {
        let hosts = expand("10.1.2.0/30");
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(10, 1, 2, 1), Ipv4Addr::new(10, 1, 2, 2)]
        );
    }

    #[test]
    fn test_cidr_slash_24() {
        let hosts = expand("192.168.1.77/24");
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_large_cidr_is_capped() {
        let hosts = expand("10.0.0.0/16");
        assert_eq!(hosts.len(), MAX_TARGETS);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_point_to_point_cidrs_are_empty() {
        assert!(expand("10.0.0.1/32").is_empty());
        assert!(expand("10.0.0.0/31").is_empty());
    }

    #[test]
    fn test_octet_range() {
        let hosts = expand("172.16.0.5-8");
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts[3], Ipv4Addr::new(172, 16, 0, 8));
        assert!(expand("172.16.0.9-3").is_empty());
        assert!(expand("172.16.0.9-300").is_empty());
    }

    #[test]
    fn test_full_range() {
        let hosts = expand("172.16.0.1-172.16.0.3");
        assert_eq!(hosts.len(), 3);
        assert!(expand("172.16.0.1-172.16.1.3").is_empty());
    }

    #[test]
    fn test_list_dedup_preserves_order() {
        let hosts = expand("10.0.0.3, 10.0.0.1;10.0.0.3 10.0.0.2-3 bogus 10.0.0.999");
        assert_eq!(
            hosts,
            vec![
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
            ]
        );
    }

    #[test]
    fn test_combined_list_is_capped() {
        let hosts = expand("10.0.0.0/24 10.0.1.0/24");
        assert_eq!(hosts.len(), MAX_TARGETS);
        assert!(hosts.iter().all(|h| h.octets()[2] == 0));
    }

    #[test]
    fn test_hostnames_rejected_without_resolution() {
        assert!(expand("not-a-host.invalid").is_empty());
    }

    proptest! {
        #[test]
        fn prop_cidr_hosts_strictly_inside_block(a in any::<u32>(), prefix in 0u8..=32) {
            let base = Ipv4Addr::from(a);
            let hosts = expand(&format!("{}/{}", base, prefix));

            let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let network = a & mask;
            let broadcast = network | !mask;

            prop_assert!(hosts.len() <= MAX_TARGETS);
            let mut previous = None;
            for host in &hosts {
                let value = u32::from(*host);
                prop_assert!(value > network && value < broadcast);
                if let Some(prev) = previous {
                    prop_assert!(value > prev);
                }
                previous = Some(value);
            }
        }

        #[test]
        fn prop_expand_never_repeats(tokens in proptest::collection::vec((0u8..4, 0u8..=255), 0..20)) {
            let spec = tokens
                .iter()
                .map(|(third, fourth)| format!("10.0.{}.{}", third, fourth))
                .collect::<Vec<_>>()
                .join(",");
            let hosts = expand(&spec);
            let unique: HashSet<_> = hosts.iter().collect();
            prop_assert_eq!(unique.len(), hosts.len());
        }
    }
}
