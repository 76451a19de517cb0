//! Reverse DNS for discovered hosts

use dns_lookup::lookup_addr;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Reverse lookup timeout; the resolver call itself is blocking
pub const DNS_TIMEOUT: Duration = Duration::from_millis(2000);

/// Blocking PTR lookup, `None` when the answer is just the address again
pub fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    match lookup_addr(&IpAddr::V4(ip)) {
        Ok(hostname) if hostname != ip.to_string() && !hostname.is_empty() => Some(hostname),
        Ok(_) => None,
        Err(e) => {
            log::trace!("No PTR record for {}: {}", ip, e);
            None
        }
    }
}

/// Reverse lookup on the blocking pool, bounded by [`DNS_TIMEOUT`]
pub async fn resolve_hostname(ip: Ipv4Addr) -> Option<String> {
    let lookup = tokio::task::spawn_blocking(move || reverse_lookup(ip));
    match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
        Ok(Ok(hostname)) => hostname,
        Ok(Err(e)) => {
            log::warn!("Reverse lookup task for {} failed: {}", ip, e);
            None
        }
        Err(_) => {
            log::debug!("Reverse lookup for {} timed out", ip);
            None
        }
    }
}
