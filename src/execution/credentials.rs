//! Credential resolution
//!
//! The engine only ever asks "which credential for this host and protocol?"
//! through [`CredentialProvider`]. [`CredentialStore`] is an in-memory
//! provider with host-pattern matching; persistence and encryption belong to
//! whatever feeds it.

use super::protocol::Protocol;
use crate::config::CredentialEntry;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    #[default]
    Password,
    /// Secret is a private key in OpenSSH format
    SshKey,
    Windows,
    Domain,
}

impl CredentialKind {
    /// Whether a credential of this kind can authenticate `protocol`
    pub fn usable_with(&self, protocol: Protocol) -> bool {
        match self {
            CredentialKind::Password => true,
            CredentialKind::SshKey => matches!(
                protocol,
                Protocol::Ssh | Protocol::ScpTransfer | Protocol::Custom
            ),
            CredentialKind::Windows | CredentialKind::Domain => !matches!(
                protocol,
                Protocol::Ssh | Protocol::ScpTransfer
            ),
        }
    }
}

/// Secret material; never printed by `Debug` or `Display`
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: u64,
    pub name: String,
    pub host_pattern: String,
    pub username: String,
    pub secret: Secret,
    pub kind: CredentialKind,
}

impl Credential {
    /// One-off password credential supplied for a parked job
    pub fn ad_hoc(username: impl Into<String>, secret: Secret) -> Self {
        Self {
            id: 0,
            name: "ad-hoc".to_string(),
            host_pattern: String::new(),
            username: username.into(),
            secret,
            kind: CredentialKind::Password,
        }
    }
}

/// Resolves the credential to use for a host
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, host: Ipv4Addr, protocol: Protocol) -> Option<Credential>;
}

/// How specifically a pattern matched; higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchRank {
    Any,
    Wildcard(usize),
    Network(u8),
    Exact,
}

fn match_pattern(pattern: &str, host: Ipv4Addr) -> Option<MatchRank> {
    let pattern = pattern.trim();
    if pattern == "*" {
        return Some(MatchRank::Any);
    }
    if let Ok(addr) = Ipv4Addr::from_str(pattern) {
        return (addr == host).then_some(MatchRank::Exact);
    }
    if pattern.contains('/') {
        let network = Ipv4Network::from_str(pattern).ok()?;
        return network
            .contains(host)
            .then_some(MatchRank::Network(network.prefix()));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return host
            .to_string()
            .starts_with(prefix)
            .then_some(MatchRank::Wildcard(prefix.len()));
    }
    None
}

/// In-memory credential provider
#[derive(Debug, Default)]
pub struct CredentialStore {
    credentials: RwLock<Vec<Credential>>,
    host_defaults: RwLock<HashMap<Ipv4Addr, u64>>,
    next_id: AtomicU64,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Build from config entries, reading each secret from its environment
    /// variable; entries whose variable is unset are skipped
    pub fn from_entries(entries: &[CredentialEntry]) -> Self {
        let store = Self::new();
        for entry in entries {
            let secret = match std::env::var(&entry.secret_env) {
                Ok(secret) => secret,
                Err(_) => {
                    log::warn!(
                        "Credential '{}' skipped: {} is not set",
                        entry.name,
                        entry.secret_env
                    );
                    continue;
                }
            };
            let id = store.add(
                &entry.name,
                &entry.host_pattern,
                &entry.username,
                Secret::new(secret),
                entry.kind,
            );
            for host in &entry.default_for {
                match Ipv4Addr::from_str(host) {
                    Ok(addr) => store.set_default(addr, id),
                    Err(_) => log::warn!("Ignoring invalid default host '{}'", host),
                }
            }
        }
        store
    }

    /// Add a credential and return its id
    pub fn add(
        &self,
        name: &str,
        host_pattern: &str,
        username: &str,
        secret: Secret,
        kind: CredentialKind,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).max(1);
        let credential = Credential {
            id,
            name: name.to_string(),
            host_pattern: host_pattern.to_string(),
            username: username.to_string(),
            secret,
            kind,
        };
        match self.credentials.write() {
            Ok(mut list) => list.push(credential),
            Err(poisoned) => poisoned.into_inner().push(credential),
        }
        id
    }

    /// Make credential `id` the explicit default for `host`
    pub fn set_default(&self, host: Ipv4Addr, id: u64) {
        match self.host_defaults.write() {
            Ok(mut defaults) => defaults.insert(host, id),
            Err(poisoned) => poisoned.into_inner().insert(host, id),
        };
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut list = match self.credentials.write() {
            Ok(list) => list,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = list.len();
        list.retain(|c| c.id != id);
        before != list.len()
    }

    pub fn len(&self) -> usize {
        self.credentials.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialProvider for CredentialStore {
    /// Explicit host default first, then the most specific matching pattern:
    /// exact address, narrowest CIDR, longest wildcard prefix, `*`
    fn resolve(&self, host: Ipv4Addr, protocol: Protocol) -> Option<Credential> {
        let list = match self.credentials.read() {
            Ok(list) => list,
            Err(poisoned) => poisoned.into_inner(),
        };

        let default_id = match self.host_defaults.read() {
            Ok(defaults) => defaults.get(&host).copied(),
            Err(poisoned) => poisoned.into_inner().get(&host).copied(),
        };
        if let Some(id) = default_id {
            if let Some(credential) = list
                .iter()
                .find(|c| c.id == id && c.kind.usable_with(protocol))
            {
                return Some(credential.clone());
            }
        }

        list.iter()
            .filter(|c| c.kind.usable_with(protocol))
            .filter_map(|c| match_pattern(&c.host_pattern, host).map(|rank| (rank, c)))
            // First added wins among equal ranks
            .fold(None::<(MatchRank, &Credential)>, |best, (rank, c)| match best {
                Some((best_rank, _)) if best_rank >= rank => best,
                _ => Some((rank, c)),
            })
            .map(|(_, c)| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        let store = CredentialStore::new();
        store.add("any", "*", "fallback", Secret::new("a"), CredentialKind::Password);
        store.add("lab", "10.0.*", "lab", Secret::new("b"), CredentialKind::Password);
        store.add("rack", "10.0.5.0/24", "rack", Secret::new("c"), CredentialKind::Password);
        store.add("db", "10.0.5.20", "db", Secret::new("d"), CredentialKind::Password);
        store.add("key", "10.0.5.20", "deploy", Secret::new("KEY"), CredentialKind::SshKey);
        store
    }

    fn resolve_user(store: &CredentialStore, host: [u8; 4], protocol: Protocol) -> Option<String> {
        store
            .resolve(Ipv4Addr::from(host), protocol)
            .map(|c| c.username)
    }

    #[test]
    fn test_most_specific_pattern_wins() {
        let store = store();
        assert_eq!(resolve_user(&store, [10, 0, 5, 20], Protocol::WinRm).as_deref(), Some("db"));
        assert_eq!(resolve_user(&store, [10, 0, 5, 21], Protocol::Ssh).as_deref(), Some("rack"));
        assert_eq!(resolve_user(&store, [10, 0, 9, 1], Protocol::Ssh).as_deref(), Some("lab"));
        assert_eq!(resolve_user(&store, [192, 168, 0, 1], Protocol::Ssh).as_deref(), Some("fallback"));
    }

    #[test]
    fn test_host_default_overrides_patterns() {
        let store = store();
        store.set_default(Ipv4Addr::new(10, 0, 5, 20), 5);
        assert_eq!(resolve_user(&store, [10, 0, 5, 20], Protocol::Ssh).as_deref(), Some("deploy"));
        // SSH keys cannot drive WMI; fall back to patterns
        assert_eq!(resolve_user(&store, [10, 0, 5, 20], Protocol::Wmi).as_deref(), Some("db"));
    }

    #[test]
    fn test_empty_store_resolves_nothing() {
        let store = CredentialStore::new();
        assert!(store.resolve(Ipv4Addr::LOCALHOST, Protocol::Ssh).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_secret_is_redacted() {
        let credential = Credential::ad_hoc("root", Secret::new("hunter2"));
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("Secret(***)"));
    }

    #[test]
    fn test_wildcard_matches_textual_prefix() {
        assert_eq!(
            match_pattern("10.0.1*", Ipv4Addr::new(10, 0, 12, 1)),
            Some(MatchRank::Wildcard(6))
        );
        assert_eq!(match_pattern("10.0.1.*", Ipv4Addr::new(10, 0, 12, 1)), None);
        assert_eq!(match_pattern("garbage", Ipv4Addr::new(10, 0, 12, 1)), None);
    }
}
