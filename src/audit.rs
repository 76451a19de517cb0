//! Activity auditing
//!
//! Significant actions are handed to an [`AuditSink`]. Recording is
//! fire-and-forget: sinks must never block or fail the caller, so the trait
//! method has no return value and implementations swallow their own errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Discovery,
    Mapping,
    Execution,
    Credential,
    Export,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditCategory::Discovery => "discovery",
            AuditCategory::Mapping => "mapping",
            AuditCategory::Execution => "execution",
            AuditCategory::Credential => "credential",
            AuditCategory::Export => "export",
        };
        f.write_str(name)
    }
}

/// One audited action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub action: String,
    pub target: String,
    pub status: String,
}

impl AuditEntry {
    pub fn new(
        category: AuditCategory,
        action: impl Into<String>,
        target: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            action: action.into(),
            target: target.into(),
            status: status.into(),
        }
    }
}

/// Receiver of audit entries
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes entries to the `audit` log target
#[derive(Debug, Clone, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: AuditEntry) {
        log::info!(
            target: "audit",
            "{} [{}] {} -> {} ({})",
            entry.timestamp.to_rfc3339(),
            entry.category,
            entry.action,
            entry.target,
            entry.status
        );
    }
}

/// Forwards entries to an unbounded channel for an external consumer
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::UnboundedSender<AuditEntry>,
}

impl ChannelAuditSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, entry: AuditEntry) {
        if self.sender.send(entry).is_err() {
            log::trace!("Audit consumer dropped, entry discarded");
        }
    }
}

/// Discards everything
#[derive(Debug, Clone, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: AuditEntry) {}
}
