//! NetSecOps - network reconnaissance and remote execution toolkit
//!
//! Discovers live hosts on IPv4 ranges, profiles them (OS, services, vendor,
//! device type), exports the resulting map, and runs commands or file
//! transfers on remote hosts through external protocol clients.

pub mod audit;
pub mod batch;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod execution;
pub mod intelligence;
pub mod mapping;
pub mod network;
pub mod output;
pub mod utils;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditSink, LogAuditSink};
pub use batch::{BatchEvent, BatchSummary};
pub use config::OpsConfig;
pub use discovery::{DiscoveryCoordinator, DiscoveryEvent};
pub use error::{OpsError, OpsResult};
pub use execution::{ExecutionEvent, Operation, Protocol, RemoteExecutor};
pub use mapping::{HostProfile, MappingCoordinator, MappingEvent};
pub use network::HostResult;
pub use output::ExportFormat;
