//! Remote execution engine
//!
//! A request names a target spec, an [`Operation`] and a [`Protocol`]. Each
//! expanded target becomes one job with its own id. Jobs wait for a
//! credential, run as exactly one child process built by the protocol
//! handler, stream output, and are removed once they reach a terminal state.
//!
//! ```text
//! awaiting-credential ──> running ──> completed | failed | stopped
//!          └──────────────────────────────────────────> stopped
//! ```

pub mod credentials;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod sanitize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

pub use credentials::{Credential, CredentialKind, CredentialProvider, CredentialStore, Secret};
pub use engine::RemoteExecutor;
pub use protocol::{HostPlatform, ProcessSpec, Protocol};
pub use registry::JobRegistry;

/// Unique, monotonically increasing job identifier
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RunCommand,
    DeployFile,
    RetrieveFile,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::RunCommand => "run-command",
            JobKind::DeployFile => "deploy-file",
            JobKind::RetrieveFile => "retrieve-file",
        };
        f.write_str(name)
    }
}

/// What a job does on its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    RunCommand { command: String },
    /// Local `source` to remote `destination`
    DeployFile { source: String, destination: String },
    /// Remote `source` to local `destination`
    RetrieveFile { source: String, destination: String },
}

impl Operation {
    pub fn kind(&self) -> JobKind {
        match self {
            Operation::RunCommand { .. } => JobKind::RunCommand,
            Operation::DeployFile { .. } => JobKind::DeployFile,
            Operation::RetrieveFile { .. } => JobKind::RetrieveFile,
        }
    }

    /// Short human description for logs and audit entries
    pub fn describe(&self) -> String {
        match self {
            Operation::RunCommand { command } => format!("run '{}'", command),
            Operation::DeployFile { source, destination } => {
                format!("deploy {} -> {}", source, destination)
            }
            Operation::RetrieveFile { source, destination } => {
                format!("retrieve {} -> {}", source, destination)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    AwaitingCredential,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped)
    }

    /// Allowed edges of the job state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (AwaitingCredential, Running)
                | (AwaitingCredential, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::AwaitingCredential => "awaiting-credential",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Read-only copy of a job, without its process handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub target: Ipv4Addr,
    pub protocol: Protocol,
    pub status: JobStatus,
    pub progress: u8,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

/// Events published by [`RemoteExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    CredentialRequired {
        job_id: JobId,
        host: Ipv4Addr,
        protocol: Protocol,
    },
    JobStarted {
        job_id: JobId,
        kind: JobKind,
        target: Ipv4Addr,
        protocol: Protocol,
    },
    OutputChunk {
        job_id: JobId,
        chunk: String,
    },
    JobProgress {
        job_id: JobId,
        progress: u8,
    },
    JobCompleted {
        job_id: JobId,
        output: String,
    },
    JobFailed {
        job_id: JobId,
        error: String,
    },
    JobStopped {
        job_id: JobId,
    },
}

impl ExecutionEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            ExecutionEvent::CredentialRequired { job_id, .. }
            | ExecutionEvent::JobStarted { job_id, .. }
            | ExecutionEvent::OutputChunk { job_id, .. }
            | ExecutionEvent::JobProgress { job_id, .. }
            | ExecutionEvent::JobCompleted { job_id, .. }
            | ExecutionEvent::JobFailed { job_id, .. }
            | ExecutionEvent::JobStopped { job_id } => *job_id,
        }
    }

    /// Completed, failed or stopped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::JobCompleted { .. }
                | ExecutionEvent::JobFailed { .. }
                | ExecutionEvent::JobStopped { .. }
        )
    }
}
