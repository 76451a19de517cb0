//! Error handling for netsecops
//!
//! Every fallible library operation returns [`OpsResult`]. Failures are
//! isolated per unit of work: a single host or job failing never tears down
//! the batch it belongs to, so most of these variants surface only at the
//! request boundary (bad input, export, job control).

use crate::execution::{JobId, JobKind, JobStatus, Protocol};
use thiserror::Error;

/// Main error type for discovery, mapping and execution operations
#[derive(Debug, Error)]
pub enum OpsError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout error")]
    TimeoutError,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Export error: {0}")]
    ExportError(String),

    #[error("Credential error: {0}")]
    CredentialError(String),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job {job_id} is {status}, operation not allowed")]
    InvalidJobState { job_id: JobId, status: JobStatus },

    #[error("Protocol {protocol} does not support {kind}")]
    UnsupportedOperation { protocol: Protocol, kind: JobKind },

    #[error("Failed to start process: {0}")]
    SpawnError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

/// Result type alias for netsecops operations
pub type OpsResult<T> = Result<T, OpsError>;

impl From<tokio::time::error::Elapsed> for OpsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        OpsError::TimeoutError
    }
}

impl From<toml::de::Error> for OpsError {
    fn from(err: toml::de::Error) -> Self {
        OpsError::ConfigError(format!("Failed to parse TOML: {}", err))
    }
}

impl From<quick_xml::Error> for OpsError {
    fn from(err: quick_xml::Error) -> Self {
        OpsError::ExportError(format!("XML writer failed: {}", err))
    }
}

impl OpsError {
    /// Whether the error came from caller input rather than the environment
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            OpsError::InvalidTarget(_)
                | OpsError::ParseError(_)
                | OpsError::UnsupportedOperation { .. }
                | OpsError::ConfigError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = OpsError::UnsupportedOperation {
            protocol: Protocol::Ssh,
            kind: JobKind::DeployFile,
        };
        assert_eq!(err.to_string(), "Protocol SSH does not support deploy-file");

        let err = OpsError::InvalidJobState {
            job_id: 7,
            status: JobStatus::Completed,
        };
        assert_eq!(err.to_string(), "Job 7 is completed, operation not allowed");
    }

    #[test]
    fn test_input_error_classification() {
        assert!(OpsError::InvalidTarget("x".into()).is_input_error());
        assert!(!OpsError::TimeoutError.is_input_error());
        assert!(!OpsError::JobNotFound(3).is_input_error());
    }
}
