//! Error types for stagehand.

use std::path::PathBuf;

use crate::jobs::JobStatus;
use crate::jobs::args::ValidationError;

/// Top-level error type for binaries and front-ends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors from the file-backed job store.
///
/// Every write goes through a temp file plus rename, so any of these leaves
/// the previously persisted record (and the in-memory index) untouched.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Jobs root {path} is unusable: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize job {id}: {reason}")]
    Serialization { id: String, reason: String },

    #[error("Job {id} already exists in the store")]
    Conflict { id: String },

    #[error("Job {id} not found in the store")]
    NotFound { id: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Job lifecycle errors.
///
/// These are reported straight back to the caller and never retried.
/// Step executor failures are not errors here: they are carried in
/// [`RunOutcome`](crate::runner::RunOutcome).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} already exists")]
    Conflict { id: String },

    #[error("Cannot {operation} job {id} in state {status}")]
    InvalidState {
        id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Job {id} has no steps and cannot be submitted")]
    EmptyJob { id: String },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid job id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Invalid step arguments: {0}")]
    InvalidArguments(#[from] ValidationError),

    #[error("Another job is already processing")]
    ConcurrencyBusy,

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl JobError {
    /// Whether this error means the referenced job is in the wrong state for
    /// the attempted operation (including an empty submit).
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::EmptyJob { .. } | Self::InvalidTransition { .. }
        )
    }
}

/// Result type alias for stagehand.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display_names_operation_and_status() {
        let err = JobError::InvalidState {
            id: "j1".to_string(),
            status: JobStatus::Queued,
            operation: "add a step to",
        };
        let msg = err.to_string();
        assert!(msg.contains("add a step to"), "operation missing: {msg}");
        assert!(msg.contains("queued"), "status missing: {msg}");
        assert!(err.is_invalid_state());
    }

    #[test]
    fn empty_job_counts_as_invalid_state() {
        let err = JobError::EmptyJob {
            id: "j1".to_string(),
        };
        assert!(err.is_invalid_state());
        assert!(!JobError::ConcurrencyBusy.is_invalid_state());
    }

    #[test]
    fn store_error_converts_into_job_error() {
        let store_err = StoreError::io(
            "/nope/job.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let err: JobError = store_err.into();
        assert!(matches!(err, JobError::Persistence(StoreError::Io { .. })));
        assert!(err.to_string().contains("/nope/job.json"));
    }

    #[test]
    fn top_level_error_wraps_config() {
        let err: Error = ConfigError::ParseError("bad".to_string()).into();
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
