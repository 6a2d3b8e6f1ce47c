//! Job records and the lifecycle state machine.
//!
//! A job moves strictly forward through
//! `drafted -> queued -> processing -> {completed | failed}`. The store keeps
//! one partition directory per status; [`JobManager`] is the only component
//! that decides when a job may move.

pub mod args;
pub mod id;
pub mod manager;
pub mod store;

pub use args::{ArgValue, RawArgs, StepArgs, StepKind, ValidationError};
pub use id::JobIdAllocator;
pub use manager::JobManager;
pub use store::JobStore;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Job ids double as record file names, so they are kept to a safe charset.
static JOB_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// Validate a job id (or id prefix) against the allowed pattern.
pub fn validate_job_id(id: &str) -> Result<(), JobError> {
    if JOB_ID_PATTERN.is_match(id) {
        return Ok(());
    }
    let reason = if id.is_empty() {
        "must not be empty".to_string()
    } else if id.len() > 128 {
        "must be at most 128 characters".to_string()
    } else {
        "must start with an alphanumeric character and contain only alphanumerics, '.', '_' or '-'"
            .to_string()
    };
    Err(JobError::InvalidId {
        id: id.to_string(),
        reason,
    })
}

/// Lifecycle status of a job. Also names the job's partition on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Drafted,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Drafted,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Directory name of this status's partition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafted => "drafted",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a job in this status can move to `next`.
    ///
    /// Exactly one edge leaves each non-terminal status, except
    /// `processing`, which fans out to the two terminal ones.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Drafted, Self::Queued)
                | (Self::Queued, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drafted" => Ok(Self::Drafted),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!(
                "unknown job status '{other}', expected one of: drafted, queued, processing, completed, failed"
            )),
        }
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job ended in [`JobStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum JobFailure {
    /// A step executor reported failure; later steps were never attempted.
    StepFailed {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A stop request was observed before step `next_index` started.
    Stopped { next_index: usize },
    /// The job was found in `processing` when the store was reopened.
    Interrupted,
    /// Recording the run's progress failed; the run was abandoned.
    Persistence { detail: String },
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepFailed {
                index,
                detail: Some(detail),
            } => write!(f, "step {index} failed: {detail}"),
            Self::StepFailed { index, detail: None } => write!(f, "step {index} failed"),
            Self::Stopped { next_index } => write!(f, "stopped before step {next_index}"),
            Self::Interrupted => write!(f, "interrupted by restart"),
            Self::Persistence { detail } => write!(f, "abandoned after a write failure: {detail}"),
        }
    }
}

/// One argument snapshot inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub kind: StepKind,
    pub args: StepArgs,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub(crate) fn new(index: usize, args: StepArgs) -> Self {
        Self {
            index,
            kind: args.kind(),
            args,
            status: StepStatus::Pending,
            detail: None,
            finished_at: None,
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Job {
    /// A fresh drafted job with no steps.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Drafted,
            created_at: now,
            updated_at: now,
            failure: None,
            steps: Vec::new(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Number of steps that finished successfully.
    pub fn succeeded_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count()
    }
}
