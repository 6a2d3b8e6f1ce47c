//! Sequential execution of queued jobs.
//!
//! [`JobRunner`] owns no state of its own: exclusivity comes from the shared
//! [`ProcessState`], every status change goes through the [`JobManager`], and
//! the actual work of a step is delegated to a [`StepExecutor`].

pub mod command;
pub mod instant;

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::cache::{ArtifactCache, SharedArtifacts};
use crate::config::JobsConfig;
use crate::error::JobError;
use crate::jobs::{
    Job, JobFailure, JobManager, JobStatus, JobStore, StepArgs, StepKind, StepStatus,
};
use crate::process::{ProcessState, StopSignal};

/// Artifact cache size for runners built without a config.
const DEFAULT_ARTIFACT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

pub use command::CommandExecutor;
pub use instant::InstantRunner;

/// Everything an executor is told about the step it runs.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub job_id: &'a str,
    pub index: usize,
    pub kind: StepKind,
    pub args: &'a StepArgs,
    /// Executors with long steps may poll this and bail out early.
    pub stop: StopSignal,
    /// Shared across every step and job this runner executes.
    pub artifacts: &'a SharedArtifacts,
}

/// A failed step. The detail ends up in the step record and the run report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .detail.as_deref().unwrap_or("step failed"))]
pub struct StepError {
    pub detail: Option<String>,
}

impl StepError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }

    pub fn without_detail() -> Self {
        Self { detail: None }
    }
}

/// Performs the work of one step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), StepError>;
}

/// Adapts a synchronous closure into a [`StepExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&StepContext<'_>) -> Result<(), StepError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> StepExecutor for FnExecutor<F>
where
    F: Fn(&StepContext<'_>) -> Result<(), StepError> + Send + Sync,
{
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        (self.f)(ctx)
    }
}

/// How a run ended. Executor failures land here, not in `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    StepFailed {
        index: usize,
        detail: Option<String>,
    },
    /// A stop was requested; `next_index` is the first step not attempted.
    Stopped { next_index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job_id: String,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Runs one job at a time, process-wide.
pub struct JobRunner {
    manager: Arc<JobManager>,
    process: Arc<ProcessState>,
    artifacts: Arc<SharedArtifacts>,
}

impl JobRunner {
    pub fn new(manager: Arc<JobManager>, process: Arc<ProcessState>) -> Self {
        Self {
            manager,
            process,
            artifacts: Arc::new(ArtifactCache::with_capacity(DEFAULT_ARTIFACT_CAPACITY)),
        }
    }

    /// Open the store at `jobs_path` and build a runner with an artifact
    /// cache sized from `config`.
    pub fn open(config: &JobsConfig, process: Arc<ProcessState>) -> crate::Result<Self> {
        let store = Arc::new(JobStore::open(&config.jobs_path)?);
        let artifacts = Arc::new(ArtifactCache::from_config(config)?);
        Ok(Self::new(Arc::new(JobManager::new(store)), process).with_artifacts(artifacts))
    }

    /// Share `artifacts` with every executor this runner calls.
    pub fn with_artifacts(mut self, artifacts: Arc<SharedArtifacts>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    pub fn artifacts(&self) -> &Arc<SharedArtifacts> {
        &self.artifacts
    }

    /// Run every step of a queued job in index order.
    ///
    /// Fails fast with [`JobError::ConcurrencyBusy`] if another job holds
    /// the processing slot or is still recorded as processing. The slot is
    /// released however this returns, including when the executor panics.
    /// A persistence error after the job started moves it to failed before
    /// the error is returned.
    pub async fn run_job(
        &self,
        id: &str,
        executor: &dyn StepExecutor,
    ) -> Result<RunReport, JobError> {
        let Some(_slot) = self.process.try_acquire() else {
            tracing::debug!(job_id = %id, "Run rejected, processing slot held");
            return Err(JobError::ConcurrencyBusy);
        };

        let job = self.manager.start_processing(id)?;
        tracing::info!(job_id = %id, steps = job.steps.len(), "Job processing");

        match self.run_steps(&job, executor).await {
            Ok(outcome) => Ok(RunReport {
                job_id: id.to_string(),
                outcome,
            }),
            Err(e) => {
                self.abandon(id, &e);
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        job: &Job,
        executor: &dyn StepExecutor,
    ) -> Result<RunOutcome, JobError> {
        let id = job.id.as_str();
        for step in &job.steps {
            if self.process.is_stop_requested() {
                self.manager.finish(
                    id,
                    JobStatus::Failed,
                    Some(JobFailure::Stopped {
                        next_index: step.index,
                    }),
                )?;
                tracing::info!(job_id = %id, next_index = step.index, "Job stopped");
                return Ok(RunOutcome::Stopped {
                    next_index: step.index,
                });
            }

            let ctx = StepContext {
                job_id: id,
                index: step.index,
                kind: step.kind,
                args: &step.args,
                stop: self.process.stop_signal(),
                artifacts: &self.artifacts,
            };
            tracing::debug!(job_id = %id, step = step.index, kind = %step.kind, "Step started");

            let result = match AssertUnwindSafe(executor.execute(&ctx))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(StepError::new(format!(
                    "executor panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            if let Err(e) = result {
                self.manager.record_step(
                    id,
                    step.index,
                    StepStatus::Failed,
                    e.detail.clone(),
                )?;
                self.manager.finish(
                    id,
                    JobStatus::Failed,
                    Some(JobFailure::StepFailed {
                        index: step.index,
                        detail: e.detail.clone(),
                    }),
                )?;
                tracing::warn!(job_id = %id, step = step.index, error = %e, "Step failed");
                return Ok(RunOutcome::StepFailed {
                    index: step.index,
                    detail: e.detail,
                });
            }

            self.manager
                .record_step(id, step.index, StepStatus::Succeeded, None)?;
            tracing::debug!(job_id = %id, step = step.index, "Step succeeded");
        }

        self.manager.finish(id, JobStatus::Completed, None)?;
        tracing::info!(job_id = %id, "Job completed");
        Ok(RunOutcome::Completed)
    }

    /// Move a job whose run hit an error out of `processing`, so releasing
    /// the slot never leaves it there. If even that write fails the job
    /// stays put and further runs are refused until recovery.
    fn abandon(&self, id: &str, error: &JobError) {
        match self.manager.get_job(id) {
            Some(job) if !job.status.is_terminal() => {}
            _ => return,
        }
        let failure = JobFailure::Persistence {
            detail: error.to_string(),
        };
        match self.manager.finish(id, JobStatus::Failed, Some(failure)) {
            Ok(_) => {
                tracing::warn!(job_id = %id, error = %error, "Job failed after a persistence error")
            }
            Err(e) => tracing::error!(
                job_id = %id,
                error = %e,
                "Job left processing after a persistence error; run recovery"
            ),
        }
    }

    /// Run every queued job, oldest first.
    ///
    /// Stops after a run that was halted by [`ProcessState::stop`]; a failed
    /// step only ends its own job.
    pub async fn run_queued(
        &self,
        executor: &dyn StepExecutor,
    ) -> Result<Vec<RunReport>, JobError> {
        let queued = self.manager.find_jobs_by_status(JobStatus::Queued);
        let mut reports = Vec::with_capacity(queued.len());
        for job in queued {
            let report = self.run_job(&job.id, executor).await?;
            let stopped = matches!(report.outcome, RunOutcome::Stopped { .. });
            reports.push(report);
            if stopped {
                break;
            }
        }
        Ok(reports)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
