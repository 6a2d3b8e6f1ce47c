//! Job lifecycle operations over the [`JobStore`].
//!
//! The manager is the only place that changes a job's status. Each mutation
//! is a load, modify, persist sequence run under a lifecycle lock so two
//! callers cannot interleave edits to the same record.

use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::{JobError, StoreError};
use crate::jobs::args::{RawArgs, StepArgs};
use crate::jobs::store::JobStore;
use crate::jobs::{Job, JobFailure, JobStatus, Step, StepStatus, validate_job_id};

/// Enforces the job state machine on top of a [`JobStore`].
pub struct JobManager {
    store: Arc<JobStore>,
    lifecycle: Mutex<()>,
}

impl JobManager {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Create a drafted job with no steps.
    pub fn create_job(&self, id: &str) -> Result<Job, JobError> {
        validate_job_id(id)?;
        let _guard = self.lock();
        if self.store.contains(id) {
            return Err(JobError::Conflict { id: id.to_string() });
        }

        let job = Job::new(id);
        self.store.create(&job).map_err(|e| match e {
            StoreError::Conflict { id } => JobError::Conflict { id },
            other => JobError::Persistence(other),
        })?;
        tracing::info!(job_id = %id, "Job created");
        Ok(job)
    }

    /// Validate `args` and append them as the job's next step.
    ///
    /// Only drafted jobs accept steps. Validation happens here, so a step
    /// that reaches the store is always well-formed.
    pub fn add_step(&self, id: &str, args: RawArgs) -> Result<Step, JobError> {
        let _guard = self.lock();
        let mut job = self.load(id)?;
        if job.status != JobStatus::Drafted {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: job.status,
                operation: "add a step to",
            });
        }

        let args = StepArgs::validate(args)?;
        let step = Step::new(job.steps.len(), args);
        job.steps.push(step.clone());
        job.updated_at = Utc::now();
        self.store.save(&job)?;

        tracing::debug!(
            job_id = %id,
            step = step.index,
            kind = %step.kind,
            "Step added"
        );
        Ok(step)
    }

    /// Move a drafted job with at least one step to `queued`.
    pub fn submit_job(&self, id: &str) -> Result<Job, JobError> {
        let _guard = self.lock();
        let mut job = self.load(id)?;
        if job.status != JobStatus::Drafted {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: job.status,
                operation: "submit",
            });
        }
        if job.steps.is_empty() {
            return Err(JobError::EmptyJob { id: id.to_string() });
        }

        self.transition(&mut job, JobStatus::Queued)?;
        tracing::info!(job_id = %id, steps = job.steps.len(), "Job submitted");
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.store.load(id)
    }

    /// Jobs in `status`, oldest first.
    pub fn find_jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.store.list(status)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.store.list_all()
    }

    pub fn step_count(&self, id: &str) -> Result<usize, JobError> {
        Ok(self.load(id)?.steps.len())
    }

    /// Fail every job left in `processing` by a previous process.
    ///
    /// Call once at startup, after the store is opened and before any run
    /// starts: nothing in a fresh process can still hold the processing
    /// slot for those jobs.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, JobError> {
        let _guard = self.lock();
        let mut recovered = Vec::new();
        for mut job in self.store.list(JobStatus::Processing) {
            job.failure = Some(JobFailure::Interrupted);
            self.transition(&mut job, JobStatus::Failed)?;
            tracing::warn!(job_id = %job.id, "Interrupted job marked failed");
            recovered.push(job.id);
        }
        Ok(recovered)
    }

    /// `queued -> processing`.
    ///
    /// Refused with [`JobError::ConcurrencyBusy`] while any other job is
    /// still recorded as processing, even if no runner holds the slot.
    pub(crate) fn start_processing(&self, id: &str) -> Result<Job, JobError> {
        let _guard = self.lock();
        let mut job = self.load(id)?;
        if job.status != JobStatus::Queued {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: job.status,
                operation: "run",
            });
        }
        if let Some(other) = self.store.list(JobStatus::Processing).first() {
            tracing::warn!(
                job_id = %id,
                processing = %other.id,
                "Run refused, another job is still recorded as processing"
            );
            return Err(JobError::ConcurrencyBusy);
        }
        self.transition(&mut job, JobStatus::Processing)?;
        Ok(job)
    }

    /// Record the outcome of one step of a processing job.
    pub(crate) fn record_step(
        &self,
        id: &str,
        index: usize,
        status: StepStatus,
        detail: Option<String>,
    ) -> Result<Job, JobError> {
        let _guard = self.lock();
        let mut job = self.load(id)?;
        if job.status != JobStatus::Processing {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: job.status,
                operation: "record a step result for",
            });
        }

        let now = Utc::now();
        let Some(step) = job.steps.get_mut(index) else {
            return Err(JobError::NotFound {
                id: format!("{id}#{index}"),
            });
        };
        step.status = status;
        step.detail = detail;
        step.finished_at = Some(now);
        job.updated_at = now;
        self.store.save(&job)?;
        Ok(job)
    }

    /// Move a processing job to its terminal status.
    pub(crate) fn finish(
        &self,
        id: &str,
        status: JobStatus,
        failure: Option<JobFailure>,
    ) -> Result<Job, JobError> {
        let _guard = self.lock();
        let mut job = self.load(id)?;
        job.failure = failure;
        self.transition(&mut job, status)?;
        Ok(job)
    }

    fn transition(&self, job: &mut Job, to: JobStatus) -> Result<(), JobError> {
        if !job.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to,
            });
        }
        let from = job.status;
        job.status = to;
        job.updated_at = Utc::now();
        if let Err(e) = self.store.save(job) {
            job.status = from;
            return Err(e.into());
        }
        tracing::debug!(job_id = %job.id, %from, %to, "Job transitioned");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Job, JobError> {
        self.store
            .load(id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ArgValue;

    fn manager() -> (JobManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(dir.path()).expect("open store");
        (JobManager::new(Arc::new(store)), dir)
    }

    fn output(path: &str) -> RawArgs {
        let mut args = RawArgs::new();
        args.insert("output_path".to_string(), ArgValue::from(path));
        args
    }

    #[test]
    fn create_job_starts_drafted() {
        let (mgr, _dir) = manager();
        let job = mgr.create_job("j1").expect("create");
        assert_eq!(job.status, JobStatus::Drafted);
        assert_eq!(mgr.get_job("j1"), Some(job));
    }

    #[test]
    fn create_job_conflict() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").expect("create");
        assert!(matches!(
            mgr.create_job("j1"),
            Err(JobError::Conflict { .. })
        ));
    }

    #[test]
    fn create_job_rejects_unsafe_ids() {
        let (mgr, _dir) = manager();
        assert!(matches!(
            mgr.create_job("../etc/passwd"),
            Err(JobError::InvalidId { .. })
        ));
    }

    #[test]
    fn add_step_assigns_sequential_indices() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        let first = mgr.add_step("j1", output("/tmp/a.png")).unwrap();
        let second = mgr.add_step("j1", output("/tmp/b.mp4")).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(mgr.step_count("j1").unwrap(), 2);
    }

    #[test]
    fn add_step_copies_arguments() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        let mut args = output("/tmp/a.png");
        mgr.add_step("j1", args.clone()).unwrap();
        args.insert("output_path".to_string(), ArgValue::from("/tmp/changed.png"));

        let job = mgr.get_job("j1").unwrap();
        assert_eq!(
            job.steps[0].args.output_path(),
            Some(std::path::Path::new("/tmp/a.png"))
        );
    }

    #[test]
    fn add_step_unknown_job() {
        let (mgr, _dir) = manager();
        assert!(matches!(
            mgr.add_step("ghost", output("/tmp/a.png")),
            Err(JobError::NotFound { .. })
        ));
    }

    #[test]
    fn add_step_rejects_invalid_arguments() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        let mut args = RawArgs::new();
        args.insert("output_path".to_string(), ArgValue::Bool(true));
        assert!(matches!(
            mgr.add_step("j1", args),
            Err(JobError::InvalidArguments(_))
        ));
        assert_eq!(mgr.step_count("j1").unwrap(), 0);
    }

    #[test]
    fn add_step_after_submit_is_rejected() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        mgr.add_step("j1", output("/tmp/a.png")).unwrap();
        mgr.submit_job("j1").unwrap();

        let err = mgr.add_step("j1", output("/tmp/b.png")).unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(mgr.step_count("j1").unwrap(), 1);
    }

    #[test]
    fn submit_empty_job_stays_drafted() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        assert!(matches!(
            mgr.submit_job("j1"),
            Err(JobError::EmptyJob { .. })
        ));
        assert_eq!(mgr.get_job("j1").unwrap().status, JobStatus::Drafted);
    }

    #[test]
    fn submit_twice_is_rejected() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        mgr.add_step("j1", output("/tmp/a.png")).unwrap();
        assert_eq!(mgr.submit_job("j1").unwrap().status, JobStatus::Queued);
        assert!(mgr.submit_job("j1").unwrap_err().is_invalid_state());
    }

    #[test]
    fn find_jobs_by_status_partitions_jobs() {
        let (mgr, _dir) = manager();
        for id in ["a", "b", "c"] {
            mgr.create_job(id).unwrap();
            mgr.add_step(id, output("/tmp/x.png")).unwrap();
        }
        mgr.submit_job("b").unwrap();

        let drafted: Vec<_> = mgr
            .find_jobs_by_status(JobStatus::Drafted)
            .into_iter()
            .map(|j| j.id)
            .collect();
        let queued: Vec<_> = mgr
            .find_jobs_by_status(JobStatus::Queued)
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(drafted, vec!["a", "c"]);
        assert_eq!(queued, vec!["b"]);
    }

    #[test]
    fn start_processing_requires_queued() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        mgr.add_step("j1", output("/tmp/a.png")).unwrap();
        assert!(mgr.start_processing("j1").unwrap_err().is_invalid_state());

        mgr.submit_job("j1").unwrap();
        assert_eq!(
            mgr.start_processing("j1").unwrap().status,
            JobStatus::Processing
        );
    }

    #[test]
    fn start_processing_refuses_while_another_job_is_processing() {
        let (mgr, _dir) = manager();
        for id in ["a", "b"] {
            mgr.create_job(id).unwrap();
            mgr.add_step(id, output("/tmp/a.png")).unwrap();
            mgr.submit_job(id).unwrap();
        }
        mgr.start_processing("a").unwrap();
        assert!(matches!(
            mgr.start_processing("b"),
            Err(JobError::ConcurrencyBusy)
        ));
        assert_eq!(mgr.get_job("b").unwrap().status, JobStatus::Queued);

        mgr.finish("a", JobStatus::Completed, None).unwrap();
        assert_eq!(
            mgr.start_processing("b").unwrap().status,
            JobStatus::Processing
        );
    }

    #[test]
    fn finish_rejects_skipping_processing() {
        let (mgr, _dir) = manager();
        mgr.create_job("j1").unwrap();
        mgr.add_step("j1", output("/tmp/a.png")).unwrap();
        mgr.submit_job("j1").unwrap();
        assert!(matches!(
            mgr.finish("j1", JobStatus::Completed, None),
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(mgr.get_job("j1").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn recover_interrupted_fails_processing_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = Arc::new(JobStore::open(dir.path()).unwrap());
            let mgr = JobManager::new(store);
            mgr.create_job("j1").unwrap();
            mgr.add_step("j1", output("/tmp/a.png")).unwrap();
            mgr.submit_job("j1").unwrap();
            mgr.start_processing("j1").unwrap();
        }

        let mgr = JobManager::new(Arc::new(JobStore::open(dir.path()).unwrap()));
        let recovered = mgr.recover_interrupted().unwrap();
        assert_eq!(recovered, vec!["j1".to_string()]);
        let job = mgr.get_job("j1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure, Some(JobFailure::Interrupted));
    }
}
