//! Collision-free job id suggestions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::JobError;
use crate::jobs::store::JobStore;
use crate::jobs::validate_job_id;

/// Source of "now" for id timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Timestamp layout used in suggested ids.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Suggests ids of the form `<prefix>-<YYYY-MM-DD-HH-MM-SS>[-<n>]`.
///
/// A candidate is rejected if the store already holds it or if this
/// allocator handed it out before (the caller may not have created the job
/// yet). Rejected candidates get a counter suffix and are retried.
pub struct JobIdAllocator {
    store: Arc<JobStore>,
    clock: Clock,
    state: Mutex<AllocState>,
}

#[derive(Default)]
struct AllocState {
    counter: u64,
    issued: HashSet<String>,
}

impl JobIdAllocator {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self::with_clock(store, Arc::new(Utc::now))
    }

    pub fn with_clock(store: Arc<JobStore>, clock: Clock) -> Self {
        Self {
            store,
            clock,
            state: Mutex::new(AllocState::default()),
        }
    }

    /// Suggest an id that is neither in the store nor previously suggested.
    pub fn suggest_job_id(&self, prefix: &str) -> Result<String, JobError> {
        validate_job_id(prefix)?;
        let stamp = (self.clock)().format(TIMESTAMP_FORMAT).to_string();
        let base = format!("{prefix}-{stamp}");
        // The suffixed form must still be a valid id.
        validate_job_id(&base)?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut candidate = base.clone();
        loop {
            if !self.store.contains(&candidate) && !state.issued.contains(&candidate) {
                state.issued.insert(candidate.clone());
                return Ok(candidate);
            }
            state.counter += 1;
            tracing::debug!(%candidate, "Job id collision, retrying with suffix");
            candidate = format!("{base}-{}", state.counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::jobs::Job;

    fn fixed_clock() -> Clock {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
        Arc::new(move || now)
    }

    #[test]
    fn suggests_prefix_and_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        let alloc = JobIdAllocator::with_clock(store, fixed_clock());
        assert_eq!(alloc.suggest_job_id("ui").unwrap(), "ui-2024-05-17-09-30-00");
    }

    #[test]
    fn rejects_invalid_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        let alloc = JobIdAllocator::new(store);
        assert!(matches!(
            alloc.suggest_job_id("bad/prefix"),
            Err(JobError::InvalidId { .. })
        ));
    }

    #[test]
    fn skips_ids_already_in_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        store.create(&Job::new("ui-2024-05-17-09-30-00")).unwrap();
        store.create(&Job::new("ui-2024-05-17-09-30-00-1")).unwrap();

        let alloc = JobIdAllocator::with_clock(store.clone(), fixed_clock());
        let id = alloc.suggest_job_id("ui").unwrap();
        assert_eq!(id, "ui-2024-05-17-09-30-00-2");
        assert!(!store.contains(&id));
    }

    #[test]
    fn never_repeats_under_forced_collisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        // Seed the store with the base id and a run of suffixed ids.
        store.create(&Job::new("ui-2024-05-17-09-30-00")).unwrap();
        for n in [1, 2, 3, 10, 50, 500] {
            store
                .create(&Job::new(format!("ui-2024-05-17-09-30-00-{n}")))
                .unwrap();
        }

        let alloc = JobIdAllocator::with_clock(store.clone(), fixed_clock());
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = alloc.suggest_job_id("ui").unwrap();
            assert!(!store.contains(&id), "{id} already in store");
            assert!(seen.insert(id.clone()), "{id} suggested twice");
        }
    }

    #[test]
    fn suggested_ids_are_creatable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        let alloc = JobIdAllocator::with_clock(store.clone(), fixed_clock());
        for _ in 0..20 {
            let id = alloc.suggest_job_id("cli").unwrap();
            store.create(&Job::new(id)).unwrap();
        }
        assert_eq!(store.len(), 20);
    }
}
