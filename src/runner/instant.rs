//! One-shot "stage, create, submit, run" workflow for interactive front-ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::JobsConfig;
use crate::error::JobError;
use crate::jobs::{ArgValue, JobIdAllocator, RawArgs};
use crate::runner::{JobRunner, RunReport, StepExecutor};
use crate::state::StateStore;

/// Length of the random tag in suggested output file names.
const OUTPUT_TAG_LEN: usize = 8;

/// Turns the current staged arguments into a single-step job and runs it.
pub struct InstantRunner {
    runner: Arc<JobRunner>,
    allocator: Arc<JobIdAllocator>,
    state: Arc<StateStore>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl InstantRunner {
    pub fn new(
        runner: Arc<JobRunner>,
        allocator: Arc<JobIdAllocator>,
        state: Arc<StateStore>,
    ) -> Self {
        Self::from_config(runner, allocator, state, &JobsConfig::default())
    }

    /// Like [`new`](Self::new), polling with the configured interval and
    /// timeout.
    pub fn from_config(
        runner: Arc<JobRunner>,
        allocator: Arc<JobIdAllocator>,
        state: Arc<StateStore>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            runner,
            allocator,
            state,
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Sync `keys` in the state store, snapshot them into a new job under a
    /// suggested id, and run it.
    ///
    /// An `output_path` naming a directory is replaced with a fresh file
    /// inside it (see [`suggest_output_path`]). A job that fails before it
    /// is submitted (bad arguments, for instance) is left drafted.
    pub async fn create_and_run_job(
        &self,
        prefix: &str,
        keys: &[&str],
        executor: &dyn StepExecutor,
    ) -> Result<RunReport, JobError> {
        let id = self.allocator.suggest_job_id(prefix)?;
        for key in keys {
            self.state.sync_item(key);
        }
        let mut args = self.state.collect_step_args(keys.iter().copied());
        resolve_output_path(&mut args);

        let manager = self.runner.manager();
        manager.create_job(&id)?;
        manager.add_step(&id, args)?;
        manager.submit_job(&id)?;
        tracing::info!(job_id = %id, "Instant job submitted");

        self.runner.run_job(&id, executor).await
    }

    /// Wait until some job is processing. Returns `false` on timeout.
    pub async fn wait_until_processing(&self) -> bool {
        self.wait_for(true).await
    }

    /// Wait until no job is processing. Returns `false` on timeout.
    pub async fn wait_until_idle(&self) -> bool {
        self.wait_for(false).await
    }

    async fn wait_for(&self, processing: bool) -> bool {
        let process = self.runner.process();
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            if process.is_processing() == processing {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::debug!(processing, "Timed out waiting on processing state");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn resolve_output_path(args: &mut RawArgs) {
    let Some(output) = args.get("output_path").and_then(path_value) else {
        return;
    };
    if !output.is_dir() {
        return;
    }
    let target = args
        .get("target_path")
        .and_then(path_value)
        .unwrap_or_default();
    let resolved = suggest_output_path(&output, &target);
    tracing::debug!(output = %resolved.display(), "Output directory resolved to a file");
    args.insert("output_path".to_string(), ArgValue::Path(resolved));
}

/// Staged paths may still be plain strings; validation promotes them later.
fn path_value(value: &ArgValue) -> Option<PathBuf> {
    match value {
        ArgValue::Path(p) => Some(p.clone()),
        ArgValue::String(s) => Some(PathBuf::from(s)),
        _ => None,
    }
}

/// Pick a concrete output file when `output_path` names a directory.
///
/// The file is named after the target with a random tag appended, so
/// repeated runs into the same directory do not overwrite each other:
/// `<dir>/<target-stem>-<tag><target-ext>`. Any other `output_path` is
/// returned unchanged.
pub fn suggest_output_path(output_path: &Path, target_path: &Path) -> PathBuf {
    if !output_path.is_dir() {
        return output_path.to_path_buf();
    }
    let stem = target_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let mut name = format!("{stem}-{}", &tag[..OUTPUT_TAG_LEN]);
    if let Some(ext) = target_path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    output_path.join(name)
}
