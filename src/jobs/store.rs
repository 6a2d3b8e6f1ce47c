//! Durable, file-backed storage for job records.
//!
//! Records live as pretty-printed JSON under one partition per status:
//!
//! ```text
//! <root>/
//!   drafted/<id>.json
//!   queued/<id>.json
//!   processing/<id>.json
//!   completed/<id>.json
//!   failed/<id>.json
//! ```
//!
//! Every write goes to a temp file in the destination partition, is synced,
//! and is then renamed into place, so a crash never leaves a half-written
//! record. A status change writes the new copy first and removes the old one
//! second; if the process dies in between, [`JobStore::open`] keeps the copy
//! with the most advanced status.
//!
//! Reads are served from an in-memory index rebuilt by `open`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::error::StoreError;
use crate::jobs::{Job, JobStatus};

const RECORD_EXTENSION: &str = "json";
const TEMP_PREFIX: &str = ".tmp-";

/// File-backed job store with an in-memory index.
pub struct JobStore {
    root: PathBuf,
    /// Serializes mutations. Held across disk I/O; readers never take it.
    write_lock: Mutex<()>,
    /// Held only for in-memory reads and updates, never across disk I/O.
    index: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    /// Open (or initialize) a store rooted at `root`.
    ///
    /// Creates the status partitions if missing, removes leftover temp
    /// files, and rebuilds the index from the records on disk. This is the
    /// only recovery step needed after a restart.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(StoreError::InvalidRoot {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        for status in JobStatus::ALL {
            let dir = root.join(status.as_str());
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }

        let index = scan(&root)?;
        tracing::info!(
            root = %root.display(),
            jobs = index.len(),
            "Job store opened"
        );

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record file for `id` in the `status` partition.
    pub fn record_path(&self, id: &str, status: JobStatus) -> PathBuf {
        record_path(&self.root, id, status)
    }

    /// Persist a brand-new job under the partition of its status.
    ///
    /// Fails with [`StoreError::Conflict`] if the id is already known. On any
    /// failure neither the disk nor the index is changed.
    pub fn create(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.contains(&job.id) {
            return Err(StoreError::Conflict { id: job.id.clone() });
        }

        write_atomic(&self.root, job)?;
        self.index().insert(job.id.clone(), job.clone());
        tracing::debug!(job_id = %job.id, status = %job.status, "Job record created");
        Ok(())
    }

    /// Persist an updated job, relocating it if its status changed.
    ///
    /// The record must already exist. The index is only updated once the
    /// new record is durably in place.
    pub fn save(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self
            .index()
            .get(&job.id)
            .map(|j| j.status)
            .ok_or_else(|| StoreError::NotFound { id: job.id.clone() })?;

        write_atomic(&self.root, job)?;
        if previous != job.status {
            let stale = self.record_path(&job.id, previous);
            if let Err(e) = std::fs::remove_file(&stale) {
                // The newer copy wins on the next open, so this is not fatal.
                tracing::warn!(
                    job_id = %job.id,
                    path = %stale.display(),
                    "Failed to remove stale job record: {}",
                    e
                );
            }
            tracing::debug!(
                job_id = %job.id,
                from = %previous,
                to = %job.status,
                "Job record moved"
            );
        }

        self.index().insert(job.id.clone(), job.clone());
        Ok(())
    }

    /// Relocate a record to the partition for `status` and bump its
    /// `updated_at`. Does not enforce the lifecycle; that is the manager's job.
    pub fn move_job(&self, id: &str, status: JobStatus) -> Result<Job, StoreError> {
        let mut job = self
            .load(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        job.status = status;
        job.updated_at = Utc::now();
        self.save(&job)?;
        Ok(job)
    }

    /// Snapshot of one job from the index.
    pub fn load(&self, id: &str) -> Option<Job> {
        self.index().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index().contains_key(id)
    }

    /// Jobs in `status`, oldest first.
    pub fn list(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .index()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        sort_by_creation(&mut jobs);
        jobs
    }

    /// Every job in the store, oldest first.
    pub fn list_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.index().values().cloned().collect();
        sort_by_creation(&mut jobs);
        jobs
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    fn index(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn record_path(root: &Path, id: &str, status: JobStatus) -> PathBuf {
    root.join(status.as_str())
        .join(format!("{id}.{RECORD_EXTENSION}"))
}

fn sort_by_creation(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Write `job` into its status partition via temp file + fsync + rename.
fn write_atomic(root: &Path, job: &Job) -> Result<(), StoreError> {
    let dir = root.join(job.status.as_str());
    let dest = record_path(root, &job.id, job.status);

    let mut payload = serde_json::to_vec_pretty(job).map_err(|e| StoreError::Serialization {
        id: job.id.clone(),
        reason: e.to_string(),
    })?;
    payload.push(b'\n');

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(&dir)
        .map_err(|e| StoreError::io(&dir, e))?;
    tmp.write_all(&payload)
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(&dest)
        .map_err(|e| StoreError::io(&dest, e.error))?;
    Ok(())
}

/// Rebuild the index from every partition under `root`.
fn scan(root: &Path) -> Result<HashMap<String, Job>, StoreError> {
    let mut index: HashMap<String, Job> = HashMap::new();

    for status in JobStatus::ALL {
        let dir = root.join(status.as_str());
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();

            if name.starts_with(TEMP_PREFIX) {
                tracing::warn!(path = %path.display(), "Removing leftover temp record");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION)
            {
                continue;
            }

            let mut job = match read_record(&path) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable job record: {}", e);
                    continue;
                }
            };

            // Moves address records by id, so a file named after another id
            // could never be cleaned up.
            if path.file_stem().and_then(|s| s.to_str()) != Some(job.id.as_str()) {
                tracing::warn!(
                    job_id = %job.id,
                    path = %path.display(),
                    "Skipping job record whose file name does not match its id"
                );
                continue;
            }

            // The partition is authoritative for status.
            if job.status != status {
                tracing::warn!(
                    job_id = %job.id,
                    recorded = %job.status,
                    partition = %status,
                    "Job record status disagrees with its partition"
                );
                job.status = status;
            }

            match index.get(&job.id) {
                Some(existing) if existing.status >= job.status => {
                    remove_stale(root, &job.id, job.status);
                }
                Some(existing) => {
                    remove_stale(root, &job.id, existing.status);
                    index.insert(job.id.clone(), job);
                }
                None => {
                    index.insert(job.id.clone(), job);
                }
            }
        }
    }

    Ok(index)
}

fn read_record(path: &Path) -> Result<Job, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

fn remove_stale(root: &Path, id: &str, status: JobStatus) {
    let path = record_path(root, id, status);
    tracing::warn!(job_id = %id, path = %path.display(), "Removing superseded job record");
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), "Failed to remove superseded record: {}", e);
    }
}
