//! On-disk job documents, their lock files and temp artifacts.
//!
//! Layout inside the state directory, per job id:
//! - `{job_id}.json`  the job document
//! - `{job_id}.lock`  advisory lock file
//! - `{job_id}.{ext}.part`  the in-progress output artifact

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::StoreError;
use crate::feed::FeedFormat;

pub mod lock;
pub mod state;

pub use lock::StateLock;
pub use state::{batches_for, JobState, JobStatus, PublishedFeed};

/// What a file in the state directory is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    State,
    Lock,
    Output,
    /// Leftover from an interrupted atomic save.
    PendingState,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub job_id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Job ids become file names, so only a safe alphabet is accepted.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 64
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone)]
pub struct JobStateStore {
    directory: PathBuf,
}

impl JobStateStore {
    /// Opens the store, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self, StoreError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory).map_err(|e| StoreError::CreateDirectory {
            path: directory.clone(),
            source: e,
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn state_path(&self, job_id: &str) -> PathBuf {
        self.directory.join(format!("{}.json", job_id))
    }

    pub fn lock_path(&self, job_id: &str) -> PathBuf {
        self.directory.join(format!("{}.lock", job_id))
    }

    pub fn temp_path(&self, job_id: &str, format: FeedFormat) -> PathBuf {
        self.directory
            .join(format!("{}.{}.part", job_id, format.extension()))
    }

    fn pending_path(&self, job_id: &str) -> PathBuf {
        self.directory.join(format!("{}.json.tmp", job_id))
    }

    /// Non-blocking; `Ok(None)` when another call holds the job.
    pub fn try_lock(&self, job_id: &str) -> Result<Option<StateLock>, StoreError> {
        StateLock::try_acquire(&self.lock_path(job_id))
    }

    /// Waits for the job's lock.
    pub fn lock(&self, job_id: &str) -> Result<StateLock, StoreError> {
        StateLock::acquire(&self.lock_path(job_id))
    }

    /// Writes the whole document atomically (temp file, fsync, rename).
    pub fn save(&self, state: &JobState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        let pending = self.pending_path(&state.job_id);
        let target = self.state_path(&state.job_id);

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&pending)?;
            file.write_all(&json)?;
            file.sync_all()?;
            Ok(())
        };
        write().map_err(|e| StoreError::WriteState {
            path: pending.clone(),
            source: e,
        })?;

        std::fs::rename(&pending, &target).map_err(|e| StoreError::WriteState {
            path: target.clone(),
            source: e,
        })?;

        log::debug!("Saved job {} ({})", state.job_id, state.status);
        Ok(())
    }

    /// Loads a job document. Missing, unreadable or corrupt documents all
    /// read as "not found".
    pub fn load(&self, job_id: &str) -> Option<JobState> {
        if !is_valid_job_id(job_id) {
            return None;
        }
        let path = self.state_path(job_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Failed to read job state {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("Corrupt job state {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Removes a file, treating "already gone" as success.
    pub fn remove_file(path: &Path) -> Result<bool, StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Remove {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Deletes every artifact of a job: document, temp output, lock file.
    /// Returns how many files were removed.
    pub fn delete_all(&self, job_id: &str, temp_path: Option<&Path>) -> Result<usize, StoreError> {
        let mut removed = 0;
        if let Some(temp) = temp_path {
            removed += Self::remove_file(temp)? as usize;
        }
        removed += Self::remove_file(&self.pending_path(job_id))? as usize;
        removed += Self::remove_file(&self.state_path(job_id))? as usize;
        removed += Self::remove_file(&self.lock_path(job_id))? as usize;
        Ok(removed)
    }

    /// Every recognised file in the state directory.
    pub fn artifacts(&self) -> Result<Vec<Artifact>, StoreError> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| StoreError::ReadDirectory {
            path: self.directory.clone(),
            source: e,
        })?;

        let mut artifacts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((job_id, rest)) = name.split_once('.') else {
                continue;
            };
            if !is_valid_job_id(job_id) {
                continue;
            }
            let kind = match rest {
                "json" => ArtifactKind::State,
                "lock" => ArtifactKind::Lock,
                "json.tmp" => ArtifactKind::PendingState,
                r if r.ends_with(".part") => ArtifactKind::Output,
                _ => continue,
            };
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            artifacts.push(Artifact {
                job_id: job_id.to_string(),
                kind,
                path,
                modified,
            });
        }
        Ok(artifacts)
    }
}
