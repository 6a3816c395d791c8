//! Reclaims generations and on-disk artifacts left behind by abandoned jobs.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::db::{generation_repo, Database};
use crate::error::Result;
use crate::store::{Artifact, ArtifactKind, JobStateStore};

/// What a stale sweep cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub generations_failed: usize,
    pub files_removed: usize,
}

#[derive(Clone)]
pub struct StaleJobReaper {
    db: Database,
    store: JobStateStore,
    stale_timeout: Duration,
}

impl StaleJobReaper {
    pub fn new(db: Database, store: JobStateStore, stale_timeout: Duration) -> Self {
        Self {
            db,
            store,
            stale_timeout,
        }
    }

    /// Fails running generations of `feed_id` whose heartbeat is older than
    /// the stale timeout, then deletes that feed's job files untouched for
    /// as long. Jobs whose lock is currently held are left alone.
    pub fn cleanup_stale_jobs(&self, feed_id: &str) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for row in generation_repo::fail_stale(&self.db, feed_id, self.stale_timeout)? {
            warn!(
                feed_id = %feed_id,
                job_id = %row.job_id,
                log_id = row.id,
                "Reclaimed stale generation"
            );
            report.generations_failed += 1;
            self.fail_document(&row.job_id);
        }

        let Some(cutoff) = SystemTime::now().checked_sub(self.stale_timeout) else {
            return Ok(report);
        };
        for (job_id, group) in self.idle_jobs(cutoff)? {
            let belongs_to_feed = self
                .store
                .load(&job_id)
                .is_some_and(|state| state.feed_id == feed_id);
            if belongs_to_feed {
                report.files_removed += self.remove_job_files(&job_id, &group)?;
            }
        }

        if report != SweepReport::default() {
            info!(
                feed_id = %feed_id,
                generations_failed = report.generations_failed,
                files_removed = report.files_removed,
                "Stale job sweep finished"
            );
        }
        Ok(report)
    }

    /// Deletes every job whose files are all older than `max_age_hours`,
    /// whatever its feed or status. Unfinished generations of those jobs are
    /// marked failed. Returns the number of files removed.
    pub fn cleanup_old_jobs(&self, max_age_hours: u64) -> Result<usize> {
        let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(0);
        };

        let mut removed = 0;
        for (job_id, group) in self.idle_jobs(cutoff)? {
            if let Some(state) = self.store.load(&job_id) {
                if !state.status.is_terminal()
                    && generation_repo::mark_failed(&self.db, state.log_id, "Expired by cleanup")?
                {
                    warn!(job_id = %job_id, log_id = state.log_id, "Expired unfinished generation");
                }
            }
            removed += self.remove_job_files(&job_id, &group)?;
        }

        info!(max_age_hours, removed, "Old job cleanup finished");
        Ok(removed)
    }

    /// Artifacts grouped by job, keeping only jobs with nothing newer than `cutoff`.
    fn idle_jobs(&self, cutoff: SystemTime) -> Result<BTreeMap<String, Vec<Artifact>>> {
        let mut jobs: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
        for artifact in self.store.artifacts()? {
            jobs.entry(artifact.job_id.clone()).or_default().push(artifact);
        }
        jobs.retain(|_, group| group.iter().all(|a| a.modified < cutoff));
        Ok(jobs)
    }

    /// Removes the listed files of one job under its lock. Busy jobs are skipped.
    fn remove_job_files(&self, job_id: &str, group: &[Artifact]) -> Result<usize> {
        let Some(_guard) = self.store.try_lock(job_id)? else {
            debug!(job_id = %job_id, "Job is locked, skipping cleanup");
            return Ok(0);
        };

        let mut removed = 0;
        for artifact in group.iter().filter(|a| a.kind != ArtifactKind::Lock) {
            removed += JobStateStore::remove_file(&artifact.path)? as usize;
        }
        let lock_removed = JobStateStore::remove_file(&self.store.lock_path(job_id))?;
        if lock_removed && group.iter().any(|a| a.kind == ArtifactKind::Lock) {
            removed += 1;
        }
        debug!(job_id = %job_id, removed, "Removed job files");
        Ok(removed)
    }

    /// Brings a reclaimed job's document in line with its failed generation.
    pub(crate) fn fail_document(&self, job_id: &str) {
        let guard = match self.store.try_lock(job_id) {
            Ok(Some(guard)) => guard,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not lock reclaimed job");
                return;
            }
        };
        if let Some(mut state) = self.store.load(job_id) {
            if !state.status.is_terminal() {
                state.fail("Generation timed out without progress".to_string());
                if let Err(e) = self.store.save(&state) {
                    warn!(job_id = %job_id, error = %e, "Could not update reclaimed job");
                }
            }
        }
        drop(guard);
    }
}
