//! The persisted job document.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::UploadStatus;
use crate::writer::WriterState;

/// Status of a batch job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Initializing,
    Processing,
    Finalizing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initializing => "initializing",
            JobStatus::Processing => "processing",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a completed job's artifact ended up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedFeed {
    pub file_path: PathBuf,
    pub file_url: String,
    pub file_size: u64,
    pub upload_status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Progress of one feed generation run. The only state that survives
/// between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub feed_id: String,
    /// Generation log row holding the feed's lock.
    pub log_id: i64,
    pub status: JobStatus,
    pub total_products: u64,
    pub processed_count: u64,
    /// Records actually written.
    pub product_count: u64,
    /// Records that failed to render.
    #[serde(default)]
    pub skipped_count: u64,
    pub current_page: u64,
    pub batch_size: u64,
    pub batches_total: u64,
    pub batches_processed: u64,
    pub temp_path: PathBuf,
    #[serde(default)]
    pub errors: Vec<String>,
    pub writer: WriterState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<PublishedFeed>,
}

/// `ceil(total / batch_size)`.
pub fn batches_for(total: u64, batch_size: u64) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    total.div_ceil(batch_size)
}

impl JobState {
    pub fn new(
        job_id: &str,
        feed_id: &str,
        log_id: i64,
        total_products: u64,
        batch_size: u64,
        writer: WriterState,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            feed_id: feed_id.to_string(),
            log_id,
            status: JobStatus::Initializing,
            total_products,
            processed_count: 0,
            product_count: 0,
            skipped_count: 0,
            current_page: 0,
            batch_size,
            batches_total: batches_for(total_products, batch_size),
            batches_processed: 0,
            temp_path: writer.path.clone(),
            errors: Vec::new(),
            writer,
            started_at: now,
            updated_at: now,
            published: None,
        }
    }

    /// Percent of products processed, 0-100.
    pub fn progress(&self) -> f64 {
        if self.total_products == 0 {
            return match self.status {
                JobStatus::Initializing => 0.0,
                _ => 100.0,
            };
        }
        let pct = self.processed_count as f64 / self.total_products as f64 * 100.0;
        (pct * 10.0).round().min(1000.0) / 10.0
    }

    /// Percent of processed products that failed to render.
    pub fn error_rate(&self) -> f64 {
        if self.processed_count == 0 {
            return 0.0;
        }
        self.skipped_count as f64 / self.processed_count as f64 * 100.0
    }

    pub fn is_input_exhausted(&self) -> bool {
        self.processed_count >= self.total_products
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Marks the job failed, keeping everything accumulated so far.
    pub fn fail(&mut self, error: String) {
        self.errors.push(error);
        self.status = JobStatus::Failed;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedFormat;

    fn writer_state() -> WriterState {
        WriterState {
            path: PathBuf::from("/state/job.xml.part"),
            format: FeedFormat::Xml,
            footer: "</products>\n".to_string(),
            records_written: 0,
            bytes_committed: 50,
            closed: false,
        }
    }

    #[test]
    fn test_batches_for() {
        assert_eq!(batches_for(250, 100), 3);
        assert_eq!(batches_for(200, 100), 2);
        assert_eq!(batches_for(0, 100), 0);
        assert_eq!(batches_for(5, 0), 0);
    }

    #[test]
    fn test_new_job_state() {
        let state = JobState::new("job-1", "feed-1", 7, 250, 100, writer_state());
        assert_eq!(state.status, JobStatus::Initializing);
        assert_eq!(state.batches_total, 3);
        assert_eq!(state.processed_count, 0);
        assert_eq!(state.temp_path, PathBuf::from("/state/job.xml.part"));
        assert!(state.errors.is_empty());
    }

    #[test]
    fn test_progress_and_error_rate() {
        let mut state = JobState::new("j", "f", 1, 250, 100, writer_state());
        state.processed_count = 100;
        state.skipped_count = 15;
        assert_eq!(state.progress(), 40.0);
        assert_eq!(state.error_rate(), 15.0);
        assert!(!state.is_input_exhausted());

        state.processed_count = 250;
        assert_eq!(state.progress(), 100.0);
        assert!(state.is_input_exhausted());
    }

    #[test]
    fn test_progress_of_empty_feed() {
        let mut state = JobState::new("j", "f", 1, 0, 100, writer_state());
        assert_eq!(state.progress(), 0.0);
        state.status = JobStatus::Finalizing;
        assert_eq!(state.progress(), 100.0);
    }

    #[test]
    fn test_fail_keeps_errors() {
        let mut state = JobState::new("j", "f", 1, 10, 5, writer_state());
        state.errors.push("product 3: missing title".to_string());
        state.fail("disk full".to_string());
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.errors.len(), 2);
        assert!(state.status.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Finalizing).unwrap(),
            "\"finalizing\""
        );
        assert_eq!(JobStatus::Processing.to_string(), "processing");
    }
}
