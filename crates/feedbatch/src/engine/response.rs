//! JSON-serialisable results handed back to callers.

use serde::{Deserialize, Serialize};

use crate::store::{JobState, JobStatus};

/// Status reported to callers. Adds the outcomes that have no job document
/// behind them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Initializing,
    Processing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl From<JobStatus> for ResponseStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Initializing => ResponseStatus::Initializing,
            JobStatus::Processing => ResponseStatus::Processing,
            JobStatus::Finalizing => ResponseStatus::Finalizing,
            JobStatus::Completed => ResponseStatus::Completed,
            JobStatus::Failed => ResponseStatus::Failed,
        }
    }
}

/// Outcome of the optional upload step. A failed upload does not fail the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub job_id: String,
    pub log_id: i64,
    pub total_products: u64,
    pub batch_size: u64,
    pub batches_total: u64,
    /// True when the caller was attached to an already running generation.
    #[serde(default)]
    pub joined: bool,
}

impl InitResponse {
    pub fn from_state(state: &JobState, joined: bool) -> Self {
        Self {
            job_id: state.job_id.clone(),
            log_id: state.log_id,
            total_products: state.total_products,
            batch_size: state.batch_size,
            batches_total: state.batches_total,
            joined,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub status: ResponseStatus,
    pub progress: f64,
    pub total: u64,
    pub processed: u64,
    pub batches_processed: u64,
    pub batches_total: u64,
    pub message: String,
    /// Errors accumulated over the whole run.
    #[serde(default)]
    pub error_count: u64,
    /// This batch's errors while the job runs; the full list once it failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ProcessResponse {
    pub fn from_state(state: &JobState, message: impl Into<String>) -> Self {
        let errors = match state.status {
            JobStatus::Failed => state.errors.clone(),
            _ => Vec::new(),
        };
        Self {
            status: state.status.into(),
            progress: state.progress(),
            total: state.total_products,
            processed: state.processed_count,
            batches_processed: state.batches_processed,
            batches_total: state.batches_total,
            message: message.into(),
            error_count: state.errors.len() as u64,
            errors,
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub status: ResponseStatus,
    pub file_url: Option<String>,
    pub product_count: u64,
    pub file_size: u64,
    pub message: String,
    #[serde(default)]
    pub errors: Vec<String>,
    pub upload_status: Option<UploadStatus>,
    pub upload_message: Option<String>,
}

impl FinalizeResponse {
    pub fn from_state(state: &JobState, message: impl Into<String>) -> Self {
        let published = state.published.as_ref();
        Self {
            status: state.status.into(),
            file_url: published.map(|p| p.file_url.clone()),
            product_count: state.product_count,
            file_size: published.map(|p| p.file_size).unwrap_or(0),
            message: message.into(),
            errors: state.errors.clone(),
            upload_status: published.map(|p| p.upload_status),
            upload_message: published.and_then(|p| p.upload_message.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: ResponseStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ResponseStatus,
    pub progress: f64,
    pub total: u64,
    pub processed: u64,
    pub batches_processed: u64,
    pub batches_total: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl StatusResponse {
    pub fn from_state(state: &JobState) -> Self {
        Self {
            status: state.status.into(),
            progress: state.progress(),
            total: state.total_products,
            processed: state.processed_count,
            batches_processed: state.batches_processed,
            batches_total: state.batches_total,
            errors: state.errors.clone(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: ResponseStatus::NotFound,
            progress: 0.0,
            total: 0,
            processed: 0,
            batches_processed: 0,
            batches_total: 0,
            errors: Vec::new(),
        }
    }
}
