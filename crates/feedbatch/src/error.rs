use std::path::PathBuf;
use thiserror::Error;

use crate::store::JobStatus;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("A generation is already running for feed '{feed_id}' (job {job_id})")]
    Conflict { feed_id: String, job_id: String },

    #[error("Another request is processing this batch (job {job_id}), try again shortly")]
    LockBusy { job_id: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is {status}; cannot {operation}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error(
        "Error rate {rate:.1}% exceeds threshold of {threshold:.1}% after {processed} products"
    )]
    ThresholdExceeded {
        rate: f64,
        threshold: f64,
        processed: u64,
    },

    #[error("Generated feed failed validation with {errors} error(s)")]
    InvalidArtifact { errors: usize },

    #[error("Generation {log_id} for job {job_id} is no longer running")]
    Superseded { job_id: String, log_id: i64 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Output writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Feed provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl FeedError {
    /// True for errors a client should simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::LockBusy { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open lock file '{path}': {source}")]
    OpenLock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acquire lock '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state '{path}': {source}")]
    WriteState {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize job state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Failed to open output '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Output '{path}' is {actual} bytes but {expected} were committed")]
    Truncated {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Output '{0}' is already closed")]
    Closed(PathBuf),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to compress '{path}': {source}")]
    Compress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stat '{path}': {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Unknown feed: {0}")]
    UnknownFeed(String),

    #[error("Product query failed: {0}")]
    Query(String),

    #[error("Failed to record generation metrics: {0}")]
    Record(String),
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("{0}")]
    Template(String),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload destination '{0}' is not configured")]
    UnknownDestination(String),

    #[error("Upload of '{path}' failed: {reason}")]
    Transfer { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, FeedError>;
