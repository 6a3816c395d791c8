pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod feed;
pub mod logging;
pub mod sanitize;
pub mod store;
pub mod writer;

pub use config::{load_config, EngineConfig, LoggingConfig};
pub use engine::{
    BatchJobController, CancelResponse, Collaborators, ConflictMode, FinalizeResponse,
    InitResponse, ProcessResponse, ResponseStatus, StaleJobReaper, StatusResponse, SweepReport,
    UploadStatus,
};
pub use error::{
    ConfigError, FeedError, ProviderError, PublishError, RenderError, Result, StoreError,
    UploadError, ValidationError, WriterError,
};
pub use feed::{
    FeedDefinition, FeedFormat, FeedProvider, FieldRenderer, FormatValidator, Product,
    RenderCache, Renderer, Uploader, ValidationReport, Validator,
};
pub use store::{JobState, JobStateStore, JobStatus, StateLock};
pub use writer::{OutputWriter, WriterState};
