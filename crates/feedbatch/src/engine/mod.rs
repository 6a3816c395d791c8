//! The batch job engine: controller, stale job reaper and publishing.

pub mod controller;
pub mod publish;
pub mod reaper;
pub mod response;

pub use controller::{BatchJobController, Collaborators, ConflictMode};
pub use reaper::{StaleJobReaper, SweepReport};
pub use response::{
    CancelResponse, FinalizeResponse, InitResponse, ProcessResponse, ResponseStatus,
    StatusResponse, UploadStatus,
};
