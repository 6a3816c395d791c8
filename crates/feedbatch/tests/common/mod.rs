//! Shared test utilities for feedbatch integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against temp state/output directories
//! - In-memory collaborators (feed provider, renderer, validator, uploader)

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
