//! Collaborator interfaces the batch engine consumes, plus built-in
//! implementations for rendering and validation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, RenderError, UploadError, ValidationError};

pub mod renderer;
pub mod validator;

pub use renderer::FieldRenderer;
pub use validator::{FormatValidator, ValidationReport};

/// Output file format of a feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Xml,
    Csv,
    Json,
    Jsonl,
}

impl FeedFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FeedFormat::Xml => "xml",
            FeedFormat::Csv => "csv",
            FeedFormat::Json => "json",
            FeedFormat::Jsonl => "jsonl",
        }
    }
}

impl std::fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Everything the engine needs to know about one feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedDefinition {
    pub feed_id: String,
    pub format: FeedFormat,
    /// Published file name, relative to the engine's output directory.
    pub filename: String,
    /// Products per batch. Falls back to the engine default when unset.
    #[serde(default)]
    pub batch_size: Option<u64>,
    /// Store view / catalog scope the products are read from.
    #[serde(default)]
    pub store_scope: Option<String>,
    /// Rendered fields, in order. Also the CSV header.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default = "default_xml_root")]
    pub xml_root: String,
    #[serde(default = "default_xml_item")]
    pub xml_item: String,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub auto_upload: bool,
    #[serde(default)]
    pub upload_destination: Option<String>,
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_xml_root() -> String {
    "products".to_string()
}

fn default_xml_item() -> String {
    "product".to_string()
}

impl FeedDefinition {
    pub fn new(feed_id: &str, format: FeedFormat, filename: &str) -> Self {
        Self {
            feed_id: feed_id.to_string(),
            format,
            filename: filename.to_string(),
            batch_size: None,
            store_scope: None,
            columns: Vec::new(),
            xml_root: default_xml_root(),
            xml_item: default_xml_item(),
            compress: false,
            auto_upload: false,
            upload_destination: None,
            public_base_url: None,
        }
    }
}

/// One catalog record as handed out by the feed provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Product {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Completion metrics handed back to the feed provider after publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub feed_id: String,
    pub job_id: String,
    pub product_count: u64,
    pub error_count: u64,
    pub file_size: u64,
    pub file_path: PathBuf,
    pub completed_at: DateTime<Utc>,
}

/// Source of feed definitions and the products they select.
pub trait FeedProvider: Send + Sync {
    fn definition(&self, feed_id: &str) -> Result<FeedDefinition, ProviderError>;

    /// Number of products the feed will contain.
    fn count_products(&self, feed: &FeedDefinition) -> Result<u64, ProviderError>;

    /// One page of products. Pages are 1-based.
    fn fetch_page(
        &self,
        feed: &FeedDefinition,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<Product>, ProviderError>;

    /// Records a successful generation on the feed (last generated time,
    /// product count, ...).
    fn record_generation(
        &self,
        _feed: &FeedDefinition,
        _summary: &GenerationSummary,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Renders one product into an output fragment in the feed's format.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        product: &Product,
        feed: &FeedDefinition,
        cache: &mut RenderCache,
    ) -> Result<String, RenderError>;
}

/// Checks a finished artifact before it is published.
pub trait Validator: Send + Sync {
    fn validate(&self, path: &Path, format: FeedFormat) -> Result<ValidationReport, ValidationError>;
}

/// Ships a published file to a remote destination.
pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        destination: Option<&str>,
    ) -> Result<(), UploadError>;
}

/// Memo for values that repeat across products (category paths, lookups).
///
/// Created per call and handed to the renderer, so nothing leaks between
/// jobs or threads.
#[derive(Debug, Default)]
pub struct RenderCache {
    entries: HashMap<String, String>,
    hits: u64,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with<F>(&mut self, key: &str, compute: F) -> &str
    where
        F: FnOnce() -> String,
    {
        if self.entries.contains_key(key) {
            self.hits += 1;
        } else {
            self.entries.insert(key.to_string(), compute());
        }
        self.entries.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}
