//! In-memory collaborators and fixture builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use feedbatch::feed::GenerationSummary;
use feedbatch::{
    FeedDefinition, FeedFormat, FeedProvider, FieldRenderer, Product, ProviderError,
    RenderCache, RenderError, Renderer, UploadError, Uploader, ValidationError,
    ValidationReport, Validator,
};

/// A feed definition with the usual id/title/price columns.
pub fn feed_definition(feed_id: &str, format: FeedFormat) -> FeedDefinition {
    let filename = format!("{}.{}", feed_id, format.extension());
    let mut def = FeedDefinition::new(feed_id, format, &filename);
    def.columns = vec!["id".into(), "title".into(), "price".into()];
    def
}

/// `count` products with ids `sku-0001`, `sku-0002`, ...
pub fn catalog(count: usize) -> Vec<Product> {
    (1..=count)
        .map(|n| {
            Product::new(&format!("sku-{:04}", n))
                .with("title", format!("Product {}", n))
                .with("price", format!("{}.99", n))
        })
        .collect()
}

/// Feed provider backed by a vector of products.
#[derive(Default)]
pub struct MemoryFeeds {
    definitions: Mutex<HashMap<String, FeedDefinition>>,
    products: Mutex<Vec<Product>>,
    failing_page: Mutex<Option<u64>>,
    pages_fetched: Mutex<Vec<u64>>,
    recorded: Mutex<Vec<GenerationSummary>>,
}

impl MemoryFeeds {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products: Mutex::new(products),
            ..Default::default()
        }
    }

    pub fn add_feed(&self, definition: FeedDefinition) {
        self.definitions
            .lock()
            .unwrap()
            .insert(definition.feed_id.clone(), definition);
    }

    pub fn update_feed(&self, feed_id: &str, update: impl FnOnce(&mut FeedDefinition)) {
        let mut definitions = self.definitions.lock().unwrap();
        update(definitions.get_mut(feed_id).expect("unknown feed"));
    }

    /// Drops products from the end of the catalog.
    pub fn truncate(&self, len: usize) {
        self.products.lock().unwrap().truncate(len);
    }

    pub fn fail_page(&self, page: Option<u64>) {
        *self.failing_page.lock().unwrap() = page;
    }

    pub fn pages_fetched(&self) -> Vec<u64> {
        self.pages_fetched.lock().unwrap().clone()
    }

    pub fn recorded(&self) -> Vec<GenerationSummary> {
        self.recorded.lock().unwrap().clone()
    }
}

impl FeedProvider for MemoryFeeds {
    fn definition(&self, feed_id: &str) -> Result<FeedDefinition, ProviderError> {
        self.definitions
            .lock()
            .unwrap()
            .get(feed_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownFeed(feed_id.to_string()))
    }

    fn count_products(&self, _feed: &FeedDefinition) -> Result<u64, ProviderError> {
        Ok(self.products.lock().unwrap().len() as u64)
    }

    fn fetch_page(
        &self,
        _feed: &FeedDefinition,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<Product>, ProviderError> {
        if *self.failing_page.lock().unwrap() == Some(page) {
            return Err(ProviderError::Query(format!("page {} unavailable", page)));
        }
        self.pages_fetched.lock().unwrap().push(page);

        let products = self.products.lock().unwrap();
        let start = ((page - 1) * page_size) as usize;
        let end = (start + page_size as usize).min(products.len());
        Ok(products.get(start..end).map(<[Product]>::to_vec).unwrap_or_default())
    }

    fn record_generation(
        &self,
        _feed: &FeedDefinition,
        summary: &GenerationSummary,
    ) -> Result<(), ProviderError> {
        self.recorded.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

/// Field renderer that rejects a fixed set of product ids.
pub struct RejectingRenderer {
    inner: FieldRenderer,
    rejected: HashSet<String>,
}

impl RejectingRenderer {
    pub fn new<I: IntoIterator<Item = String>>(rejected: I) -> Self {
        Self {
            inner: FieldRenderer::new(),
            rejected: rejected.into_iter().collect(),
        }
    }
}

impl Renderer for RejectingRenderer {
    fn render(
        &self,
        product: &Product,
        feed: &FeedDefinition,
        cache: &mut RenderCache,
    ) -> Result<String, RenderError> {
        if self.rejected.contains(&product.id) {
            return Err(RenderError::MissingField("price".to_string()));
        }
        self.inner.render(product, feed, cache)
    }
}

/// Validator that always reports the given errors.
pub struct RejectingValidator(pub Vec<String>);

impl Validator for RejectingValidator {
    fn validate(&self, _path: &Path, _format: FeedFormat) -> Result<ValidationReport, ValidationError> {
        Ok(ValidationReport {
            records: 0,
            errors: self.0.clone(),
            warnings: Vec::new(),
        })
    }
}

/// One recorded upload.
#[derive(Debug, Clone)]
pub struct UploadCall {
    pub local_path: PathBuf,
    pub remote_name: String,
    pub destination: Option<String>,
}

/// Uploader that records calls and optionally fails them.
#[derive(Default)]
pub struct RecordingUploader {
    calls: Mutex<Vec<UploadCall>>,
    fail: Mutex<bool>,
}

impl RecordingUploader {
    pub fn failing() -> Self {
        Self {
            fail: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Uploader for RecordingUploader {
    fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        destination: Option<&str>,
    ) -> Result<(), UploadError> {
        self.calls.lock().unwrap().push(UploadCall {
            local_path: local_path.to_path_buf(),
            remote_name: remote_name.to_string(),
            destination: destination.map(str::to_string),
        });
        if *self.fail.lock().unwrap() {
            return Err(UploadError::Transfer {
                path: local_path.to_path_buf(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}
