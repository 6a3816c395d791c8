//! Test harness for isolated job runs.
//!
//! The `TestHarness` owns a temp directory holding the state directory, the
//! output directory and the generation database, plus the in-memory
//! collaborators every controller built from it shares.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use feedbatch::{
    BatchJobController, Collaborators, EngineConfig, FeedFormat, FinalizeResponse,
    ProcessResponse, Renderer, ResponseStatus, Validator,
};

use super::builders::{catalog, feed_definition, MemoryFeeds, RecordingUploader};

/// Feed id every harness registers.
pub const FEED_ID: &str = "google-shopping";

pub struct TestHarness {
    /// Keeps the directories alive for the test's duration.
    temp_dir: TempDir,
    pub state_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config: EngineConfig,
    pub feeds: Arc<MemoryFeeds>,
    pub uploader: Arc<RecordingUploader>,
    renderer: Option<Arc<dyn Renderer>>,
    validator: Option<Arc<dyn Validator>>,
    pub controller: BatchJobController,
}

impl TestHarness {
    /// `products` products in an XML feed with batch size 100.
    pub fn new(products: usize) -> Self {
        Self::builder(products).build()
    }

    pub fn builder(products: usize) -> HarnessBuilder {
        HarnessBuilder {
            products,
            format: FeedFormat::Xml,
            batch_size: 100,
            configure: Vec::new(),
            renderer: None,
            validator: None,
            uploader: Arc::new(RecordingUploader::default()),
        }
    }

    /// Another controller over the same state directory and database, as a
    /// separate worker process would have.
    pub fn second_controller(&self) -> BatchJobController {
        BatchJobController::from_config(self.config.clone(), self.collaborators())
            .expect("second controller")
    }

    pub fn collaborators(&self) -> Collaborators {
        assemble(
            &self.feeds,
            &self.uploader,
            self.renderer.as_ref(),
            self.validator.as_ref(),
        )
    }

    /// Calls `process` until the job leaves `processing`, returning every response.
    pub fn process_all(&self, job_id: &str) -> Vec<ProcessResponse> {
        let mut responses = Vec::new();
        loop {
            let response = self.controller.process(job_id).expect("process");
            let status = response.status;
            responses.push(response);
            if status != ResponseStatus::Processing {
                return responses;
            }
            assert!(responses.len() < 10_000, "job never finished processing");
        }
    }

    /// Init, process and finalize in one go.
    pub fn run_to_completion(&self) -> (String, FinalizeResponse) {
        let init = self.controller.init(FEED_ID).expect("init");
        self.process_all(&init.job_id);
        let finalized = self.controller.finalize(&init.job_id).expect("finalize");
        (init.job_id, finalized)
    }

    pub fn output_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(filename)
    }

    pub fn read_output(&self, filename: &str) -> String {
        std::fs::read_to_string(self.output_path(filename)).expect("read published feed")
    }

    /// Names of every file left in the state directory, sorted, excluding the database.
    pub fn state_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.state_dir)
            .expect("read state dir")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with("feedbatch.db"))
            .collect();
        names.sort();
        names
    }
}

pub struct HarnessBuilder {
    products: usize,
    format: FeedFormat,
    batch_size: u64,
    configure: Vec<Box<dyn FnOnce(&mut EngineConfig)>>,
    renderer: Option<Arc<dyn Renderer>>,
    validator: Option<Arc<dyn Validator>>,
    uploader: Arc<RecordingUploader>,
}

impl HarnessBuilder {
    pub fn format(mut self, format: FeedFormat) -> Self {
        self.format = format;
        self
    }

    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn config(mut self, configure: impl FnOnce(&mut EngineConfig) + 'static) -> Self {
        self.configure.push(Box::new(configure));
        self
    }

    pub fn renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn uploader(mut self, uploader: RecordingUploader) -> Self {
        self.uploader = Arc::new(uploader);
        self
    }

    pub fn build(self) -> TestHarness {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let state_dir = temp_dir.path().join("state");
        let output_dir = temp_dir.path().join("public");

        let mut config = EngineConfig::new(&state_dir, &output_dir);
        for configure in self.configure {
            configure(&mut config);
        }

        let feeds = Arc::new(MemoryFeeds::new(catalog(self.products)));
        let mut definition = feed_definition(FEED_ID, self.format);
        definition.batch_size = Some(self.batch_size);
        feeds.add_feed(definition);

        let collaborators = assemble(
            &feeds,
            &self.uploader,
            self.renderer.as_ref(),
            self.validator.as_ref(),
        );
        let controller = BatchJobController::from_config(config.clone(), collaborators)
            .expect("Failed to create controller");

        TestHarness {
            temp_dir,
            state_dir,
            output_dir,
            config,
            feeds,
            uploader: self.uploader,
            renderer: self.renderer,
            validator: self.validator,
            controller,
        }
    }
}

fn assemble(
    feeds: &Arc<MemoryFeeds>,
    uploader: &Arc<RecordingUploader>,
    renderer: Option<&Arc<dyn Renderer>>,
    validator: Option<&Arc<dyn Validator>>,
) -> Collaborators {
    let mut collaborators = Collaborators::new(feeds.clone()).with_uploader(uploader.clone());
    if let Some(renderer) = renderer {
        collaborators = collaborators.with_renderer(renderer.clone());
    }
    if let Some(validator) = validator {
        collaborators = collaborators.with_validator(validator.clone());
    }
    collaborators
}
