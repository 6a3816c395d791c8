use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::{generation_repo, Database, GenerationRow, GenerationStatus, LockOutcome};
use crate::error::{FeedError, Result};
use crate::feed::{
    FeedDefinition, FeedProvider, FieldRenderer, FormatValidator, GenerationSummary,
    RenderCache, Renderer, Uploader, Validator,
};
use crate::sanitize::{redact_path, truncate_message};
use crate::store::{is_valid_job_id, JobState, JobStateStore, JobStatus, PublishedFeed};
use crate::writer::OutputWriter;

use super::publish;
use super::reaper::StaleJobReaper;
use super::response::{
    CancelResponse, FinalizeResponse, InitResponse, ProcessResponse, ResponseStatus,
    StatusResponse, UploadStatus,
};

/// Longest single error message kept on a job.
const MAX_ERROR_CHARS: usize = 500;

/// What `init` does when the feed already has a running generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    /// Reject with [`FeedError::Conflict`].
    Fail,
    /// Hand back the running job so the caller can drive it.
    Join,
}

/// The external systems a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub feeds: Arc<dyn FeedProvider>,
    pub renderer: Arc<dyn Renderer>,
    pub validator: Arc<dyn Validator>,
    pub uploader: Option<Arc<dyn Uploader>>,
}

impl Collaborators {
    /// Built-in renderer and validator, no uploader.
    pub fn new(feeds: Arc<dyn FeedProvider>) -> Self {
        Self {
            feeds,
            renderer: Arc::new(FieldRenderer::new()),
            validator: Arc::new(FormatValidator::new()),
            uploader: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }
}

/// Drives feed generations through init, process, finalize and cancel.
///
/// Every operation is a short, self-contained call. Between calls the job
/// lives in its on-disk document and in the generation log, so any number
/// of controllers (threads or processes) sharing the same state directory
/// and database can serve the same job.
pub struct BatchJobController {
    config: Arc<EngineConfig>,
    db: Database,
    store: JobStateStore,
    reaper: StaleJobReaper,
    collaborators: Collaborators,
}

impl BatchJobController {
    /// Opens the generation log and state directory named by `config`.
    pub fn from_config(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let db = Database::open(&config.database_path())?;
        let store = JobStateStore::new(&config.state_directory)?;
        Ok(Self::new(config, db, store, collaborators))
    }

    pub fn new(
        config: EngineConfig,
        db: Database,
        store: JobStateStore,
        collaborators: Collaborators,
    ) -> Self {
        let reaper = StaleJobReaper::new(db.clone(), store.clone(), config.stale_timeout());
        Self {
            config: Arc::new(config),
            db,
            store,
            reaper,
            collaborators,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStateStore {
        &self.store
    }

    pub fn reaper(&self) -> &StaleJobReaper {
        &self.reaper
    }

    /// Starts a generation for `feed_id`. Fails with [`FeedError::Conflict`]
    /// when one is already running.
    pub fn init(&self, feed_id: &str) -> Result<InitResponse> {
        self.start(feed_id, ConflictMode::Fail)
    }

    /// Starts a generation for `feed_id`, or joins the one already running.
    pub fn init_or_join(&self, feed_id: &str) -> Result<InitResponse> {
        self.start(feed_id, ConflictMode::Join)
    }

    fn start(&self, feed_id: &str, mode: ConflictMode) -> Result<InitResponse> {
        let _span = info_span!("init", feed_id = %feed_id).entered();

        let feed = self.collaborators.feeds.definition(feed_id)?;
        self.reaper.cleanup_stale_jobs(feed_id)?;

        let job_id = Uuid::new_v4().to_string();
        let row = match self.take_generation(feed_id, &job_id)? {
            LockOutcome::Acquired { row, .. } => row,
            LockOutcome::Held(existing) => {
                return match mode {
                    ConflictMode::Fail => {
                        info!(job_id = %existing.job_id, "Generation already running");
                        Err(FeedError::Conflict {
                            feed_id: feed_id.to_string(),
                            job_id: existing.job_id,
                        })
                    }
                    ConflictMode::Join => Ok(self.joined(&feed, &existing)),
                };
            }
        };

        match self.prepare_job(&feed, &job_id, row.id) {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Initialization failed");
                let message =
                    truncate_message(&format!("Initialization failed: {}", e), MAX_ERROR_CHARS);
                if let Err(db_err) = generation_repo::mark_failed(&self.db, row.id, &message) {
                    error!(log_id = row.id, error = %db_err, "Failed to release generation");
                }
                if let Err(cleanup_err) = self.store.delete_all(
                    &job_id,
                    Some(&self.store.temp_path(&job_id, feed.format)),
                ) {
                    warn!(job_id = %job_id, error = %cleanup_err, "Failed to remove partial job");
                }
                Err(e)
            }
        }
    }

    /// Takes the feed's Generation Lock for `job_id`. A stale generation
    /// replaced on the way has its job document failed as well.
    fn take_generation(&self, feed_id: &str, job_id: &str) -> Result<LockOutcome> {
        let outcome =
            generation_repo::acquire_lock(&self.db, feed_id, job_id, self.config.stale_timeout())?;
        if let LockOutcome::Acquired {
            reclaimed: Some(old),
            ..
        } = &outcome
        {
            warn!(
                previous_job = %old.job_id,
                previous_log_id = old.id,
                "Replaced stale generation"
            );
            self.reaper.fail_document(&old.job_id);
        }
        Ok(outcome)
    }

    fn prepare_job(&self, feed: &FeedDefinition, job_id: &str, log_id: i64) -> Result<InitResponse> {
        let batch_size = self.batch_size_for(feed);
        let total = self.collaborators.feeds.count_products(feed)?;

        let temp_path = self.store.temp_path(job_id, feed.format);
        let writer = OutputWriter::open(&temp_path, feed)?.pause()?;
        let state = JobState::new(job_id, &feed.feed_id, log_id, total, batch_size, writer);
        {
            let _guard = self.lock_job(job_id)?;
            self.store.save(&state)?;
        }
        generation_repo::update_progress(&self.db, log_id, total, 0, 0, 0)?;

        info!(
            job_id = %job_id,
            log_id,
            temp_file = %redact_path(&temp_path),
            total_products = total,
            batch_size,
            batches_total = state.batches_total,
            "Feed generation started"
        );
        Ok(InitResponse::from_state(&state, false))
    }

    fn joined(&self, feed: &FeedDefinition, existing: &GenerationRow) -> InitResponse {
        info!(job_id = %existing.job_id, "Joining running generation");
        match self.store.load(&existing.job_id) {
            Some(state) => InitResponse::from_state(&state, true),
            None => {
                let batch_size = self.batch_size_for(feed);
                InitResponse {
                    job_id: existing.job_id.clone(),
                    log_id: existing.id,
                    total_products: existing.total_products,
                    batch_size,
                    batches_total: crate::store::batches_for(existing.total_products, batch_size),
                    joined: true,
                }
            }
        }
    }

    /// Processes the next batch of a job.
    ///
    /// Completed, failed and finalizing jobs are returned unchanged, so
    /// repeating the call is harmless. A failure inside the batch fails the
    /// job and is reported in the response rather than as an `Err`.
    pub fn process(&self, job_id: &str) -> Result<ProcessResponse> {
        let _span = info_span!("process", job_id = %job_id).entered();

        let _guard = self.lock_job(job_id)?;
        let mut state = self.load_job(job_id)?;

        match state.status {
            JobStatus::Completed => {
                return Ok(ProcessResponse::from_state(&state, "Feed generation already completed"))
            }
            JobStatus::Failed => {
                return Ok(ProcessResponse::from_state(&state, "Feed generation failed"))
            }
            JobStatus::Finalizing => {
                return Ok(ProcessResponse::from_state(
                    &state,
                    "All products processed, ready to finalize",
                ))
            }
            JobStatus::Initializing | JobStatus::Processing => {}
        }

        match self.run_batch(&mut state) {
            Ok((message, batch_errors)) => {
                Ok(ProcessResponse::from_state(&state, message).with_errors(batch_errors))
            }
            Err(e) => {
                let message = format!("Feed generation failed: {}", e);
                self.fail_job(&mut state, &e);
                Ok(ProcessResponse::from_state(&state, message))
            }
        }
    }

    /// Processes one page. Returns the progress message and the errors of
    /// this batch alone.
    fn run_batch(&self, state: &mut JobState) -> Result<(String, Vec<String>)> {
        let feed = self.collaborators.feeds.definition(&state.feed_id)?;
        self.ensure_generation_running(state)?;

        let page = state.current_page + 1;
        let _step = info_span!("batch", page).entered();

        let mut writer = OutputWriter::resume(&state.writer)?;
        let products = {
            let _step = info_span!("fetch_page").entered();
            self.collaborators
                .feeds
                .fetch_page(&feed, page, state.batch_size)?
        };

        let mut cache = RenderCache::new();
        let mut fragments = Vec::with_capacity(products.len());
        let mut batch_errors = Vec::new();
        {
            let _step = info_span!("render").entered();
            for product in &products {
                match self.collaborators.renderer.render(product, &feed, &mut cache) {
                    Ok(fragment) => fragments.push(fragment),
                    Err(e) => {
                        debug!(product_id = %product.id, error = %e, "Skipping product");
                        batch_errors.push(truncate_message(
                            &format!("Product {}: {}", product.id, e),
                            MAX_ERROR_CHARS,
                        ));
                    }
                }
            }
        }

        writer.append_batch(&fragments)?;
        state.writer = writer.pause()?;

        state.current_page = page;
        state.processed_count += products.len() as u64;
        state.product_count += fragments.len() as u64;
        state.skipped_count += batch_errors.len() as u64;
        state.batches_processed += 1;
        state.errors.extend(batch_errors.iter().cloned());

        if products.is_empty() && !state.is_input_exhausted() {
            warn!(
                expected = state.total_products,
                processed = state.processed_count,
                "Catalog ran out early, shrinking total"
            );
            state.total_products = state.processed_count;
            state.batches_total = state.batches_processed;
        }
        state.batches_total = state.batches_total.max(state.batches_processed);

        generation_repo::append_errors(&self.db, state.log_id, &batch_errors)?;
        self.check_error_threshold(state)?;

        state.status = if state.is_input_exhausted() {
            JobStatus::Finalizing
        } else {
            JobStatus::Processing
        };
        state.touch();

        let still_running = generation_repo::update_progress(
            &self.db,
            state.log_id,
            state.total_products,
            state.processed_count,
            state.product_count,
            state.skipped_count,
        )?;
        if !still_running {
            return Err(self.superseded(state));
        }
        self.store.save(state)?;

        info!(
            processed = state.processed_count,
            total = state.total_products,
            rendered = fragments.len(),
            skipped = batch_errors.len(),
            status = %state.status,
            "Batch processed"
        );

        let message = match state.status {
            JobStatus::Finalizing => format!(
                "All {} products processed, ready to finalize",
                state.processed_count
            ),
            _ => format!(
                "Processed batch {} of {}",
                state.batches_processed, state.batches_total
            ),
        };
        Ok((message, batch_errors))
    }

    fn check_error_threshold(&self, state: &JobState) -> Result<()> {
        let Some(threshold) = self.config.error_threshold_percent else {
            return Ok(());
        };
        if state.processed_count < self.config.error_threshold_min_sample {
            return Ok(());
        }
        let rate = state.error_rate();
        if rate > threshold {
            return Err(FeedError::ThresholdExceeded {
                rate,
                threshold,
                processed: state.processed_count,
            });
        }
        Ok(())
    }

    /// Closes, validates and publishes a job whose products are all processed.
    pub fn finalize(&self, job_id: &str) -> Result<FinalizeResponse> {
        let _span = info_span!("finalize", job_id = %job_id).entered();

        let _guard = self.lock_job(job_id)?;
        let mut state = self.load_job(job_id)?;

        match state.status {
            JobStatus::Completed => {
                return Ok(FinalizeResponse::from_state(
                    &state,
                    "Feed generation already completed",
                ))
            }
            JobStatus::Failed => {
                return Ok(FinalizeResponse::from_state(&state, "Feed generation failed"))
            }
            JobStatus::Initializing | JobStatus::Processing => {
                return Err(FeedError::InvalidState {
                    job_id: job_id.to_string(),
                    status: state.status,
                    operation: "finalize",
                })
            }
            JobStatus::Finalizing => {}
        }

        match self.publish(&mut state) {
            Ok(()) => Ok(FinalizeResponse::from_state(
                &state,
                "Feed generated successfully",
            )),
            Err(e) => {
                let message = format!("Feed generation failed: {}", e);
                self.fail_job(&mut state, &e);
                Ok(FinalizeResponse::from_state(&state, message))
            }
        }
    }

    fn publish(&self, state: &mut JobState) -> Result<()> {
        let feed = self.collaborators.feeds.definition(&state.feed_id)?;
        self.ensure_generation_running(state)?;

        {
            let _step = info_span!("close_output").entered();
            let writer = OutputWriter::resume(&state.writer)?;
            state.writer = writer.close()?;
        }

        {
            let _step = info_span!("validate").entered();
            let report = self
                .collaborators
                .validator
                .validate(&state.temp_path, feed.format)?;
            for warning in &report.warnings {
                warn!(warning = %warning, "Feed validation warning");
            }
            if !report.is_valid() {
                state
                    .errors
                    .extend(report.errors.iter().map(|e| format!("Validation: {}", e)));
                return Err(FeedError::InvalidArtifact {
                    errors: report.errors.len(),
                });
            }
        }

        let published = {
            let _step = info_span!("publish").entered();
            let destination = self.config.output_directory.join(&feed.filename);
            let published = publish::promote(&state.temp_path, &destination)?;
            if feed.compress {
                publish::gzip_file(&published)?
            } else {
                published
            }
        };
        let file_size = publish::file_size(&published)?;
        let file_url = publish::file_url(&feed, &published);
        let completed_at = Utc::now();

        let message = format!("Generated {} products", state.product_count);
        if !generation_repo::mark_completed(
            &self.db,
            state.log_id,
            state.product_count,
            state.skipped_count,
            file_size,
            &message,
        )? {
            warn!(log_id = state.log_id, "Generation was closed while publishing");
        }

        let summary = GenerationSummary {
            feed_id: feed.feed_id.clone(),
            job_id: state.job_id.clone(),
            product_count: state.product_count,
            error_count: state.skipped_count,
            file_size,
            file_path: published.clone(),
            completed_at,
        };
        if let Err(e) = self.collaborators.feeds.record_generation(&feed, &summary) {
            warn!(error = %e, "Failed to record generation on feed");
            state.errors.push(e.to_string());
        }

        let (upload_status, upload_message) = self.upload(&feed, &published);

        state.status = JobStatus::Completed;
        state.published = Some(PublishedFeed {
            file_path: published,
            file_url,
            file_size,
            upload_status,
            upload_message,
            completed_at,
        });
        state.touch();
        self.store.save(state)?;

        info!(
            product_count = state.product_count,
            skipped = state.skipped_count,
            file_size,
            file = %state.published.as_ref().map(|p| redact_path(&p.file_path)).unwrap_or_default(),
            "Feed generation completed"
        );
        Ok(())
    }

    fn upload(&self, feed: &FeedDefinition, published: &Path) -> (UploadStatus, Option<String>) {
        if !feed.auto_upload {
            return (UploadStatus::Skipped, None);
        }
        let Some(uploader) = self.collaborators.uploader.as_ref() else {
            return (
                UploadStatus::Skipped,
                Some("No uploader configured".to_string()),
            );
        };

        let _step = info_span!("upload").entered();
        let remote_name = published
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| feed.filename.clone());
        match uploader.upload(published, &remote_name, feed.upload_destination.as_deref()) {
            Ok(()) => {
                info!(remote_name = %remote_name, "Feed uploaded");
                (UploadStatus::Success, Some(format!("Uploaded {}", remote_name)))
            }
            Err(e) => {
                warn!(error = %e, "Feed upload failed");
                (UploadStatus::Failed, Some(e.to_string()))
            }
        }
    }

    /// Stops a job and deletes everything it left on disk. Only a completed
    /// job, whose feed is already published, cannot be cancelled.
    ///
    /// Waits for an in-flight batch to finish rather than failing fast.
    pub fn cancel(&self, job_id: &str) -> Result<CancelResponse> {
        let _span = info_span!("cancel", job_id = %job_id).entered();

        if !is_valid_job_id(job_id) {
            return Err(FeedError::NotFound(job_id.to_string()));
        }
        let guard = self.store.lock(job_id)?;
        let state = self.load_job(job_id)?;

        if state.status == JobStatus::Completed {
            return Err(FeedError::InvalidState {
                job_id: job_id.to_string(),
                status: state.status,
                operation: "cancel",
            });
        }

        if !generation_repo::mark_failed(&self.db, state.log_id, "Cancelled by user")? {
            debug!(log_id = state.log_id, "Generation was already closed");
        }
        let removed = self.store.delete_all(job_id, Some(&state.temp_path))?;
        drop(guard);

        info!(removed, "Feed generation cancelled");
        Ok(CancelResponse {
            status: ResponseStatus::Cancelled,
            message: "Feed generation cancelled".to_string(),
        })
    }

    /// Read-only snapshot of a job. Unknown ids report `not_found`.
    pub fn status(&self, job_id: &str) -> StatusResponse {
        if !is_valid_job_id(job_id) {
            return StatusResponse::not_found();
        }
        match self.store.load(job_id) {
            Some(state) => StatusResponse::from_state(&state),
            None => StatusResponse::not_found(),
        }
    }

    /// Deletes job files older than the configured retention window.
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.reaper.cleanup_old_jobs(self.config.retention_hours)
    }

    /// Most recent generations of a feed, newest first.
    pub fn history(&self, feed_id: &str, limit: u64) -> Result<Vec<GenerationRow>> {
        Ok(generation_repo::history(&self.db, feed_id, limit)?)
    }

    /// Error messages recorded against a generation.
    pub fn generation_errors(&self, log_id: i64) -> Result<Vec<String>> {
        Ok(generation_repo::list_errors(&self.db, log_id)?)
    }

    fn batch_size_for(&self, feed: &FeedDefinition) -> u64 {
        feed.batch_size
            .filter(|size| *size > 0)
            .unwrap_or(self.config.default_batch_size)
    }

    /// Takes the job's state lock without waiting.
    fn lock_job(&self, job_id: &str) -> Result<crate::store::StateLock> {
        if !is_valid_job_id(job_id) {
            return Err(FeedError::NotFound(job_id.to_string()));
        }
        self.store
            .try_lock(job_id)?
            .ok_or_else(|| FeedError::LockBusy {
                job_id: job_id.to_string(),
            })
    }

    /// Loads a job document. Must be called with the job's lock held; the
    /// lock file of an unknown job is removed again.
    fn load_job(&self, job_id: &str) -> Result<JobState> {
        match self.store.load(job_id) {
            Some(state) => Ok(state),
            None => {
                if let Err(e) = JobStateStore::remove_file(&self.store.lock_path(job_id)) {
                    debug!(error = %e, "Failed to remove lock of unknown job");
                }
                Err(FeedError::NotFound(job_id.to_string()))
            }
        }
    }

    fn ensure_generation_running(&self, state: &JobState) -> Result<()> {
        match generation_repo::find_by_id(&self.db, state.log_id)? {
            Some(row) if row.status == GenerationStatus::Running => Ok(()),
            _ => Err(self.superseded(state)),
        }
    }

    fn superseded(&self, state: &JobState) -> FeedError {
        FeedError::Superseded {
            job_id: state.job_id.clone(),
            log_id: state.log_id,
        }
    }

    /// Moves a job to `failed` in its document and in the generation log.
    /// The temp artifact is kept for inspection.
    fn fail_job(&self, state: &mut JobState, err: &FeedError) {
        error!(job_id = %state.job_id, error = %err, "Feed generation failed");
        let message = truncate_message(&err.to_string(), MAX_ERROR_CHARS);
        state.fail(message.clone());

        if let Err(e) = self.store.save(state) {
            error!(error = %e, "Failed to save failed job state");
        }
        if let Err(e) = generation_repo::append_errors(&self.db, state.log_id, &[message.clone()]) {
            error!(error = %e, "Failed to record generation error");
        }
        match generation_repo::mark_failed(&self.db, state.log_id, &message) {
            Ok(true) => {}
            Ok(false) => debug!(log_id = state.log_id, "Generation was already closed"),
            Err(e) => error!(error = %e, "Failed to mark generation failed"),
        }
    }
}
