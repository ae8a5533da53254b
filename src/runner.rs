//! Job runner: drives one [`ExtractionJob`] from pickup to a settled state.
//!
//! ```text
//! load ─▶ recover/resume ─▶ begin ─▶ fetch PDF ─▶ fingerprint check
//!                                                  │ unchanged ─▶ Completed
//!                                                  ▼
//!             render (lazy) ─▶ pages ─buffer_unordered─▶ extract ─▶ results
//!                                                                    │
//!        Completed ◀─ record flyer ◀─ match + record ◀─ aggregate ◀──┘
//! ```
//!
//! Every state change is persisted with an optimistic version check. When a
//! second worker picks the same job up after a lease expiry, whichever of the
//! two saves second sees a stale version and backs off with
//! [`JobOutcome::Superseded`]. Writes made before that point are
//! insert-if-absent and therefore harmless.
//!
//! Errors end up in exactly one place, [`JobRunner::settle_error`], which maps
//! the error class onto the job state machine: quota → cool-down, transient →
//! retry with backoff, anything else → `Failed`.

use crate::config::IngestConfig;
use crate::error::{
    BlobError, CatalogError, ErrorClass, ExtractionError, IngestError, PageError, RenderError,
    SourceError,
};
use crate::job::{
    fingerprint, ExtractionJob, FailureReason, JobState, PageResult, PageStatus, RetryDecision,
};
use crate::matching::similarity::EmbeddingSignal;
use crate::matching::{MatchContext, MatchingEngine};
use crate::model::{FlyerRecord, MatchSummary, StoreId, StoreLocale};
use crate::pipeline::extract::{ExtractionClient, PageContext, VisionModel};
use crate::pipeline::render::{PdfRenderer, RenderedDocument, RenderedPage};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::rate_limit::StoreRateLimiter;
use crate::source::{SourceRegistry, StoreSource};
use crate::store::{BlobStore, CatalogStore};
use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// External collaborators a runner works with.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub renderer: Arc<dyn PdfRenderer>,
    pub model: Arc<dyn VisionModel>,
    /// Enables semantic matching when set.
    pub embeddings: Option<Arc<dyn EmbeddingSignal>>,
    pub sources: SourceRegistry,
}

/// Summary of a job that reached `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub store_id: StoreId,
    pub flyer_identity: String,
    pub state: JobState,
    /// Nothing was done because the flyer content had not changed.
    pub unchanged: bool,
    pub pages_total: usize,
    pub pages_succeeded: usize,
    pub pages_failed: usize,
    pub page_errors: Vec<PageError>,
    pub matching: MatchSummary,
}

impl JobReport {
    fn new(job: &ExtractionJob, matching: MatchSummary) -> Self {
        Self {
            job_id: job.id,
            store_id: job.source.store_id.clone(),
            flyer_identity: job.source.flyer_identity.clone(),
            state: job.state,
            unchanged: job.unchanged,
            pages_total: job.pages.len(),
            pages_succeeded: job.pages_succeeded(),
            pages_failed: job.pages_failed(),
            page_errors: job.pages.iter().filter_map(|p| p.error.clone()).collect(),
            matching,
        }
    }
}

/// How one run of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobReport),
    /// Transient failure; the job is `Retrying` until `eligible_at`.
    Retrying { eligible_at: DateTime<Utc> },
    /// Quota hit; the job and its store wait until `until`.
    CoolingDown {
        store_id: StoreId,
        until: DateTime<Utc>,
    },
    Failed {
        reason: FailureReason,
        summary: String,
    },
    /// The job's backoff has not elapsed yet.
    NotReady { eligible_at: Option<DateTime<Utc>> },
    AlreadyTerminal(JobState),
    /// Another worker updated the job concurrently and now owns it.
    Superseded,
}

impl JobOutcome {
    /// Whether the job will not run again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobOutcome::Completed(_) | JobOutcome::Failed { .. } | JobOutcome::AlreadyTerminal(_)
        )
    }

    fn failed(job: &ExtractionJob) -> Self {
        let (reason, summary) = job.error.as_ref().map_or_else(
            || (FailureReason::NonRetryable, String::new()),
            |e| (e.reason.unwrap_or(FailureReason::NonRetryable), e.message.clone()),
        );
        JobOutcome::Failed { reason, summary }
    }
}

enum PageOutcome {
    Done(PageResult),
    /// The model refused for quota reasons; the whole job must cool down.
    Quota(ExtractionError),
    /// Document-scoped render failure mid-stream.
    Abort(RenderError),
}

fn is_stale(err: &IngestError) -> bool {
    matches!(err, IngestError::Catalog(CatalogError::StaleVersion { .. }))
}

/// States a job is only in while a worker is actively processing it.
fn is_in_flight(state: JobState) -> bool {
    matches!(
        state,
        JobState::Rendering | JobState::Extracting | JobState::Aggregating | JobState::Matching
    )
}

fn retry_after_secs(err: &IngestError) -> Option<u64> {
    match err {
        IngestError::Extraction(ExtractionError::QuotaExceeded { retry_after_secs })
        | IngestError::Source(SourceError::Quota {
            retry_after_secs, ..
        }) => *retry_after_secs,
        _ => None,
    }
}

pub struct JobRunner {
    config: Arc<IngestConfig>,
    catalog: Arc<dyn CatalogStore>,
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn PdfRenderer>,
    extractor: ExtractionClient,
    matcher: MatchingEngine,
    sources: SourceRegistry,
    progress: ProgressCallback,
}

impl JobRunner {
    pub fn new(config: Arc<IngestConfig>, parts: Collaborators) -> Self {
        let extractor = ExtractionClient::new(parts.model, config.extraction.clone());
        let mut matcher = MatchingEngine::new(parts.catalog.clone(), config.matching.clone());
        if let Some(embeddings) = parts.embeddings {
            matcher = matcher.with_embeddings(embeddings);
        }
        Self {
            config,
            catalog: parts.catalog,
            blobs: parts.blobs,
            renderer: parts.renderer,
            extractor,
            matcher,
            sources: parts.sources,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Run `job_id` once and persist the resulting state.
    ///
    /// `limiter` paces this job's requests to its store. `Err` is returned
    /// only when the job could not even be loaded or its final state could
    /// not be saved; every other failure is reported as a [`JobOutcome`].
    #[instrument(skip(self, limiter))]
    pub async fn run(
        &self,
        job_id: Uuid,
        limiter: Option<Arc<StoreRateLimiter>>,
    ) -> Result<JobOutcome, IngestError> {
        let mut job = self.load(job_id).await?;

        let outcome = match self.drive(&mut job, limiter.as_deref()).await {
            Ok(outcome) => outcome,
            Err(e) if is_stale(&e) => {
                info!("Job was taken over by another worker");
                JobOutcome::Superseded
            }
            Err(e) => match self.settle_error(&mut job, e).await {
                Ok(outcome) => outcome,
                Err(e) if is_stale(&e) => JobOutcome::Superseded,
                Err(e) => return Err(e),
            },
        };

        self.progress.on_job_finish(job.id, job.state);
        Ok(outcome)
    }

    /// Settle a job whose run was cut short from outside, e.g. by the lease
    /// deadline. The job is reloaded so in-memory progress is not trusted.
    pub async fn abandon(&self, job_id: Uuid, err: IngestError) -> Result<JobOutcome, IngestError> {
        let mut job = self.load(job_id).await?;
        if job.is_terminal() {
            return Ok(JobOutcome::AlreadyTerminal(job.state));
        }
        match self.settle_error(&mut job, err).await {
            Err(e) if is_stale(&e) => Ok(JobOutcome::Superseded),
            other => other,
        }
    }

    async fn load(&self, job_id: Uuid) -> Result<ExtractionJob, IngestError> {
        self.catalog
            .get_job(job_id)
            .await?
            .ok_or(IngestError::JobNotFound(job_id))
    }

    /// Persist `job`, replacing it with the stored copy (new version).
    async fn save(&self, job: &mut ExtractionJob) -> Result<(), IngestError> {
        *job = self.catalog.update_job(job).await?;
        Ok(())
    }

    async fn drive(
        &self,
        job: &mut ExtractionJob,
        limiter: Option<&StoreRateLimiter>,
    ) -> Result<JobOutcome, IngestError> {
        if job.is_terminal() {
            debug!("Job already {}", job.state);
            return Ok(JobOutcome::AlreadyTerminal(job.state));
        }

        let now = Utc::now();
        if is_in_flight(job.state) {
            warn!(state = %job.state, "Recovering job abandoned mid-run");
            if job.restart_abandoned(&self.config.retry, now)? == RetryDecision::Exhausted {
                self.save(job).await?;
                return Ok(JobOutcome::failed(job));
            }
        }

        if !job.resume(now)? {
            return Ok(JobOutcome::NotReady {
                eligible_at: job.next_eligible_at,
            });
        }
        job.begin(now)?;
        self.save(job).await?;

        let source = self
            .sources
            .get(&job.source.store_id)
            .cloned()
            .ok_or_else(|| IngestError::UnknownStore(job.source.store_id.to_string()))?;

        // ── Rendering ────────────────────────────────────────────────────
        let pdf = self.fetch_pdf(job, source.as_ref(), limiter).await?;
        let fingerprint = fingerprint(&pdf);
        job.fingerprint = Some(fingerprint.clone());

        let previous = self
            .catalog
            .flyer(&job.source.store_id, &job.source.flyer_identity)
            .await?;
        if let Some(previous) = previous.filter(|p| p.fingerprint == fingerprint) {
            info!(previous_job = %previous.job_id, "Flyer unchanged; nothing to do");
            job.unchanged = true;
            job.error = None;
            job.transition(JobState::Completed, Utc::now())?;
            self.save(job).await?;
            return Ok(JobOutcome::Completed(JobReport::new(job, MatchSummary::default())));
        }

        let document = self.renderer.open(pdf).await?;
        let total_pages = document.page_count;
        job.pages = (0..total_pages).map(PageResult::pending).collect();
        job.transition(JobState::Extracting, Utc::now())?;
        self.save(job).await?;
        self.progress.on_job_start(job.id, total_pages);

        // ── Extracting ───────────────────────────────────────────────────
        let observed_on = Utc::now().date_naive();
        job.pages = self
            .extract_pages(job.id, source.localize(), document, observed_on, limiter)
            .await?;

        if job.pages_succeeded() == 0 {
            let message = format!("all {total_pages} pages failed extraction");
            warn!("{}", message);
            job.fail(
                FailureReason::AllPagesFailed,
                ErrorClass::ValidationFailure,
                message,
                Utc::now(),
            )?;
            self.save(job).await?;
            return Ok(JobOutcome::failed(job));
        }

        // ── Aggregating ──────────────────────────────────────────────────
        job.transition(JobState::Aggregating, Utc::now())?;
        self.save(job).await?;
        let candidates = job.candidates();
        info!(
            pages_ok = job.pages_succeeded(),
            pages_failed = job.pages_failed(),
            candidates = candidates.len(),
            "Pages aggregated"
        );

        // ── Matching ─────────────────────────────────────────────────────
        job.transition(JobState::Matching, Utc::now())?;
        self.save(job).await?;
        let summary = {
            let ctx = MatchContext {
                store_id: &job.source.store_id,
                locale: source.localize(),
                job_id: job.id,
                observed_on,
            };
            self.matcher.apply(&candidates, &ctx).await?
        };

        // Fingerprint first: a crash after this point re-runs as unchanged.
        self.catalog
            .record_flyer(FlyerRecord {
                store_id: job.source.store_id.clone(),
                flyer_identity: job.source.flyer_identity.clone(),
                fingerprint,
                job_id: job.id,
                processed_at: Utc::now(),
            })
            .await?;

        job.error = None;
        job.transition(JobState::Completed, Utc::now())?;
        self.save(job).await?;
        info!(
            matched = summary.matched,
            created = summary.created,
            low_confidence = summary.low_confidence,
            rejected = summary.rejected,
            price_points = summary.price_points_written,
            "Job completed"
        );
        Ok(JobOutcome::Completed(JobReport::new(job, summary)))
    }

    /// The job's PDF: from the blob store when an earlier attempt stored it,
    /// otherwise downloaded from the store and stored.
    async fn fetch_pdf(
        &self,
        job: &mut ExtractionJob,
        source: &dyn StoreSource,
        limiter: Option<&StoreRateLimiter>,
    ) -> Result<Vec<u8>, IngestError> {
        if let Some(blob) = &job.pdf_ref {
            match self.blobs.get(blob).await {
                Ok(bytes) => {
                    debug!("Reusing stored PDF {}", blob.0);
                    return Ok(bytes);
                }
                Err(BlobError::NotFound { .. }) => {
                    debug!("Stored PDF {} is gone; downloading again", blob.0);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(limiter) = limiter {
            limiter.acquire().await;
        }
        let bytes = source.download(&job.source).await?;
        let key = format!("flyers/{}/{}.pdf", job.source.store_id, job.id);
        job.pdf_ref = Some(self.blobs.put(&key, bytes.clone()).await?);
        Ok(bytes)
    }

    /// Extract every page, `page_concurrency` at a time, in completion
    /// order. Results come back sorted by page index.
    async fn extract_pages(
        &self,
        job_id: Uuid,
        locale: &StoreLocale,
        document: RenderedDocument,
        observed_on: NaiveDate,
        limiter: Option<&StoreRateLimiter>,
    ) -> Result<Vec<PageResult>, IngestError> {
        let total = document.page_count;
        let concurrency = self.config.extraction.page_concurrency.max(1);

        let mut pages = document
            .pages
            .map(|item| self.process_page(job_id, item, total, locale, observed_on, limiter))
            .buffer_unordered(concurrency);

        let mut results: BTreeMap<usize, PageResult> = BTreeMap::new();
        while let Some(outcome) = pages.next().await {
            match outcome {
                PageOutcome::Done(result) => {
                    results.insert(result.page_index, result);
                }
                PageOutcome::Quota(e) => {
                    warn!("Quota exceeded during extraction; abandoning remaining pages");
                    return Err(e.into());
                }
                PageOutcome::Abort(e) => return Err(e.into()),
            }
        }

        for idx in 0..total {
            results.entry(idx).or_insert_with(|| {
                PageResult::failed(
                    idx,
                    PageError::RenderFailed {
                        page: idx,
                        detail: "renderer produced no image for this page".to_string(),
                    },
                )
            });
        }
        Ok(results.into_values().collect())
    }

    async fn process_page(
        &self,
        job_id: Uuid,
        item: Result<RenderedPage, RenderError>,
        total: usize,
        locale: &StoreLocale,
        observed_on: NaiveDate,
        limiter: Option<&StoreRateLimiter>,
    ) -> PageOutcome {
        let page = match item {
            Ok(page) => page,
            Err(e) => {
                return match e.page() {
                    Some(idx) => {
                        let error = PageError::RenderFailed {
                            page: idx,
                            detail: e.to_string(),
                        };
                        self.progress
                            .on_page_error(job_id, idx, total, &error.to_string());
                        PageOutcome::Done(PageResult::failed(idx, error))
                    }
                    None => PageOutcome::Abort(e),
                };
            }
        };

        let idx = page.index;
        self.progress.on_page_start(job_id, idx, total);
        let mut result = PageResult::pending(idx);

        let key = format!("jobs/{job_id}/pages/{idx:04}.png");
        match self.blobs.put(&key, page.png.clone()).await {
            Ok(blob) => result.image_ref = Some(blob),
            Err(e) => {
                return self.page_failed(
                    job_id,
                    total,
                    result,
                    PageError::StorageFailed {
                        page: idx,
                        detail: e.to_string(),
                    },
                );
            }
        }

        let ctx = PageContext {
            locale,
            page_index: idx,
            observed_on,
            limiter,
        };
        let max_attempts = self.config.extraction.page_max_attempts.max(1);
        let backoff_ms = self.config.extraction.page_retry_backoff_ms;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    idx,
                    attempt,
                    max_attempts - 1,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            result.attempts = attempt + 1;

            match self.extractor.extract(&page.png, &ctx).await {
                Ok(extraction) => {
                    debug!(
                        "Page {}: {} listings in {} model call(s)",
                        idx,
                        extraction.listings.len(),
                        extraction.calls
                    );
                    self.progress
                        .on_page_complete(job_id, idx, total, extraction.listings.len());
                    result.status = PageStatus::Succeeded;
                    result.listings = extraction.listings;
                    result.raw_response = Some(extraction.raw_response);
                    return PageOutcome::Done(result);
                }
                Err(ExtractionError::Transient { detail }) => {
                    warn!("Page {}: attempt {} failed: {}", idx, attempt + 1, detail);
                    last_error = detail;
                }
                Err(ExtractionError::InvalidResponse { detail }) => {
                    return self.page_failed(
                        job_id,
                        total,
                        result,
                        PageError::InvalidResponse { page: idx, detail },
                    );
                }
                Err(e @ ExtractionError::QuotaExceeded { .. }) => return PageOutcome::Quota(e),
            }
        }

        let attempts = result.attempts;
        self.page_failed(
            job_id,
            total,
            result,
            PageError::ExtractionFailed {
                page: idx,
                attempts,
                detail: last_error,
            },
        )
    }

    fn page_failed(
        &self,
        job_id: Uuid,
        total: usize,
        mut result: PageResult,
        error: PageError,
    ) -> PageOutcome {
        warn!("{}", error);
        self.progress
            .on_page_error(job_id, result.page_index, total, &error.to_string());
        result.status = PageStatus::Failed;
        result.error = Some(error);
        PageOutcome::Done(result)
    }

    /// Map a run-level error onto the job state machine and persist it.
    async fn settle_error(
        &self,
        job: &mut ExtractionJob,
        err: IngestError,
    ) -> Result<JobOutcome, IngestError> {
        if job.is_terminal() {
            return Err(err);
        }

        let now = Utc::now();
        let class = err.class();
        let summary = err.summary();
        warn!(class = %class, "Job attempt failed: {}", err);

        let outcome = match class {
            ErrorClass::SourceQuota => {
                let until = self
                    .config
                    .scheduler
                    .cooldown_until(now, retry_after_secs(&err));
                job.defer(until, summary, now)?;
                JobOutcome::CoolingDown {
                    store_id: job.source.store_id.clone(),
                    until,
                }
            }
            ErrorClass::TransientIo | ErrorClass::CatalogConflict => {
                match job.retry_or_fail(&self.config.retry, class, summary, now)? {
                    RetryDecision::Retry { eligible_at } => JobOutcome::Retrying { eligible_at },
                    RetryDecision::Exhausted => JobOutcome::failed(job),
                }
            }
            ErrorClass::ValidationFailure | ErrorClass::TerminalJobFailure => {
                let reason = match &err {
                    IngestError::Render(RenderError::PdfiumBindingFailed(_)) => {
                        FailureReason::NonRetryable
                    }
                    IngestError::Render(_) => FailureReason::DocumentRejected,
                    IngestError::Source(_) => FailureReason::SourceRejected,
                    _ => FailureReason::NonRetryable,
                };
                job.fail(reason, class, summary, now)?;
                JobOutcome::failed(job)
            }
        };

        self.save(job).await?;
        Ok(outcome)
    }
}
