//! # flyer-ingest
//!
//! Ingest retail flyers (PDF), read their listings with a vision model and
//! reconcile them against a product catalog with price history.
//!
//! ## Why this crate?
//!
//! Flyers are designed for people, not parsers: prices sit in starbursts,
//! product names wrap around photos and every store lays pages out
//! differently. This crate rasterises each page, lets a vision model read it
//! the way a shopper would, then does the unglamorous part properly: retries,
//! quotas, idempotent re-runs and fuzzy matching of noisy names against a
//! catalog that must not fill up with duplicates.
//!
//! ## Pipeline Overview
//!
//! ```text
//! StoreSource ─▶ Scheduler ─lease─▶ JobRunner
//!                                    │
//!                                    ├─ 1. Fetch     download PDF, fingerprint, skip if unchanged
//!                                    ├─ 2. Render    rasterise pages via pdfium (spawn_blocking, bounded channel)
//!                                    ├─ 3. Extract   concurrent vision-model calls per page
//!                                    ├─ 4. Aggregate listings in page order
//!                                    ├─ 5. Match     resolve each listing to a product master
//!                                    └─ 6. Record    products, price history, flyer fingerprint
//! ```
//!
//! Persistence is abstracted behind [`BlobStore`], [`CatalogStore`] and
//! [`JobQueue`]; [`store::memory`] provides in-process implementations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flyer_ingest::store::memory::{MemoryBlobStore, MemoryCatalog, MemoryJobQueue};
//! use flyer_ingest::{
//!     Collaborators, HttpFlyerSource, IngestConfig, JobRunner, LlmVisionModel, PdfiumRenderer,
//!     Scheduler, SourceRegistry, StoreLocale,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(IngestConfig::from_env()?);
//!     let catalog = Arc::new(MemoryCatalog::new());
//!     let sources = SourceRegistry::new().with(Arc::new(
//!         HttpFlyerSource::new("maxima", StoreLocale::default(), 30)
//!             .with_flyer("2024-W01", "https://maxima.example/w01.pdf"),
//!     ));
//!
//!     let runner = JobRunner::new(
//!         config.clone(),
//!         Collaborators {
//!             catalog: catalog.clone(),
//!             blobs: Arc::new(MemoryBlobStore::new()),
//!             renderer: Arc::new(PdfiumRenderer::new(config.render.clone())),
//!             model: Arc::new(LlmVisionModel::from_config(&config.extraction)?),
//!             embeddings: None,
//!             sources,
//!         },
//!     );
//!     let scheduler = Scheduler::new(
//!         config,
//!         Arc::new(MemoryJobQueue::new()),
//!         catalog,
//!         Arc::new(runner),
//!     );
//!
//!     scheduler.discover().await?;
//!     scheduler.run_until_idle().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `flyer-ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! flyer-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod matching;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod rate_limit;
pub mod runner;
pub mod scheduler;
pub mod source;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ExtractionConfig, IngestConfig, IngestConfigBuilder, MatchingConfig, RenderConfig,
    RetryPolicy, SchedulerConfig,
};
pub use error::{
    BlobError, CatalogError, ErrorClass, ExtractionError, IngestError, PageError, QueueError,
    RenderError, SourceError,
};
pub use job::{ExtractionJob, FailureReason, JobState, PageResult, PageStatus};
pub use matching::similarity::EmbeddingSignal;
pub use matching::MatchingEngine;
pub use model::{
    BlobRef, CandidateListing, MatchSummary, PricePoint, Product, ProductMaster, Resolution,
    SourceRef, StoreId, StoreLocale,
};
pub use pipeline::extract::{ExtractionClient, LlmVisionModel, VisionModel};
pub use pipeline::render::{PdfRenderer, PdfiumRenderer, RenderedDocument, RenderedPage};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
pub use runner::{Collaborators, JobOutcome, JobReport, JobRunner};
pub use scheduler::{Scheduler, SchedulerEvent, Submission};
pub use source::{HttpFlyerSource, SourceRegistry, StoreSource};
pub use store::{BlobStore, CatalogStore, Inserted, JobQueue, Lease};
