//! Shared fakes for the integration tests.
//!
//! Everything runs over the in-memory stores. The fake renderer emits pages
//! whose PNG bytes are simply `page-{index}`, which lets the scripted vision
//! model answer per page without decoding images.

#![allow(dead_code)]

use async_trait::async_trait;
use flyer_ingest::pipeline::render::{check_magic, stream_pages};
use flyer_ingest::store::memory::{MemoryBlobStore, MemoryCatalog, MemoryJobQueue};
use flyer_ingest::{
    CatalogStore, Collaborators, EmbeddingSignal, ExtractionError, ExtractionJob, IngestConfig,
    IngestConfigBuilder, JobRunner, PdfRenderer, RenderError, RenderedDocument, RenderedPage,
    Scheduler, SourceError, SourceRef, SourceRegistry, StoreId, StoreLocale, StoreSource,
    VisionModel,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const PDF_V1: &[u8] = b"%PDF-1.7 flyer v1";
pub const PDF_V2: &[u8] = b"%PDF-1.7 flyer v2";
pub const PDF_CORRUPT: &[u8] = b"%PDF-1.7 corrupt";
/// Makes [`FakeRenderer`] behave as if pdfium could not be loaded.
pub const PDF_NO_PDFIUM: &[u8] = b"%PDF-1.7 unbindable";

/// Timings short enough for tests: millisecond backoffs and a fast poll.
pub fn fast_config() -> IngestConfigBuilder {
    IngestConfig::builder()
        .page_retry_backoff_ms(1)
        .retry_base_delay_ms(1)
        .retry_max_delay_ms(10)
        .poll_interval_ms(5)
        .per_store_requests_per_minute(60_000)
        .request_timeout_secs(5)
}

pub fn flyer_ref(store: &str, identity: &str) -> SourceRef {
    SourceRef::new(
        store,
        identity,
        format!("https://{store}.example/{identity}.pdf"),
    )
}

/// `{"listings": [...]}` with one entry per (name, price).
pub fn listings_json(items: &[(&str, &str)]) -> String {
    let listings: Vec<serde_json::Value> = items
        .iter()
        .map(|(name, price)| serde_json::json!({ "name": name, "price": price }))
        .collect();
    serde_json::json!({ "listings": listings }).to_string()
}

pub fn transient(detail: &str) -> ExtractionError {
    ExtractionError::Transient {
        detail: detail.to_string(),
    }
}

// ── Renderer ─────────────────────────────────────────────────────────────────

/// Renders a fixed number of synthetic pages for any PDF-looking input.
pub struct FakeRenderer {
    pages: usize,
    failing_pages: Vec<usize>,
    pub opened: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            failing_pages: Vec::new(),
            opened: AtomicUsize::new(0),
        }
    }

    /// Pages that fail to rasterise.
    pub fn failing(mut self, pages: &[usize]) -> Self {
        self.failing_pages = pages.to_vec();
        self
    }
}

#[async_trait]
impl PdfRenderer for FakeRenderer {
    async fn open(&self, pdf: Vec<u8>) -> Result<RenderedDocument, RenderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        check_magic(&pdf)?;
        if pdf.windows(10).any(|w| w == b"unbindable") {
            return Err(RenderError::PdfiumBindingFailed(
                "libpdfium.so: cannot open shared object file".into(),
            ));
        }
        if pdf.windows(7).any(|w| w == b"corrupt") {
            return Err(RenderError::CorruptPdf {
                detail: "FPDF_ERR_FORMAT at 0x3f2a".into(),
            });
        }

        let pages = self.pages;
        let failing = self.failing_pages.clone();
        stream_pages(2, move |emitter| {
            emitter.start(pages);
            for index in 0..pages {
                let item = if failing.contains(&index) {
                    Err(RenderError::RasterisationFailed {
                        page: index,
                        detail: "bitmap allocation failed".into(),
                    })
                } else {
                    Ok(RenderedPage {
                        index,
                        width: 100,
                        height: 140,
                        png: format!("page-{index}").into_bytes(),
                    })
                };
                if !emitter.emit(item) {
                    break;
                }
            }
            Ok(())
        })
        .await
    }
}

// ── Vision model ─────────────────────────────────────────────────────────────

type Responder = Box<dyn Fn(usize) -> Result<String, ExtractionError> + Send + Sync>;

/// Answers from a per-page script first, then from a fallback.
pub struct ScriptedVisionModel {
    scripts: Mutex<HashMap<usize, VecDeque<Result<String, ExtractionError>>>>,
    fallback: Responder,
    calls: AtomicUsize,
}

impl ScriptedVisionModel {
    pub fn new(
        fallback: impl Fn(usize) -> Result<String, ExtractionError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: Box::new(fallback),
            calls: AtomicUsize::new(0),
        })
    }

    /// One product per page, named after the page.
    pub fn one_listing_per_page(names: &'static [&'static str], price: &'static str) -> Arc<Self> {
        Self::new(move |page| {
            let name = names.get(page).copied().unwrap_or("Unknown item");
            Ok(listings_json(&[(name, price)]))
        })
    }

    /// Queue responses for `page`, consumed before the fallback.
    pub fn script(&self, page: usize, responses: Vec<Result<String, ExtractionError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .extend(responses);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn page_of(png: &[u8]) -> usize {
    std::str::from_utf8(png)
        .ok()
        .and_then(|s| s.strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

#[async_trait]
impl VisionModel for ScriptedVisionModel {
    async fn complete(
        &self,
        _system: &str,
        _user: &str,
        png: &[u8],
    ) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let page = page_of(png);
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| (self.fallback)(page))
    }
}

// ── Embeddings ───────────────────────────────────────────────────────────────

/// Fixed vectors per product name; unknown names get no embedding.
#[derive(Default)]
pub struct FakeEmbedding {
    vectors: HashMap<String, Vec<f32>>,
}

impl FakeEmbedding {
    pub fn with(mut self, name: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(name.to_string(), vector);
        self
    }
}

#[async_trait]
impl EmbeddingSignal for FakeEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExtractionError> {
        Ok(self.vectors.get(text).cloned().unwrap_or_default())
    }
}

/// A unit vector whose cosine with `[1, 0]` is `cos`.
pub fn at_cosine(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).max(0.0).sqrt()]
}

// ── Store source ─────────────────────────────────────────────────────────────

pub struct FakeSource {
    store_id: StoreId,
    locale: StoreLocale,
    identities: Vec<String>,
    pdf: Mutex<Vec<u8>>,
    failure: Mutex<Option<SourceError>>,
    delay: Duration,
    pub downloads: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeSource {
    pub fn new(store: &str, identities: &[&str]) -> Self {
        Self {
            store_id: StoreId::from(store),
            locale: StoreLocale {
                locale: "lt-LT".into(),
                currency: "EUR".into(),
                categories: vec!["Dairy".into()],
                boilerplate: vec!["akcija".into()],
            },
            identities: identities.iter().map(|s| s.to_string()).collect(),
            pdf: Mutex::new(PDF_V1.to_vec()),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            downloads: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_pdf(self, bytes: &[u8]) -> Self {
        self.set_pdf(bytes);
        self
    }

    /// Hold every download open for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every download with `err`.
    pub fn failing_with(self, err: SourceError) -> Self {
        *self.failure.lock().unwrap() = Some(err);
        self
    }

    pub fn set_pdf(&self, bytes: &[u8]) {
        *self.pdf.lock().unwrap() = bytes.to_vec();
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreSource for FakeSource {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    async fn discover(&self) -> Result<Vec<SourceRef>, SourceError> {
        Ok(self
            .identities
            .iter()
            .map(|id| flyer_ref(self.store_id.as_str(), id))
            .collect())
    }

    async fn download(&self, _flyer: &SourceRef) -> Result<Vec<u8>, SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.pdf.lock().unwrap().clone())
    }

    fn localize(&self) -> &StoreLocale {
        &self.locale
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub config: Arc<IngestConfig>,
    pub catalog: Arc<MemoryCatalog>,
    pub blobs: Arc<MemoryBlobStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub model: Arc<ScriptedVisionModel>,
    pub parts: Collaborators,
    pub runner: Arc<JobRunner>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub fn new(
        config: IngestConfig,
        renderer: FakeRenderer,
        model: Arc<ScriptedVisionModel>,
        sources: Vec<Arc<FakeSource>>,
    ) -> Self {
        Self::with_embeddings(config, renderer, model, None, sources)
    }

    pub fn with_embeddings(
        config: IngestConfig,
        renderer: FakeRenderer,
        model: Arc<ScriptedVisionModel>,
        embeddings: Option<Arc<FakeEmbedding>>,
        sources: Vec<Arc<FakeSource>>,
    ) -> Self {
        let config = Arc::new(config);
        let catalog = Arc::new(MemoryCatalog::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());

        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.register(source);
        }

        let parts = Collaborators {
            catalog: catalog.clone(),
            blobs: blobs.clone(),
            renderer: Arc::new(renderer),
            model: model.clone(),
            embeddings: embeddings.map(|e| e as Arc<dyn EmbeddingSignal>),
            sources: registry,
        };
        let runner = Arc::new(JobRunner::new(config.clone(), parts.clone()));
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            queue.clone(),
            catalog.clone(),
            runner.clone(),
        ));

        Self {
            config,
            catalog,
            blobs,
            queue,
            model,
            parts,
            runner,
            scheduler,
        }
    }

    /// A second runner over the same stores, as another worker process would be.
    pub fn second_runner(&self) -> JobRunner {
        JobRunner::new(self.config.clone(), self.parts.clone())
    }

    pub async fn submit(&self, store: &str, identity: &str) -> Uuid {
        self.scheduler
            .submit(flyer_ref(store, identity))
            .await
            .expect("submit")
            .job_id
    }

    pub async fn job(&self, id: Uuid) -> ExtractionJob {
        self.catalog
            .get_job(id)
            .await
            .expect("catalog")
            .expect("job exists")
    }
}
