//! CLI binary for flyer-ingest.
//!
//! Ingests one flyer (local PDF or URL) for one store into in-memory stores
//! and prints the job report. A thin shim over the library crate: flags map
//! to `IngestConfig`, the scheduler does the rest.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use flyer_ingest::store::memory::{MemoryBlobStore, MemoryCatalog, MemoryJobQueue};
use flyer_ingest::{
    Collaborators, HttpFlyerSource, IngestConfig, JobOutcome, JobProgressCallback, JobReport,
    JobRunner, JobState, LlmVisionModel, PdfiumRenderer, ProgressCallback, Scheduler,
    SchedulerEvent, SourceError, SourceRef, SourceRegistry, StoreId, StoreLocale, StoreSource,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar with one log line per page. Pages complete out of order
/// when extraction runs concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    listings: AtomicUsize,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Fetching flyer…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            listings: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, page: usize) -> String {
        let ms = self
            .start_times
            .lock()
            .map(|mut t| t.remove(&page))
            .ok()
            .flatten()
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, _job_id: Uuid, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Reading {total_pages} flyer pages…"))
        ));
    }

    fn on_page_start(&self, _job_id: Uuid, page_index: usize, _total: usize) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(page_index, Instant::now());
        }
        self.bar.set_message(format!("page {}", page_index + 1));
    }

    fn on_page_complete(&self, _job_id: Uuid, page_index: usize, total: usize, listings: usize) {
        self.listings.fetch_add(listings, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            page_index + 1,
            total,
            dim(&format!("{listings:>4} listings")),
            dim(&self.elapsed(page_index)),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, _job_id: Uuid, page_index: usize, total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(['…']).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_index + 1,
            total,
            red(&msg),
            dim(&self.elapsed(page_index)),
        ));
        self.bar.inc(1);
    }

    fn on_job_finish(&self, _job_id: Uuid, state: JobState) {
        if state.is_terminal() {
            self.bar.finish_and_clear();
        } else {
            self.bar.set_prefix("Waiting");
            self.bar.set_message(format!("job is {state}"));
        }
    }
}

// ── Local file source ────────────────────────────────────────────────────────

/// A store whose only flyer is a file on disk.
struct FileFlyerSource {
    store_id: StoreId,
    locale: StoreLocale,
    identity: String,
    path: PathBuf,
}

#[async_trait]
impl StoreSource for FileFlyerSource {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    async fn discover(&self) -> Result<Vec<SourceRef>, SourceError> {
        Ok(vec![SourceRef::new(
            self.store_id.clone(),
            self.identity.clone(),
            format!("file://{}", self.path.display()),
        )])
    }

    async fn download(&self, flyer: &SourceRef) -> Result<Vec<u8>, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SourceError::Transient {
                url: flyer.url.clone(),
                detail: e.to_string(),
            })?;
        if !bytes.starts_with(b"%PDF") {
            return Err(SourceError::NotAPdf {
                url: flyer.url.clone(),
                magic: bytes.iter().take(4).copied().collect(),
            });
        }
        Ok(bytes)
    }

    fn localize(&self) -> &StoreLocale {
        &self.locale
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest a local flyer for a store
  flyer-ingest --store maxima flyer.pdf

  # Lithuanian store, strip promo boilerplate from product names
  flyer-ingest --store maxima --locale lt-LT --currency EUR \
      --boilerplate akcija --boilerplate "tik šiandien" flyer.pdf

  # Ingest from a URL with a specific model, JSON report
  flyer-ingest --store rimi --model gpt-4.1 --json https://rimi.example/w01.pdf

  # Print the catalog rows that were written
  flyer-ingest --store maxima --products flyer.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
  FLYER_*                 Pipeline tuning, see IngestConfig::from_env
"#;

/// Ingest a retail flyer and reconcile its listings against a catalog.
#[derive(Parser, Debug)]
#[command(
    name = "flyer-ingest",
    version,
    about = "Extract product listings and prices from retail flyer PDFs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Store identifier the flyer belongs to.
    #[arg(long, env = "FLYER_STORE", default_value = "local")]
    store: String,

    /// Flyer slot identity (e.g. 2024-W01). Defaults to the file name.
    #[arg(long)]
    flyer_id: Option<String>,

    /// Store locale as a BCP 47 tag.
    #[arg(long, env = "FLYER_LOCALE", default_value = "en-US")]
    locale: String,

    /// ISO 4217 currency of flyer prices.
    #[arg(long, env = "FLYER_CURRENCY", default_value = "USD")]
    currency: String,

    /// Product category hint for the model (repeatable).
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Phrase stripped from product names before matching (repeatable).
    #[arg(long = "boilerplate")]
    boilerplate: Vec<String>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "FLYER_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Number of concurrent page extractions.
    #[arg(short, long, env = "FLYER_PAGE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Per-page model call timeout in seconds.
    #[arg(long, env = "FLYER_MODEL_TIMEOUT_SECS", default_value_t = 60)]
    api_timeout: u64,

    /// Job attempts before giving up on transient failures.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Initial delay between job attempts in milliseconds.
    #[arg(long, default_value_t = 2000)]
    retry_delay_ms: u64,

    /// Cool-down after a quota error when no retry-after was given, in seconds.
    #[arg(long, default_value_t = 60)]
    quota_cooldown: u64,

    /// Match score at or above which an existing product is reused.
    #[arg(long, default_value_t = 0.85)]
    accept_threshold: f64,

    /// Match score below which a new product master is created.
    #[arg(long, default_value_t = 0.6)]
    review_threshold: f64,

    /// Output the job report as JSON.
    #[arg(long)]
    json: bool,

    /// Print the products and prices written to the catalog.
    #[arg(long)]
    products: bool,

    /// Disable progress bar.
    #[arg(long, env = "FLYER_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "FLYER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "FLYER_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless asked otherwise.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let config = Arc::new(build_config(&cli)?);
    let locale = StoreLocale {
        locale: cli.locale.clone(),
        currency: cli.currency.clone(),
        categories: cli.categories.clone(),
        boilerplate: cli.boilerplate.clone(),
    };
    let (source, flyer) = build_source(&cli, locale)?;

    let model = LlmVisionModel::from_config(&config.extraction)
        .context("Failed to configure the vision model")?;

    // ── Wire the pipeline over in-memory stores ──────────────────────────
    let catalog = Arc::new(MemoryCatalog::new());
    let mut runner = JobRunner::new(
        config.clone(),
        Collaborators {
            catalog: catalog.clone(),
            blobs: Arc::new(MemoryBlobStore::new()),
            renderer: Arc::new(PdfiumRenderer::new(config.render.clone())),
            model: Arc::new(model),
            embeddings: None,
            sources: SourceRegistry::new().with(source),
        },
    );
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        runner = runner.with_progress(cb);
    }

    let scheduler = Scheduler::new(
        config,
        Arc::new(MemoryJobQueue::new()),
        catalog.clone(),
        Arc::new(runner),
    );
    let mut events = scheduler.events();

    let submission = scheduler
        .submit(flyer)
        .await
        .context("Failed to submit flyer")?;
    scheduler
        .run_until_idle()
        .await
        .context("Scheduler stopped unexpectedly")?;

    // ── Collect the final outcome ────────────────────────────────────────
    let mut last: Option<JobOutcome> = None;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::JobFinished {
                job_id, outcome, ..
            } if job_id == submission.job_id => last = Some(outcome),
            SchedulerEvent::JobErrored { job_id, error, .. } if job_id == submission.job_id => {
                bail!("Job {job_id} errored: {error}");
            }
            _ => {}
        }
    }

    let report = match last {
        Some(JobOutcome::Completed(report)) => report,
        Some(JobOutcome::Failed { reason, summary }) => {
            bail!("Flyer ingestion failed ({reason}): {summary}")
        }
        Some(other) => bail!("Flyer ingestion did not finish: {other:?}"),
        None => bail!("No outcome recorded for job {}", submission.job_id),
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else if !cli.quiet {
        print_summary(&report);
    }

    if cli.products {
        print_products(&catalog, submission.job_id);
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<IngestConfig> {
    let mut builder = IngestConfig::builder()
        .dpi(cli.dpi)
        .page_concurrency(cli.concurrency)
        .request_timeout_secs(cli.api_timeout)
        .max_attempts(cli.max_attempts)
        .retry_base_delay_ms(cli.retry_delay_ms)
        .quota_cooldown_secs(cli.quota_cooldown)
        .accept_threshold(cli.accept_threshold)
        .review_threshold(cli.review_threshold);
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = cli.pdfium_lib {
        builder = builder.pdfium_library_path(path.clone());
    }
    builder.build().context("Invalid configuration")
}

fn build_source(cli: &Cli, locale: StoreLocale) -> Result<(Arc<dyn StoreSource>, SourceRef)> {
    let store_id = StoreId::new(cli.store.clone());
    let is_url = cli.input.starts_with("http://") || cli.input.starts_with("https://");

    let identity = cli.flyer_id.clone().unwrap_or_else(|| {
        cli.input
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("flyer")
            .to_string()
    });

    if is_url {
        let source = HttpFlyerSource::new(store_id.clone(), locale, 120)
            .with_flyer(identity.clone(), cli.input.clone());
        let flyer = SourceRef::new(store_id, identity, cli.input.clone());
        return Ok((Arc::new(source), flyer));
    }

    let path = PathBuf::from(&cli.input);
    if !path.is_file() {
        bail!("Input file not found: {}", path.display());
    }
    let flyer = SourceRef::new(
        store_id.clone(),
        identity.clone(),
        format!("file://{}", path.display()),
    );
    let source = FileFlyerSource {
        store_id,
        locale,
        identity,
        path,
    };
    Ok((Arc::new(source), flyer))
}

fn print_summary(report: &JobReport) {
    if report.unchanged {
        eprintln!(
            "{} {} unchanged since last run, nothing written",
            cyan("◆"),
            bold(&format!("{}/{}", report.store_id, report.flyer_identity))
        );
        return;
    }

    let icon = if report.pages_failed == 0 {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{} {}/{} pages read  ({} failed)",
        icon,
        bold(&report.pages_succeeded.to_string()),
        report.pages_total,
        if report.pages_failed == 0 {
            report.pages_failed.to_string()
        } else {
            red(&report.pages_failed.to_string())
        },
    );
    let m = &report.matching;
    eprintln!(
        "  {} listings  {} matched ({} low confidence)  {} new  {} rejected",
        bold(&m.candidates.to_string()),
        m.matched,
        m.low_confidence,
        m.created,
        m.rejected,
    );
    eprintln!(
        "  {}",
        dim(&format!(
            "{} products, {} price points written",
            m.products_written, m.price_points_written
        ))
    );
    for error in &report.page_errors {
        eprintln!("  {} {}", red("✗"), error);
    }
}

fn print_products(catalog: &MemoryCatalog, job_id: Uuid) {
    let mut products: Vec<_> = catalog
        .products()
        .into_iter()
        .filter(|p| p.job_id == job_id)
        .collect();
    products.sort_by_key(|p| p.key());

    for p in products {
        let flag = if p.low_confidence { " ?" } else { "" };
        println!(
            "p{:<3} {:<48} {:>10}  {}{}",
            p.page_index + 1,
            p.name,
            p.price.to_string(),
            p.unit.as_deref().unwrap_or(""),
            flag
        );
    }
}
