//! Configuration types for flyer ingestion.
//!
//! Every tunable knob lives in [`IngestConfig`], split into one section per
//! component. The value is built once (via [`IngestConfig::builder()`] or
//! [`IngestConfig::from_env()`]), validated, wrapped in an `Arc` and handed to
//! the constructors of the scheduler, job runner, extraction client and
//! matching engine. Nothing reads configuration from globals after startup.
//!
//! # Example
//! ```rust
//! use flyer_ingest::IngestConfig;
//!
//! let config = IngestConfig::builder()
//!     .workers(8)
//!     .page_concurrency(6)
//!     .accept_threshold(0.9)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.scheduler.workers, 8);
//! ```

use crate::error::IngestError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// PDF rasterisation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Rendering DPI. Range: 72–400. Default: 150.
    ///
    /// Flyers are dense with small price tags; 150 DPI keeps them legible to a
    /// vision model without blowing past upload limits.
    pub dpi: u32,

    /// Maximum rendered width or height in pixels. Default: 4000.
    ///
    /// A page that would render larger than this at the configured DPI fails
    /// with [`crate::RenderError::PageTooLarge`]; other pages are unaffected.
    pub max_page_pixels: u32,

    /// Rendered pages buffered between the render thread and the consumer.
    /// Default: 2.
    pub channel_capacity: usize,

    /// Directory containing the pdfium shared library. If None, binds to the
    /// system library.
    pub pdfium_library_path: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_page_pixels: 4000,
            channel_capacity: 2,
            pdfium_library_path: None,
        }
    }
}

/// Extraction client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// LLM provider name (e.g. "openai", "anthropic"). If None, auto-detected
    /// from the environment.
    pub provider_name: Option<String>,

    /// Model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens per completion. Default: 4096.
    pub max_tokens: usize,

    /// Per-call timeout in seconds. Default: 60. Must stay below the lease
    /// timeout so a worker can report before losing its lease.
    pub request_timeout_secs: u64,

    /// Responses larger than this are rejected unparsed. Default: 256 KiB.
    pub max_response_bytes: usize,

    /// Pages claiming more listings than this are rejected. Default: 200.
    pub max_listings_per_page: usize,

    /// Concurrent page calls within one job. Default: 4.
    pub page_concurrency: usize,

    /// Attempts per page on transient model failures. Default: 3.
    pub page_max_attempts: u32,

    /// Initial per-page retry delay in milliseconds, doubled each attempt.
    /// Default: 500.
    pub page_retry_backoff_ms: u64,

    /// Prices above this are treated as extraction noise. Default: 10000.
    pub max_price: Decimal,

    /// Validity dates further than this from today are rejected. Default: 400.
    pub date_window_days: i64,

    /// Custom system prompt. If None, uses the built-in one.
    pub system_prompt: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider_name: None,
            model: None,
            temperature: 0.0,
            max_tokens: 4096,
            request_timeout_secs: 60,
            max_response_bytes: 256 * 1024,
            max_listings_per_page: 200,
            page_concurrency: 4,
            page_max_attempts: 3,
            page_retry_backoff_ms: 500,
            max_price: Decimal::from(10_000),
            date_window_days: 400,
            system_prompt: None,
        }
    }
}

impl ExtractionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Matching engine thresholds and weights.
///
/// The threshold values are policy, not physics: tune them per catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Scores at or above this match an existing master. Default: 0.85.
    pub accept_threshold: f64,

    /// Scores in `[review, accept)` still match but are flagged
    /// low-confidence. Below this a new master is created. Default: 0.6.
    pub review_threshold: f64,

    /// Weight applied to the trigram score. Default: 1.0.
    pub lexical_weight: f64,

    /// Weight applied to the embedding cosine score. Default: 1.0.
    pub semantic_weight: f64,

    /// Candidate masters fetched from the catalog per listing. Default: 25.
    pub candidate_limit: usize,

    /// Normalized names shorter than this are rejected. Default: 2.
    pub min_name_chars: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.85,
            review_threshold: 0.6,
            lexical_weight: 1.0,
            semantic_weight: 1.0,
            candidate_limit: 25,
            min_name_chars: 2,
        }
    }
}

/// Job-level retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before a job is marked `Failed`. Default: 5.
    pub max_attempts: u32,

    /// Base delay in milliseconds; attempt `n` waits `base * 2^n`. Default: 30 s.
    pub base_delay_ms: u64,

    /// Upper bound on a single delay. Default: 1 h.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 30_000,
            max_delay_ms: 3_600_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-entering `Discovered` after the given attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Worker pool and per-store limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs processed concurrently across all stores. Default: 4.
    pub workers: usize,

    /// Jobs processed concurrently for one store. Default: 1.
    pub per_store_concurrency: usize,

    /// Outbound requests per minute for one store, model calls included.
    /// Default: 60.
    pub per_store_requests_per_minute: u32,

    /// Lease visibility timeout in seconds. Default: 900.
    pub lease_timeout_secs: u64,

    /// Seconds reserved at the end of a lease for reporting. Default: 30.
    pub lease_margin_secs: u64,

    /// Queue polling interval when nothing is leasable. Default: 500 ms.
    pub poll_interval_ms: u64,

    /// Store cool-down after a quota error when the upstream gave no
    /// retry-after hint. Default: 900.
    pub quota_cooldown_secs: u64,

    /// Upper bound on any store cool-down, retry-after hints included.
    /// Default: 86400.
    pub max_cooldown_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            per_store_concurrency: 1,
            per_store_requests_per_minute: 60,
            lease_timeout_secs: 900,
            lease_margin_secs: 30,
            poll_interval_ms: 500,
            quota_cooldown_secs: 900,
            max_cooldown_secs: 86_400,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Time a worker may spend on a job before it must give up and report.
    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs.saturating_sub(self.lease_margin_secs))
    }

    /// End of a store cool-down starting at `now`.
    ///
    /// `hint_secs` comes from the upstream (`Retry-After`) and is capped at
    /// `max_cooldown_secs`. A deadline that cannot be represented falls back
    /// to `quota_cooldown_secs`.
    pub fn cooldown_until(&self, now: DateTime<Utc>, hint_secs: Option<u64>) -> DateTime<Utc> {
        let secs = hint_secs
            .unwrap_or(self.quota_cooldown_secs)
            .min(self.max_cooldown_secs);
        let deadline = |secs: u64| {
            i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|d| now.checked_add_signed(d))
        };
        deadline(secs)
            .or_else(|| deadline(self.quota_cooldown_secs))
            .unwrap_or(now)
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    pub render: RenderConfig,
    pub extraction: ExtractionConfig,
    pub matching: MatchingConfig,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
}

impl IngestConfig {
    /// Create a new builder starting from defaults.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a config from environment variables over defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FLYER_WORKERS` | `scheduler.workers` |
    /// | `FLYER_STORE_CONCURRENCY` | `scheduler.per_store_concurrency` |
    /// | `FLYER_STORE_RPM` | `scheduler.per_store_requests_per_minute` |
    /// | `FLYER_LEASE_TIMEOUT_SECS` | `scheduler.lease_timeout_secs` |
    /// | `FLYER_QUOTA_COOLDOWN_SECS` | `scheduler.quota_cooldown_secs` |
    /// | `FLYER_MAX_COOLDOWN_SECS` | `scheduler.max_cooldown_secs` |
    /// | `FLYER_PAGE_CONCURRENCY` | `extraction.page_concurrency` |
    /// | `FLYER_MODEL_TIMEOUT_SECS` | `extraction.request_timeout_secs` |
    /// | `FLYER_LLM_PROVIDER` | `extraction.provider_name` |
    /// | `FLYER_MODEL` | `extraction.model` |
    /// | `FLYER_DPI` | `render.dpi` |
    /// | `PDFIUM_LIB_PATH` | `render.pdfium_library_path` |
    /// | `FLYER_ACCEPT_THRESHOLD` | `matching.accept_threshold` |
    /// | `FLYER_REVIEW_THRESHOLD` | `matching.review_threshold` |
    /// | `FLYER_MAX_ATTEMPTS` | `retry.max_attempts` |
    pub fn from_env() -> Result<Self, IngestError> {
        let mut b = Self::builder();
        if let Some(v) = env_parse::<usize>("FLYER_WORKERS") {
            b = b.workers(v);
        }
        if let Some(v) = env_parse::<usize>("FLYER_STORE_CONCURRENCY") {
            b = b.per_store_concurrency(v);
        }
        if let Some(v) = env_parse::<u32>("FLYER_STORE_RPM") {
            b = b.per_store_requests_per_minute(v);
        }
        if let Some(v) = env_parse::<u64>("FLYER_LEASE_TIMEOUT_SECS") {
            b = b.lease_timeout_secs(v);
        }
        if let Some(v) = env_parse::<u64>("FLYER_QUOTA_COOLDOWN_SECS") {
            b = b.quota_cooldown_secs(v);
        }
        if let Some(v) = env_parse::<u64>("FLYER_MAX_COOLDOWN_SECS") {
            b = b.max_cooldown_secs(v);
        }
        if let Some(v) = env_parse::<usize>("FLYER_PAGE_CONCURRENCY") {
            b = b.page_concurrency(v);
        }
        if let Some(v) = env_parse::<u64>("FLYER_MODEL_TIMEOUT_SECS") {
            b = b.request_timeout_secs(v);
        }
        if let Some(v) = env_string("FLYER_LLM_PROVIDER") {
            b = b.provider_name(v);
        }
        if let Some(v) = env_string("FLYER_MODEL") {
            b = b.model(v);
        }
        if let Some(v) = env_parse::<u32>("FLYER_DPI") {
            b = b.dpi(v);
        }
        if let Some(v) = env_string("PDFIUM_LIB_PATH") {
            b = b.pdfium_library_path(v);
        }
        if let Some(v) = env_parse::<f64>("FLYER_ACCEPT_THRESHOLD") {
            b = b.accept_threshold(v);
        }
        if let Some(v) = env_parse::<f64>("FLYER_REVIEW_THRESHOLD") {
            b = b.review_threshold(v);
        }
        if let Some(v) = env_parse::<u32>("FLYER_MAX_ATTEMPTS") {
            b = b.max_attempts(v);
        }
        b.build()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.render.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_page_pixels(mut self, px: u32) -> Self {
        self.config.render.max_page_pixels = px.max(100);
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.render.pdfium_library_path = Some(path.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.extraction.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.extraction.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.extraction.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extraction.request_timeout_secs = secs.max(1);
        self
    }

    pub fn max_listings_per_page(mut self, n: usize) -> Self {
        self.config.extraction.max_listings_per_page = n;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.extraction.page_concurrency = n.max(1);
        self
    }

    pub fn page_max_attempts(mut self, n: u32) -> Self {
        self.config.extraction.page_max_attempts = n.max(1);
        self
    }

    pub fn page_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.extraction.page_retry_backoff_ms = ms;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.extraction.system_prompt = Some(prompt.into());
        self
    }

    pub fn accept_threshold(mut self, t: f64) -> Self {
        self.config.matching.accept_threshold = t;
        self
    }

    pub fn review_threshold(mut self, t: f64) -> Self {
        self.config.matching.review_threshold = t;
        self
    }

    pub fn semantic_weight(mut self, w: f64) -> Self {
        self.config.matching.semantic_weight = w;
        self
    }

    pub fn lexical_weight(mut self, w: f64) -> Self {
        self.config.matching.lexical_weight = w;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n.max(1);
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.scheduler.workers = n.max(1);
        self
    }

    pub fn per_store_concurrency(mut self, n: usize) -> Self {
        self.config.scheduler.per_store_concurrency = n.max(1);
        self
    }

    pub fn per_store_requests_per_minute(mut self, n: u32) -> Self {
        self.config.scheduler.per_store_requests_per_minute = n.max(1);
        self
    }

    pub fn lease_timeout_secs(mut self, secs: u64) -> Self {
        self.config.scheduler.lease_timeout_secs = secs;
        self
    }

    pub fn lease_margin_secs(mut self, secs: u64) -> Self {
        self.config.scheduler.lease_margin_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.poll_interval_ms = ms.max(1);
        self
    }

    pub fn quota_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.scheduler.quota_cooldown_secs = secs;
        self
    }

    pub fn max_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.scheduler.max_cooldown_secs = secs;
        self
    }

    /// Build the configuration, validating cross-field constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        let m = &c.matching;
        if !(0.0..=1.0).contains(&m.accept_threshold) || !(0.0..=1.0).contains(&m.review_threshold)
        {
            return Err(IngestError::InvalidConfig(format!(
                "thresholds must be within 0–1, got accept={} review={}",
                m.accept_threshold, m.review_threshold
            )));
        }
        if m.review_threshold > m.accept_threshold {
            return Err(IngestError::InvalidConfig(format!(
                "review threshold {} is above accept threshold {}",
                m.review_threshold, m.accept_threshold
            )));
        }
        if m.lexical_weight < 0.0 || m.semantic_weight < 0.0 {
            return Err(IngestError::InvalidConfig(
                "similarity weights must not be negative".into(),
            ));
        }
        if c.scheduler.lease_margin_secs >= c.scheduler.lease_timeout_secs {
            return Err(IngestError::InvalidConfig(format!(
                "lease margin {}s must be shorter than the lease timeout {}s",
                c.scheduler.lease_margin_secs, c.scheduler.lease_timeout_secs
            )));
        }
        if c.extraction.request_timeout_secs >= c.scheduler.job_deadline().as_secs() {
            return Err(IngestError::InvalidConfig(format!(
                "model timeout {}s must be shorter than the job deadline {}s",
                c.extraction.request_timeout_secs,
                c.scheduler.job_deadline().as_secs()
            )));
        }
        if c.scheduler.quota_cooldown_secs > c.scheduler.max_cooldown_secs {
            return Err(IngestError::InvalidConfig(format!(
                "quota cool-down {}s is above the maximum cool-down {}s",
                c.scheduler.quota_cooldown_secs, c.scheduler.max_cooldown_secs
            )));
        }
        if c.render.channel_capacity == 0 {
            return Err(IngestError::InvalidConfig(
                "render channel capacity must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let c = IngestConfig::builder().build().expect("defaults are valid");
        assert_eq!(c.render.dpi, 150);
        assert_eq!(c.scheduler.workers, 4);
        assert!(c.matching.review_threshold < c.matching.accept_threshold);
    }

    #[test]
    fn review_above_accept_is_rejected() {
        let err = IngestConfig::builder()
            .accept_threshold(0.7)
            .review_threshold(0.8)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("review threshold"), "got: {err}");
    }

    #[test]
    fn model_timeout_must_fit_inside_lease() {
        let err = IngestConfig::builder()
            .lease_timeout_secs(60)
            .lease_margin_secs(10)
            .request_timeout_secs(55)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("job deadline"), "got: {err}");
    }

    #[test]
    fn setters_clamp() {
        let c = IngestConfig::builder()
            .dpi(10)
            .workers(0)
            .page_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.render.dpi, 72);
        assert_eq!(c.scheduler.workers, 1);
        assert_eq!(c.extraction.page_concurrency, 1);
    }

    #[test]
    fn cooldown_hint_is_capped() {
        let c = IngestConfig::builder()
            .quota_cooldown_secs(120)
            .max_cooldown_secs(3600)
            .build()
            .unwrap()
            .scheduler;
        let now = Utc::now();
        assert_eq!(c.cooldown_until(now, None), now + chrono::Duration::seconds(120));
        assert_eq!(c.cooldown_until(now, Some(60)), now + chrono::Duration::seconds(60));
        assert_eq!(c.cooldown_until(now, Some(u64::MAX)), now + chrono::Duration::seconds(3600));
    }

    #[test]
    fn unrepresentable_cooldown_falls_back() {
        let c = SchedulerConfig {
            quota_cooldown_secs: 300,
            max_cooldown_secs: u64::MAX,
            ..Default::default()
        };
        let now = Utc::now();
        assert_eq!(
            c.cooldown_until(now, Some(100_000_000_000_000)),
            now + chrono::Duration::seconds(300)
        );
    }

    #[test]
    fn quota_cooldown_above_maximum_is_rejected() {
        let err = IngestConfig::builder()
            .quota_cooldown_secs(7200)
            .max_cooldown_secs(3600)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("maximum cool-down"), "got: {err}");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
    }
}
