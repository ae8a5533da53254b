//! Extraction client: page image → validated candidate listings.
//!
//! The client is thin. Prompts live in [`crate::prompts`], response parsing
//! in [`crate::pipeline::parse`]. What stays here is the call discipline:
//!
//! * every call is paced by the store's rate limiter, if one is given;
//! * every call is bounded by `request_timeout_secs`, so a hung model call
//!   can never outlive the job lease;
//! * an unparseable response is retried exactly once with a stricter schema
//!   hint before the page is given up as `InvalidResponse`.
//!
//! Transient failures are NOT retried here: the job runner owns per-page
//! retry and backoff, so attempts can be counted on the page result.

use crate::config::ExtractionConfig;
use crate::error::{ExtractionError, IngestError};
use crate::model::{CandidateListing, StoreLocale};
use crate::pipeline::encode::image_data;
use crate::pipeline::parse::parse_listings;
use crate::prompts::{page_context, EXTRACTION_SYSTEM_PROMPT, STRICT_SCHEMA_HINT};
use crate::rate_limit::StoreRateLimiter;
use async_trait::async_trait;
use chrono::NaiveDate;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A vision-capable model answering one prompt about one image.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Send `system` and `user` text with the PNG page, return the raw reply.
    async fn complete(&self, system: &str, user: &str, png: &[u8])
        -> Result<String, ExtractionError>;
}

/// [`VisionModel`] backed by an `edgequake-llm` provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Resolve the provider, from most-specific to least-specific:
    ///
    /// 1. `provider_name` (+ `model`) in the config
    /// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` env vars
    /// 3. OpenAI when `OPENAI_API_KEY` is set
    /// 4. Auto-detection from the remaining API key env vars
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }
}

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    info!("Using provider: {}, model: {}", name, model);
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        IngestError::InvalidConfig(format!(
            "failed to create provider '{name}' with model '{model}': {e}"
        ))
    })
}

fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(name) = &config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(name), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !name.is_empty() && !env_model.is_empty() {
            return create_provider(&name, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
        IngestError::InvalidConfig(format!(
            "no LLM provider configured ({e}); set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY"
        ))
    })?;
    Ok(llm)
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        png: &[u8],
    ) -> Result<String, ExtractionError> {
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user_with_images(user, vec![image_data(png)]),
        ];
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let start = Instant::now();
        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "{} input tokens, {} output tokens, {:?}",
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                Ok(response.content)
            }
            Err(e) => Err(classify_provider_error(&e.to_string())),
        }
    }
}

/// Map a provider error message onto the extraction taxonomy.
///
/// Provider errors only expose a message, so rate limiting is recognised by
/// its usual wording. Anything unrecognised is treated as transient; the
/// page attempt budget bounds how often it is retried.
pub fn classify_provider_error(message: &str) -> ExtractionError {
    let lower = message.to_lowercase();
    let quota = ["429", "rate limit", "rate_limit", "too many requests", "quota"]
        .iter()
        .any(|needle| lower.contains(needle));
    if quota {
        ExtractionError::QuotaExceeded {
            retry_after_secs: None,
        }
    } else {
        ExtractionError::Transient {
            detail: message.to_string(),
        }
    }
}

/// Per-page inputs to [`ExtractionClient::extract`].
pub struct PageContext<'a> {
    pub locale: &'a StoreLocale,
    pub page_index: usize,
    /// Anchors the plausibility window for offer dates.
    pub observed_on: NaiveDate,
    pub limiter: Option<&'a StoreRateLimiter>,
}

/// Listings read from one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    pub listings: Vec<CandidateListing>,
    /// Raw reply the listings were parsed from.
    pub raw_response: String,
    /// Model calls made, including the strict retry.
    pub calls: u32,
}

pub struct ExtractionClient {
    model: Arc<dyn VisionModel>,
    config: ExtractionConfig,
}

impl ExtractionClient {
    pub fn new(model: Arc<dyn VisionModel>, config: ExtractionConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract listings from one rendered page.
    pub async fn extract(
        &self,
        png: &[u8],
        ctx: &PageContext<'_>,
    ) -> Result<PageExtraction, ExtractionError> {
        let system = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(EXTRACTION_SYSTEM_PROMPT);
        let user = page_context(ctx.locale, ctx.page_index);

        let raw = self.call(system, &user, png, ctx).await?;
        let first = match self.parse(&raw, ctx) {
            Ok(listings) => {
                return Ok(PageExtraction {
                    listings,
                    raw_response: raw,
                    calls: 1,
                })
            }
            Err(e) => e,
        };

        warn!(
            "Page {}: {}; retrying with strict schema hint",
            ctx.page_index, first
        );
        let strict_user = format!("{user}\n\n{STRICT_SCHEMA_HINT}");
        let raw = self.call(system, &strict_user, png, ctx).await?;
        let listings = self.parse(&raw, ctx)?;
        Ok(PageExtraction {
            listings,
            raw_response: raw,
            calls: 2,
        })
    }

    fn parse(
        &self,
        raw: &str,
        ctx: &PageContext<'_>,
    ) -> Result<Vec<CandidateListing>, ExtractionError> {
        parse_listings(raw, ctx.page_index, ctx.observed_on, &self.config)
    }

    async fn call(
        &self,
        system: &str,
        user: &str,
        png: &[u8],
        ctx: &PageContext<'_>,
    ) -> Result<String, ExtractionError> {
        if let Some(limiter) = ctx.limiter {
            limiter.acquire().await;
        }
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.model.complete(system, user, png)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Transient {
                detail: format!("model call timed out after {}s", timeout.as_secs()),
            }),
        }
    }
}
