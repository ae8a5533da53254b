//! Store sources: where flyers come from.
//!
//! Every store has its own quirks (where flyers are listed, how they are
//! served, which words clutter product names). Each one is a
//! [`StoreSource`] implementation, and the [`SourceRegistry`] picks the right
//! one by [`StoreId`]. [`HttpFlyerSource`] covers the common case of a store
//! publishing flyers at known URLs.

use crate::error::SourceError;
use crate::model::{SourceRef, StoreId, StoreLocale};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Capability interface for one store.
#[async_trait]
pub trait StoreSource: Send + Sync {
    fn store_id(&self) -> &StoreId;

    /// Flyers currently published by the store.
    async fn discover(&self) -> Result<Vec<SourceRef>, SourceError>;

    /// Raw PDF bytes of one flyer.
    async fn download(&self, flyer: &SourceRef) -> Result<Vec<u8>, SourceError>;

    /// Locale, currency and name-cleaning hints for this store.
    fn localize(&self) -> &StoreLocale;
}

/// Store sources keyed by store ID.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<StoreId, Arc<dyn StoreSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn StoreSource>) {
        let id = source.store_id().clone();
        debug!(store = %id, "Registered store source");
        self.sources.insert(id, source);
    }

    pub fn with(mut self, source: Arc<dyn StoreSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, store: &StoreId) -> Option<&Arc<dyn StoreSource>> {
        self.sources.get(store)
    }

    pub fn stores(&self) -> impl Iterator<Item = &StoreId> {
        self.sources.keys()
    }
}

/// A store whose flyers live at a fixed list of URLs.
pub struct HttpFlyerSource {
    store_id: StoreId,
    locale: StoreLocale,
    /// (flyer identity, URL) pairs.
    flyers: Vec<(String, String)>,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpFlyerSource {
    pub fn new(store_id: impl Into<StoreId>, locale: StoreLocale, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            store_id: store_id.into(),
            locale,
            flyers: Vec::new(),
            client,
            timeout_secs,
        }
    }

    pub fn with_flyer(mut self, identity: impl Into<String>, url: impl Into<String>) -> Self {
        self.flyers.push((identity.into(), url.into()));
        self
    }
}

#[async_trait]
impl StoreSource for HttpFlyerSource {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    async fn discover(&self) -> Result<Vec<SourceRef>, SourceError> {
        Ok(self
            .flyers
            .iter()
            .map(|(identity, url)| SourceRef::new(self.store_id.clone(), identity.clone(), url.clone()))
            .collect())
    }

    async fn download(&self, flyer: &SourceRef) -> Result<Vec<u8>, SourceError> {
        download_pdf(&self.client, &flyer.url, self.timeout_secs).await
    }

    fn localize(&self) -> &StoreLocale {
        &self.locale
    }
}

/// Download a flyer and verify it starts with the PDF magic bytes.
pub async fn download_pdf(
    client: &reqwest::Client,
    url: &str,
    timeout_secs: u64,
) -> Result<Vec<u8>, SourceError> {
    info!("Downloading flyer from: {}", url);

    let response = client.get(url).send().await.map_err(|e| {
        let detail = if e.is_timeout() {
            format!("timed out after {timeout_secs}s")
        } else {
            e.to_string()
        };
        SourceError::Transient {
            url: url.to_string(),
            detail,
        }
    })?;

    let status = response.status().as_u16();
    if status == 429 {
        return Err(SourceError::Quota {
            url: url.to_string(),
            retry_after_secs: retry_after(&response),
        });
    }
    classify_status(url, status)?;

    let bytes = response.bytes().await.map_err(|e| SourceError::Transient {
        url: url.to_string(),
        detail: e.to_string(),
    })?;

    check_pdf_magic(url, &bytes)?;
    debug!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
}

fn retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Map a non-429 HTTP status onto the error taxonomy.
fn classify_status(url: &str, status: u16) -> Result<(), SourceError> {
    match status {
        200..=299 => Ok(()),
        408 | 500..=599 => Err(SourceError::Transient {
            url: url.to_string(),
            detail: format!("HTTP {status}"),
        }),
        _ => Err(SourceError::Rejected {
            url: url.to_string(),
            status,
        }),
    }
}

fn check_pdf_magic(url: &str, bytes: &[u8]) -> Result<(), SourceError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(());
    }
    Err(SourceError::NotAPdf {
        url: url.to_string(),
        magic: bytes.iter().take(4).copied().collect(),
    })
}
