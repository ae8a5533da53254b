//! Catalog entities and the values that flow between pipeline stages.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Store identifier, e.g. `"maxima"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque reference returned by the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a flyer comes from.
///
/// `flyer_identity` names the flyer slot (e.g. `"2024-W01"`) independently of
/// its content; the same slot may be re-published with new bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub store_id: StoreId,
    pub flyer_identity: String,
    pub url: String,
}

impl SourceRef {
    pub fn new(
        store_id: impl Into<StoreId>,
        flyer_identity: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            flyer_identity: flyer_identity.into(),
            url: url.into(),
        }
    }

    /// Key of the flyer slot: `store/identity`.
    pub fn slot_key(&self) -> String {
        format!("{}/{}", self.store_id, self.flyer_identity)
    }
}

/// Store-specific hints passed to the model and the name normaliser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocale {
    /// BCP 47 tag, e.g. `"lt-LT"`.
    pub locale: String,
    /// ISO 4217 code, e.g. `"EUR"`.
    pub currency: String,
    /// Categories the store uses; offered to the model as hints.
    pub categories: Vec<String>,
    /// Phrases stripped from product names before matching
    /// (e.g. `"akcija"`, `"tik šiandien"`).
    pub boilerplate: Vec<String>,
}

impl Default for StoreLocale {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            currency: "USD".to_string(),
            categories: Vec::new(),
            boilerplate: Vec::new(),
        }
    }
}

/// One raw item extracted from a page image, before catalog matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateListing {
    pub name: String,
    /// Price in the store currency.
    pub price: Decimal,
    /// Unit or quantity text as printed, e.g. `"1 L"`, `"500 g"`.
    pub unit: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub page_index: usize,
    /// Position within the page, stable across retries of the same page.
    pub listing_index: usize,
    /// Model-reported confidence in `[0, 1]`, if any.
    pub confidence: Option<f32>,
}

/// Canonical, deduplicated product identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMaster {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub tags: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A master as returned from a catalog candidate search.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterCandidate {
    pub master: ProductMaster,
    /// Products already referencing this master.
    pub product_count: u64,
}

/// Store- and flyer-specific instance of a [`ProductMaster`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub master_id: Uuid,
    pub store_id: StoreId,
    pub job_id: Uuid,
    pub page_index: usize,
    pub listing_index: usize,
    pub name: String,
    pub price: Decimal,
    pub unit: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub match_score: Option<f64>,
    /// Accepted between the review and accept thresholds.
    pub low_confidence: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// Uniqueness key: one product per listing per job.
    pub fn key(&self) -> (Uuid, usize, usize) {
        (self.job_id, self.page_index, self.listing_index)
    }
}

/// One observed price for a master at a store on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub master_id: Uuid,
    pub store_id: StoreId,
    pub observed_on: NaiveDate,
    pub price: Decimal,
    pub job_id: Uuid,
}

/// Last successfully processed content of a flyer slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlyerRecord {
    pub store_id: StoreId,
    pub flyer_identity: String,
    pub fingerprint: String,
    pub job_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

/// Outcome of matching one candidate listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// Resolved to an existing master. `low_confidence` is set when the score
    /// fell between the review and accept thresholds.
    MatchedExisting {
        master_id: Uuid,
        score: f64,
        low_confidence: bool,
    },
    /// No master was close enough; a new one was created.
    CreatedNew { master_id: Uuid },
    /// The listing was unusable.
    Rejected { reason: RejectReason },
}

impl Resolution {
    pub fn master_id(&self) -> Option<Uuid> {
        match self {
            Resolution::MatchedExisting { master_id, .. } | Resolution::CreatedNew { master_id } => {
                Some(*master_id)
            }
            Resolution::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Nothing left after normalisation.
    EmptyName,
    NonPositivePrice,
    /// Validity window ends before it starts.
    InvertedValidity,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::EmptyName => "empty product name",
            RejectReason::NonPositivePrice => "price is not positive",
            RejectReason::InvertedValidity => "validity window ends before it starts",
        };
        f.write_str(s)
    }
}

/// Counts reported after a job run finishes matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub candidates: usize,
    pub matched: usize,
    pub low_confidence: usize,
    pub created: usize,
    pub rejected: usize,
    pub products_written: usize,
    pub price_points_written: usize,
}
