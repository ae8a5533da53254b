//! Matching engine: candidate listings → product masters, products and
//! price history.
//!
//! For each candidate the engine normalises the name, asks the catalog for
//! plausible masters, scores them with the lexical and (optional) semantic
//! signals and then either
//!
//! * links to the best master (`score ≥ accept`),
//! * links but flags for review (`review ≤ score < accept`), or
//! * creates a new master (`score < review`).
//!
//! Ties on score go to the master referenced by more products, then to the
//! lowest master ID, so the same inputs always resolve the same way.
//!
//! Every write is insert-if-absent on a natural key, which makes re-applying
//! a job's candidates after a crash or a duplicate delivery a no-op.

pub mod normalize;
pub mod similarity;

use crate::config::MatchingConfig;
use crate::error::CatalogError;
use crate::model::{
    CandidateListing, MatchSummary, PricePoint, Product, ProductMaster, RejectReason, Resolution,
    StoreId, StoreLocale,
};
use crate::store::{CatalogStore, Inserted};
use chrono::{NaiveDate, Utc};
use normalize::normalize_name;
use rust_decimal::Decimal;
use similarity::{combined_score, cosine_similarity, trigram_similarity, EmbeddingSignal};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Scores closer than this are treated as equal for tie-breaking.
const SCORE_EPSILON: f64 = 1e-9;

/// Where and when a batch of candidates was observed.
#[derive(Debug, Clone)]
pub struct MatchContext<'a> {
    pub store_id: &'a StoreId,
    pub locale: &'a StoreLocale,
    pub job_id: Uuid,
    /// Date recorded on price history rows.
    pub observed_on: NaiveDate,
}

/// What [`MatchingEngine::record`] wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub product_written: bool,
    pub price_written: bool,
}

#[derive(Debug, Clone)]
struct Scored {
    master_id: Uuid,
    score: f64,
    product_count: u64,
}

fn rank(a: &Scored, b: &Scored) -> Ordering {
    if (a.score - b.score).abs() > SCORE_EPSILON {
        return a.score.total_cmp(&b.score);
    }
    a.product_count
        .cmp(&b.product_count)
        .then_with(|| b.master_id.cmp(&a.master_id))
}

pub struct MatchingEngine {
    catalog: Arc<dyn CatalogStore>,
    embeddings: Option<Arc<dyn EmbeddingSignal>>,
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(catalog: Arc<dyn CatalogStore>, config: MatchingConfig) -> Self {
        Self {
            catalog,
            embeddings: None,
            config,
        }
    }

    /// Enable the semantic signal.
    pub fn with_embeddings(mut self, embeddings: Arc<dyn EmbeddingSignal>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    /// Decide which master `candidate` belongs to, creating one if needed.
    pub async fn resolve(
        &self,
        candidate: &CandidateListing,
        ctx: &MatchContext<'_>,
    ) -> Result<Resolution, CatalogError> {
        if candidate.price <= Decimal::ZERO {
            return Ok(Resolution::Rejected {
                reason: RejectReason::NonPositivePrice,
            });
        }
        if let (Some(from), Some(to)) = (candidate.valid_from, candidate.valid_to) {
            if from > to {
                return Ok(Resolution::Rejected {
                    reason: RejectReason::InvertedValidity,
                });
            }
        }
        let normalized = normalize_name(&candidate.name, &ctx.locale.boilerplate);
        if normalized.chars().count() < self.config.min_name_chars {
            return Ok(Resolution::Rejected {
                reason: RejectReason::EmptyName,
            });
        }

        let masters = self
            .catalog
            .candidate_masters(&normalized, self.config.candidate_limit)
            .await?;

        let wants_semantic = masters.iter().any(|m| m.master.embedding.is_some());
        let query_embedding = if wants_semantic {
            self.embed(&candidate.name).await
        } else {
            None
        };

        let best = masters
            .iter()
            .map(|m| {
                let lexical = trigram_similarity(&normalized, &m.master.normalized_name);
                let semantic = match (&query_embedding, &m.master.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => None,
                };
                Scored {
                    master_id: m.master.id,
                    score: combined_score(lexical, semantic, &self.config),
                    product_count: m.product_count,
                }
            })
            .max_by(rank);

        if let Some(best) = best {
            debug!(
                name = %candidate.name,
                master = %best.master_id,
                score = best.score,
                "Best master candidate"
            );
            if best.score >= self.config.accept_threshold {
                return Ok(Resolution::MatchedExisting {
                    master_id: best.master_id,
                    score: best.score,
                    low_confidence: false,
                });
            }
            if best.score >= self.config.review_threshold {
                return Ok(Resolution::MatchedExisting {
                    master_id: best.master_id,
                    score: best.score,
                    low_confidence: true,
                });
            }
        }

        let embedding = match query_embedding {
            Some(e) => Some(e),
            None => self.embed(&candidate.name).await,
        };
        let master = ProductMaster {
            id: Uuid::now_v7(),
            name: candidate.name.trim().to_string(),
            normalized_name: normalized,
            tags: BTreeSet::new(),
            embedding,
            created_at: Utc::now(),
        };
        match self.catalog.insert_master_if_absent(master).await? {
            Inserted::New(m) => Ok(Resolution::CreatedNew { master_id: m.id }),
            // Another worker created it between our lookup and insert.
            Inserted::Existing(m) => Ok(Resolution::MatchedExisting {
                master_id: m.id,
                score: 1.0,
                low_confidence: false,
            }),
        }
    }

    /// Write the product row and, if the price moved, a price history row.
    pub async fn record(
        &self,
        candidate: &CandidateListing,
        resolution: &Resolution,
        ctx: &MatchContext<'_>,
    ) -> Result<RecordOutcome, CatalogError> {
        let (master_id, match_score, low_confidence) = match resolution {
            Resolution::MatchedExisting {
                master_id,
                score,
                low_confidence,
            } => (*master_id, Some(*score), *low_confidence),
            Resolution::CreatedNew { master_id } => (*master_id, None, false),
            Resolution::Rejected { .. } => return Ok(RecordOutcome::default()),
        };

        let product = Product {
            id: Uuid::now_v7(),
            master_id,
            store_id: ctx.store_id.clone(),
            job_id: ctx.job_id,
            page_index: candidate.page_index,
            listing_index: candidate.listing_index,
            name: candidate.name.clone(),
            price: candidate.price,
            unit: candidate.unit.clone(),
            valid_from: candidate.valid_from,
            valid_to: candidate.valid_to,
            match_score,
            low_confidence,
            created_at: Utc::now(),
        };
        let inserted = self.catalog.insert_product_if_absent(product).await?;
        if !inserted.is_new() {
            debug!(
                job = %ctx.job_id,
                page = candidate.page_index,
                listing = candidate.listing_index,
                "Product already recorded"
            );
        }

        let price_written = self
            .record_price(master_id, ctx.store_id, candidate.price, ctx.observed_on, ctx.job_id)
            .await?;

        Ok(RecordOutcome {
            product_written: inserted.is_new(),
            price_written,
        })
    }

    /// Append a price history row unless `price` equals the latest recorded
    /// price for (master, store). Returns whether a row was written.
    pub async fn record_price(
        &self,
        master_id: Uuid,
        store_id: &StoreId,
        price: Decimal,
        observed_on: NaiveDate,
        job_id: Uuid,
    ) -> Result<bool, CatalogError> {
        let latest = self.catalog.latest_price(master_id, store_id).await?;
        if latest.as_ref().is_some_and(|p| p.price == price) {
            return Ok(false);
        }

        let point = PricePoint {
            master_id,
            store_id: store_id.clone(),
            observed_on,
            price,
            job_id,
        };
        match self.catalog.insert_price_if_absent(point).await? {
            Inserted::New(_) => Ok(true),
            Inserted::Existing(existing) => {
                // Same (master, store, date) already holds a price. The first
                // observation of the day wins.
                if existing.price != price {
                    warn!(
                        master = %master_id,
                        store = %store_id,
                        date = %observed_on,
                        kept = %existing.price,
                        ignored = %price,
                        "Conflicting same-day price ignored"
                    );
                }
                Ok(false)
            }
        }
    }

    /// Resolve and record a batch of candidates in order.
    #[instrument(skip_all, fields(job = %ctx.job_id, store = %ctx.store_id, candidates = candidates.len()))]
    pub async fn apply(
        &self,
        candidates: &[CandidateListing],
        ctx: &MatchContext<'_>,
    ) -> Result<MatchSummary, CatalogError> {
        let mut summary = MatchSummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let resolution = self.resolve(candidate, ctx).await?;
            match &resolution {
                Resolution::MatchedExisting { low_confidence, .. } => {
                    summary.matched += 1;
                    if *low_confidence {
                        summary.low_confidence += 1;
                    }
                }
                Resolution::CreatedNew { .. } => summary.created += 1,
                Resolution::Rejected { reason } => {
                    debug!(name = %candidate.name, "Candidate rejected: {}", reason);
                    summary.rejected += 1;
                }
            }

            let outcome = self.record(candidate, &resolution, ctx).await?;
            if outcome.product_written {
                summary.products_written += 1;
            }
            if outcome.price_written {
                summary.price_points_written += 1;
            }
        }

        Ok(summary)
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let signal = self.embeddings.as_ref()?;
        match signal.embed(text).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                warn!("Embedding failed, falling back to lexical matching: {}", e);
                None
            }
        }
    }
}
