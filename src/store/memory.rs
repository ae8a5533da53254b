//! In-process implementations of the store interfaces.
//!
//! They honour the same uniqueness and lease rules a database-backed
//! implementation must: one non-terminal job per flyer slot, one product per
//! (job, page, listing), one price row per (master, store, date), versioned
//! job updates and token-checked leases. Used by the test-suite and by the
//! binary's local mode.

use super::{BlobStore, CatalogStore, Inserted, JobQueue, Lease};
use crate::error::{BlobError, CatalogError, QueueError};
use crate::job::{ExtractionJob, JobState};
use crate::matching::similarity::trigram_similarity;
use crate::model::{
    BlobRef, FlyerRecord, MasterCandidate, PricePoint, Product, ProductMaster, StoreId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const BLOB_SCHEME: &str = "mem://";

// ── Blobs ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn blobs(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, BlobError> {
        self.blobs.lock().map_err(|_| BlobError::Unavailable {
            detail: "blob map poisoned".into(),
        })
    }
}

fn blob_key(blob: &BlobRef) -> &str {
    blob.0.strip_prefix(BLOB_SCHEME).unwrap_or(&blob.0)
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, BlobError> {
        self.blobs()?.insert(key.to_string(), bytes);
        Ok(BlobRef(format!("{BLOB_SCHEME}{key}")))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let key = blob_key(blob);
        self.blobs()?
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool, BlobError> {
        Ok(self.blobs()?.contains_key(blob_key(blob)))
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct CatalogState {
    jobs: HashMap<Uuid, ExtractionJob>,
    flyers: HashMap<(StoreId, String), FlyerRecord>,
    masters: BTreeMap<Uuid, ProductMaster>,
    products: Vec<Product>,
    prices: Vec<PricePoint>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, CatalogState>, CatalogError> {
        self.state.lock().map_err(|_| CatalogError::Unavailable {
            detail: "catalog state poisoned".into(),
        })
    }

    /// Every product row, in insertion order.
    pub fn products(&self) -> Vec<Product> {
        self.state
            .lock()
            .map(|s| s.products.clone())
            .unwrap_or_default()
    }

    /// Every price row, in insertion order.
    pub fn price_history(&self) -> Vec<PricePoint> {
        self.state
            .lock()
            .map(|s| s.prices.clone())
            .unwrap_or_default()
    }

    pub fn masters(&self) -> Vec<ProductMaster> {
        self.state
            .lock()
            .map(|s| s.masters.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn jobs(&self) -> Vec<ExtractionJob> {
        self.state
            .lock()
            .map(|s| s.jobs.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn insert_job_if_absent(
        &self,
        job: ExtractionJob,
    ) -> Result<Inserted<ExtractionJob>, CatalogError> {
        let mut s = self.state()?;
        let existing = s.jobs.values().find(|j| {
            !j.is_terminal()
                && j.source.store_id == job.source.store_id
                && j.source.flyer_identity == job.source.flyer_identity
        });
        if let Some(existing) = existing {
            return Ok(Inserted::Existing(existing.clone()));
        }
        s.jobs.insert(job.id, job.clone());
        Ok(Inserted::New(job))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ExtractionJob>, CatalogError> {
        Ok(self.state()?.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &ExtractionJob) -> Result<ExtractionJob, CatalogError> {
        let mut s = self.state()?;
        let stored = s.jobs.get_mut(&job.id).ok_or_else(|| CatalogError::NotFound {
            entity: "job",
            key: job.id.to_string(),
        })?;
        if stored.version != job.version || stored.is_terminal() {
            return Err(CatalogError::StaleVersion {
                entity: "job",
                key: job.id.to_string(),
                expected: job.version,
            });
        }
        let mut next = job.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<ExtractionJob>, CatalogError> {
        let mut jobs: Vec<ExtractionJob> = self
            .state()?
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn flyer(
        &self,
        store: &StoreId,
        flyer_identity: &str,
    ) -> Result<Option<FlyerRecord>, CatalogError> {
        Ok(self
            .state()?
            .flyers
            .get(&(store.clone(), flyer_identity.to_string()))
            .cloned())
    }

    async fn record_flyer(&self, record: FlyerRecord) -> Result<(), CatalogError> {
        let key = (record.store_id.clone(), record.flyer_identity.clone());
        self.state()?.flyers.insert(key, record);
        Ok(())
    }

    async fn candidate_masters(
        &self,
        normalized_name: &str,
        limit: usize,
    ) -> Result<Vec<MasterCandidate>, CatalogError> {
        let s = self.state()?;
        let mut scored: Vec<(f64, MasterCandidate)> = s
            .masters
            .values()
            .filter_map(|m| {
                let sim = trigram_similarity(normalized_name, &m.normalized_name);
                // Masters with embeddings stay in play for the semantic signal.
                if sim <= 0.0 && m.embedding.is_none() {
                    return None;
                }
                let product_count =
                    s.products.iter().filter(|p| p.master_id == m.id).count() as u64;
                Some((
                    sim,
                    MasterCandidate {
                        master: m.clone(),
                        product_count,
                    },
                ))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.master.id.cmp(&b.1.master.id)));
        Ok(scored.into_iter().take(limit).map(|(_, c)| c).collect())
    }

    async fn insert_master_if_absent(
        &self,
        master: ProductMaster,
    ) -> Result<Inserted<ProductMaster>, CatalogError> {
        let mut s = self.state()?;
        if let Some(existing) = s
            .masters
            .values()
            .find(|m| m.normalized_name == master.normalized_name)
        {
            return Ok(Inserted::Existing(existing.clone()));
        }
        s.masters.insert(master.id, master.clone());
        Ok(Inserted::New(master))
    }

    async fn get_master(&self, id: Uuid) -> Result<Option<ProductMaster>, CatalogError> {
        Ok(self.state()?.masters.get(&id).cloned())
    }

    async fn insert_product_if_absent(
        &self,
        product: Product,
    ) -> Result<Inserted<Product>, CatalogError> {
        let mut s = self.state()?;
        if let Some(existing) = s.products.iter().find(|p| p.key() == product.key()) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        s.products.push(product.clone());
        Ok(Inserted::New(product))
    }

    async fn products_for_job(&self, job_id: Uuid) -> Result<Vec<Product>, CatalogError> {
        Ok(self
            .state()?
            .products
            .iter()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn latest_price(
        &self,
        master_id: Uuid,
        store: &StoreId,
    ) -> Result<Option<PricePoint>, CatalogError> {
        Ok(self
            .state()?
            .prices
            .iter()
            .filter(|p| p.master_id == master_id && &p.store_id == store)
            .max_by_key(|p| p.observed_on)
            .cloned())
    }

    async fn insert_price_if_absent(
        &self,
        point: PricePoint,
    ) -> Result<Inserted<PricePoint>, CatalogError> {
        let mut s = self.state()?;
        if let Some(existing) = s.prices.iter().find(|p| {
            p.master_id == point.master_id
                && p.store_id == point.store_id
                && p.observed_on == point.observed_on
        }) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        s.prices.push(point.clone());
        Ok(Inserted::New(point))
    }
}

// ── Queue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct QueueEntry {
    store_id: StoreId,
    eligible_at: DateTime<Utc>,
    lease: Option<(Uuid, DateTime<Utc>)>,
    deliveries: u32,
    seq: u64,
}

impl QueueEntry {
    fn leasable(&self, now: DateTime<Utc>) -> bool {
        match self.lease {
            None => self.eligible_at <= now,
            Some((_, expires_at)) => expires_at <= now,
        }
    }
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<Uuid, QueueEntry>,
    dead: HashMap<Uuid, String>,
    seq: u64,
}

#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Unavailable {
            detail: "queue state poisoned".into(),
        })
    }

    /// Jobs still queued or leased.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dead-lettered jobs and their reasons.
    pub fn dead_letters(&self) -> HashMap<Uuid, String> {
        self.state
            .lock()
            .map(|s| s.dead.clone())
            .unwrap_or_default()
    }
}

fn lease_lost(job_id: Uuid) -> QueueError {
    QueueError::LeaseLost { job_id }
}

fn held<'a>(
    state: &'a mut QueueState,
    lease: &Lease,
) -> Result<&'a mut QueueEntry, QueueError> {
    match state.entries.get_mut(&lease.job_id) {
        Some(entry) if entry.lease.map(|(token, _)| token) == Some(lease.token) => Ok(entry),
        _ => Err(lease_lost(lease.job_id)),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::hours(24))
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        store: &StoreId,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut s = self.state()?;
        s.seq += 1;
        let seq = s.seq;
        s.dead.remove(&job_id);
        s.entries
            .entry(job_id)
            .and_modify(|e| {
                if e.lease.is_none() {
                    e.eligible_at = eligible_at;
                }
            })
            .or_insert(QueueEntry {
                store_id: store.clone(),
                eligible_at,
                lease: None,
                deliveries: 0,
                seq,
            });
        Ok(())
    }

    async fn lease(
        &self,
        now: DateTime<Utc>,
        visibility: Duration,
        blocked: &[StoreId],
    ) -> Result<Option<Lease>, QueueError> {
        let mut s = self.state()?;
        let next = s
            .entries
            .iter()
            .filter(|(_, e)| e.leasable(now) && !blocked.contains(&e.store_id))
            .min_by_key(|(_, e)| (e.eligible_at, e.seq))
            .map(|(id, _)| *id);
        let Some(job_id) = next else {
            return Ok(None);
        };
        let entry = s.entries.get_mut(&job_id).ok_or_else(|| lease_lost(job_id))?;
        let token = Uuid::new_v4();
        let expires_at = now + to_chrono(visibility);
        entry.lease = Some((token, expires_at));
        entry.deliveries += 1;
        Ok(Some(Lease {
            job_id,
            store_id: entry.store_id.clone(),
            token,
            expires_at,
            deliveries: entry.deliveries,
        }))
    }

    async fn heartbeat(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Lease, QueueError> {
        let mut s = self.state()?;
        let entry = held(&mut s, lease)?;
        let expires_at = now + to_chrono(visibility);
        entry.lease = Some((lease.token, expires_at));
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut s = self.state()?;
        held(&mut s, lease)?;
        s.entries.remove(&lease.job_id);
        Ok(())
    }

    async fn release(&self, lease: &Lease, eligible_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut s = self.state()?;
        let entry = held(&mut s, lease)?;
        entry.lease = None;
        entry.eligible_at = eligible_at;
        Ok(())
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<(), QueueError> {
        let mut s = self.state()?;
        held(&mut s, lease)?;
        s.entries.remove(&lease.job_id);
        s.dead.insert(lease.job_id, reason.to_string());
        Ok(())
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.state()?.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceRef;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn source(identity: &str) -> SourceRef {
        SourceRef::new("store-a", identity, "https://a.example/f.pdf")
    }

    #[tokio::test]
    async fn one_open_job_per_flyer_slot() {
        let catalog = MemoryCatalog::new();
        let now = Utc::now();
        let first = catalog
            .insert_job_if_absent(ExtractionJob::new(source("w1"), now))
            .await
            .unwrap();
        assert!(first.is_new());
        let second = catalog
            .insert_job_if_absent(ExtractionJob::new(source("w1"), now))
            .await
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(second.into_inner().id, first.into_inner().id);

        let other = catalog
            .insert_job_if_absent(ExtractionJob::new(source("w2"), now))
            .await
            .unwrap();
        assert!(other.is_new());
    }

    #[tokio::test]
    async fn stale_job_update_is_rejected() {
        let catalog = MemoryCatalog::new();
        let job = catalog
            .insert_job_if_absent(ExtractionJob::new(source("w1"), Utc::now()))
            .await
            .unwrap()
            .into_inner();
        let updated = catalog.update_job(&job).await.unwrap();
        assert_eq!(updated.version, 1);
        let err = catalog.update_job(&job).await.unwrap_err();
        assert!(matches!(err, CatalogError::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn price_rows_unique_per_day() {
        let catalog = MemoryCatalog::new();
        let master_id = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let point = |cents| PricePoint {
            master_id,
            store_id: StoreId::from("store-a"),
            observed_on: day,
            price: Decimal::new(cents, 2),
            job_id: Uuid::new_v4(),
        };
        assert!(catalog.insert_price_if_absent(point(119)).await.unwrap().is_new());
        assert!(!catalog.insert_price_if_absent(point(129)).await.unwrap().is_new());
        assert_eq!(catalog.price_history().len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_re_leasable() {
        let queue = MemoryJobQueue::new();
        let job_id = Uuid::new_v4();
        let store = StoreId::from("store-a");
        let t0 = Utc::now();
        queue.enqueue(job_id, &store, t0).await.unwrap();

        let vis = Duration::from_secs(60);
        let first = queue.lease(t0, vis, &[]).await.unwrap().expect("leasable");
        assert!(queue.lease(t0, vis, &[]).await.unwrap().is_none());

        let later = t0 + chrono::Duration::seconds(61);
        let second = queue.lease(later, vis, &[]).await.unwrap().expect("re-leasable");
        assert_eq!(second.job_id, job_id);
        assert_eq!(second.deliveries, 2);

        // The crashed worker's lease is gone.
        assert!(matches!(
            queue.ack(&first).await,
            Err(QueueError::LeaseLost { .. })
        ));
        queue.ack(&second).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn blocked_stores_are_skipped() {
        let queue = MemoryJobQueue::new();
        let t0 = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(a, &StoreId::from("a"), t0).await.unwrap();
        queue.enqueue(b, &StoreId::from("b"), t0).await.unwrap();

        let lease = queue
            .lease(t0, Duration::from_secs(30), &[StoreId::from("a")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.job_id, b);
    }

    #[tokio::test]
    async fn release_delays_and_fail_dead_letters() {
        let queue = MemoryJobQueue::new();
        let t0 = Utc::now();
        let id = Uuid::new_v4();
        queue.enqueue(id, &StoreId::from("a"), t0).await.unwrap();
        let vis = Duration::from_secs(30);

        let lease = queue.lease(t0, vis, &[]).await.unwrap().unwrap();
        let later = t0 + chrono::Duration::seconds(10);
        queue.release(&lease, later).await.unwrap();
        assert!(queue.lease(t0, vis, &[]).await.unwrap().is_none());

        let lease = queue.lease(later, vis, &[]).await.unwrap().unwrap();
        queue.fail(&lease, "attempts exhausted").await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(
            queue.dead_letters().get(&id).map(String::as_str),
            Some("attempts exhausted")
        );
    }
}
