//! Interfaces to the external collaborators the pipeline depends on.
//!
//! The pipeline never chooses a persistence technology. It talks to three
//! traits:
//!
//! * [`BlobStore`]: raw PDF and page-image bytes.
//! * [`CatalogStore`]: jobs, flyer fingerprints, masters, products, prices.
//! * [`JobQueue`]: lease-based dequeue with visibility timeouts.
//!
//! Every write that can be replayed by an at-least-once worker goes through an
//! insert-if-absent call returning [`Inserted`], so a duplicate is an ordinary
//! value rather than an error. [`memory`] holds in-process implementations.

pub mod memory;

use crate::error::{BlobError, CatalogError, QueueError};
use crate::job::{ExtractionJob, JobState};
use crate::model::{
    BlobRef, FlyerRecord, MasterCandidate, PricePoint, Product, ProductMaster, StoreId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted<T> {
    /// The row was written.
    New(T),
    /// A row with the same unique key already existed; it is returned as-is.
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn into_inner(self) -> T {
        match self {
            Inserted::New(v) | Inserted::Existing(v) => v,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Inserted::New(_))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, BlobError>;
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError>;
    async fn exists(&self, blob: &BlobRef) -> Result<bool, BlobError>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Insert `job` unless a non-terminal job already exists for the same
    /// (store, flyer identity); in that case the existing job is returned.
    async fn insert_job_if_absent(
        &self,
        job: ExtractionJob,
    ) -> Result<Inserted<ExtractionJob>, CatalogError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ExtractionJob>, CatalogError>;

    /// Persist `job` if its `version` matches the stored one. Returns the
    /// stored copy with the bumped version, or `StaleVersion`.
    async fn update_job(&self, job: &ExtractionJob) -> Result<ExtractionJob, CatalogError>;

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<ExtractionJob>, CatalogError>;

    // ── Flyers ───────────────────────────────────────────────────────────

    async fn flyer(
        &self,
        store: &StoreId,
        flyer_identity: &str,
    ) -> Result<Option<FlyerRecord>, CatalogError>;

    async fn record_flyer(&self, record: FlyerRecord) -> Result<(), CatalogError>;

    // ── Masters ──────────────────────────────────────────────────────────

    /// Masters plausibly similar to `normalized_name`, with their product
    /// reference counts. Final scoring is done by the matching engine.
    async fn candidate_masters(
        &self,
        normalized_name: &str,
        limit: usize,
    ) -> Result<Vec<MasterCandidate>, CatalogError>;

    /// Insert unless a master with the same normalized name exists.
    async fn insert_master_if_absent(
        &self,
        master: ProductMaster,
    ) -> Result<Inserted<ProductMaster>, CatalogError>;

    async fn get_master(&self, id: Uuid) -> Result<Option<ProductMaster>, CatalogError>;

    // ── Products ─────────────────────────────────────────────────────────

    /// Insert unless a product exists for the same (job, page, listing).
    async fn insert_product_if_absent(
        &self,
        product: Product,
    ) -> Result<Inserted<Product>, CatalogError>;

    async fn products_for_job(&self, job_id: Uuid) -> Result<Vec<Product>, CatalogError>;

    // ── Price history ────────────────────────────────────────────────────

    async fn latest_price(
        &self,
        master_id: Uuid,
        store: &StoreId,
    ) -> Result<Option<PricePoint>, CatalogError>;

    /// Insert unless a row exists for the same (master, store, date).
    async fn insert_price_if_absent(
        &self,
        point: PricePoint,
    ) -> Result<Inserted<PricePoint>, CatalogError>;
}

/// A time-bounded claim on a queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: Uuid,
    pub store_id: StoreId,
    /// Distinguishes this lease from later leases of the same job.
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Times this job has been leased, this lease included.
    pub deliveries: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job, leasable from `eligible_at`. Re-enqueuing a queued job
    /// only moves its eligibility.
    async fn enqueue(
        &self,
        job_id: Uuid,
        store: &StoreId,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Lease the oldest eligible job whose store is not in `blocked`.
    /// Jobs whose lease expired before `now` are eligible again.
    async fn lease(
        &self,
        now: DateTime<Utc>,
        visibility: Duration,
        blocked: &[StoreId],
    ) -> Result<Option<Lease>, QueueError>;

    /// Push the lease deadline out by `visibility` from `now`.
    async fn heartbeat(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Lease, QueueError>;

    /// Remove the job from the queue.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Return the job to the queue, leasable again from `eligible_at`.
    async fn release(&self, lease: &Lease, eligible_at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Move the job to the dead-letter set.
    async fn fail(&self, lease: &Lease, reason: &str) -> Result<(), QueueError>;

    /// Jobs queued or leased. Dead letters are not counted.
    async fn pending(&self) -> Result<usize, QueueError>;
}
