//! Progress-callback trait for job and page events.
//!
//! Pass an [`Arc<dyn JobProgressCallback>`] to
//! [`crate::runner::JobRunner::with_progress`] to receive events as a job
//! moves through its stages. The callback is the least invasive hook: a host
//! can forward events to a progress bar, a broadcast channel or a metrics
//! sink without the library knowing which.
//!
//! # Example
//!
//! ```rust
//! use flyer_ingest::JobProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use uuid::Uuid;
//!
//! struct CountingCallback {
//!     listings: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, _job: Uuid, page: usize, total: usize, listings: usize) {
//!         self.listings.fetch_add(listings, Ordering::SeqCst);
//!         eprintln!("page {}/{}: {} listings", page + 1, total, listings);
//!     }
//! }
//! ```

use crate::job::JobState;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the job runner as it processes a flyer.
///
/// All methods default to no-ops. Page events for one job may arrive
/// concurrently from different tasks, so implementations must synchronise
/// their own state. Page indices are 0-based.
pub trait JobProgressCallback: Send + Sync {
    /// Called once the flyer has been rendered and its page count is known.
    fn on_job_start(&self, job_id: Uuid, total_pages: usize) {
        let _ = (job_id, total_pages);
    }

    /// Called before the first extraction attempt for a page.
    fn on_page_start(&self, job_id: Uuid, page_index: usize, total_pages: usize) {
        let _ = (job_id, page_index, total_pages);
    }

    fn on_page_complete(&self, job_id: Uuid, page_index: usize, total_pages: usize, listings: usize) {
        let _ = (job_id, page_index, total_pages, listings);
    }

    /// Called when a page is given up.
    fn on_page_error(&self, job_id: Uuid, page_index: usize, total_pages: usize, error: &str) {
        let _ = (job_id, page_index, total_pages, error);
    }

    /// Called when a run ends, whatever the outcome. `state` is the state the
    /// job was left in.
    fn on_job_finish(&self, job_id: Uuid, state: JobState) {
        let _ = (job_id, state);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn JobProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        finished: Mutex<Option<JobState>>,
    }

    impl JobProgressCallback for TrackingCallback {
        fn on_page_start(&self, _job: Uuid, _page: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _job: Uuid, _page: usize, _total: usize, _listings: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _job: Uuid, _page: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_finish(&self, _job: Uuid, state: JobState) {
            *self.finished.lock().unwrap() = Some(state);
        }
    }

    #[test]
    fn noop_callback_accepts_everything() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        let job = Uuid::nil();
        cb.on_job_start(job, 3);
        cb.on_page_start(job, 0, 3);
        cb.on_page_complete(job, 0, 3, 12);
        cb.on_page_error(job, 1, 3, "timeout");
        cb.on_job_finish(job, JobState::Completed);
    }

    #[test]
    fn tracking_callback_counts() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        let job = Uuid::nil();
        cb.on_page_start(job, 0, 2);
        cb.on_page_start(job, 1, 2);
        cb.on_page_complete(job, 0, 2, 5);
        cb.on_page_error(job, 1, 2, "invalid");
        cb.on_job_finish(job, JobState::Completed);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.finished.lock().unwrap(), Some(JobState::Completed));
    }
}
