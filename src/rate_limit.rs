//! Per-store request pacing and quota cool-downs.
//!
//! Every model call and flyer download made for a store first waits on that
//! store's governor via `until_ready()`, which spaces requests at the
//! configured rate across all of the store's concurrent jobs. When a store
//! answers with a quota error anyway, the scheduler records a cool-down in
//! the [`CooldownBook`] and stops leasing that store's jobs until it ends.

use crate::model::StoreId;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request pacing for one store.
pub struct StoreRateLimiter {
    limiter: DirectLimiter,
    per_minute: u32,
}

impl StoreRateLimiter {
    /// Allow `n` requests per minute, with no burst beyond one request.
    pub fn per_minute(n: u32) -> Self {
        let n = NonZeroU32::new(n.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: DirectLimiter::direct(Quota::per_minute(n).allow_burst(NonZeroU32::MIN)),
            per_minute: n.get(),
        }
    }

    /// Wait until the store may be called again.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.per_minute
    }
}

impl std::fmt::Debug for StoreRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}

/// Lazily created limiters, one per store.
#[derive(Debug)]
pub struct StoreLimiters {
    per_minute: u32,
    limiters: Mutex<HashMap<StoreId, Arc<StoreRateLimiter>>>,
}

impl StoreLimiters {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// The limiter for `store`, created on first use.
    pub fn get(&self, store: &StoreId) -> Arc<StoreRateLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        limiters
            .entry(store.clone())
            .or_insert_with(|| Arc::new(StoreRateLimiter::per_minute(self.per_minute)))
            .clone()
    }
}

/// Stores that must not be called until a given instant.
#[derive(Debug, Default, Clone)]
pub struct CooldownBook {
    until: HashMap<StoreId, DateTime<Utc>>,
}

impl CooldownBook {
    /// Suspend `store` until `until`. An existing longer cool-down is kept.
    pub fn suspend(&mut self, store: &StoreId, until: DateTime<Utc>) {
        let entry = self.until.entry(store.clone()).or_insert(until);
        if until > *entry {
            *entry = until;
        }
        info!(store = %store, until = %entry, "Store cooling down");
    }

    pub fn is_suspended(&self, store: &StoreId, now: DateTime<Utc>) -> bool {
        self.until.get(store).is_some_and(|t| *t > now)
    }

    /// Stores still cooling down at `now`. Expired entries are dropped.
    pub fn suspended(&mut self, now: DateTime<Utc>) -> Vec<StoreId> {
        self.until.retain(|_, t| *t > now);
        self.until.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cooldown_expires() {
        let now = Utc::now();
        let a = StoreId::from("a");
        let mut book = CooldownBook::default();
        book.suspend(&a, now + Duration::minutes(15));
        assert!(book.is_suspended(&a, now));
        assert_eq!(book.suspended(now), vec![a.clone()]);
        assert!(book.suspended(now + Duration::minutes(16)).is_empty());
        assert!(!book.is_suspended(&a, now + Duration::minutes(16)));
    }

    #[test]
    fn shorter_cooldown_does_not_shrink_longer_one() {
        let now = Utc::now();
        let a = StoreId::from("a");
        let mut book = CooldownBook::default();
        book.suspend(&a, now + Duration::minutes(30));
        book.suspend(&a, now + Duration::minutes(5));
        assert!(book.is_suspended(&a, now + Duration::minutes(10)));
    }

    #[test]
    fn limiters_are_shared_per_store() {
        let limiters = StoreLimiters::new(60);
        let a1 = limiters.get(&StoreId::from("a"));
        let a2 = limiters.get(&StoreId::from("a"));
        let b = limiters.get(&StoreId::from("b"));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(b.requests_per_minute(), 60);
    }

    #[tokio::test]
    async fn first_request_is_immediate() {
        let limiter = StoreRateLimiter::per_minute(1);
        tokio::time::timeout(std::time::Duration::from_millis(200), limiter.acquire())
            .await
            .expect("first permit should be available");
    }
}
