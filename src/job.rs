//! Extraction job lifecycle.
//!
//! ```text
//! Discovered ─▶ Rendering ─▶ Extracting ─▶ Aggregating ─▶ Matching ─▶ Completed
//!     ▲            │  │           │              │             │
//!     │            │  └───────────┴──────┬───────┴─────────────┘
//!     │            │ (unchanged          ▼
//!     │            │  fingerprint)   Retrying ──(attempts exhausted)──▶ Failed
//!     └────────────┼──(backoff elapsed)──┘
//!                  └──────────────────────────────────▶ Completed
//! ```
//!
//! `Failed` is reachable from every non-terminal state. Retry state is kept
//! on the job itself (`attempts`, `next_eligible_at`) so a restarted process
//! resumes exactly where the last one stopped.

use crate::config::RetryPolicy;
use crate::error::{ErrorClass, IngestError, PageError};
use crate::model::{BlobRef, CandidateListing, SourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Discovered,
    Rendering,
    Extracting,
    Aggregating,
    Matching,
    Completed,
    Retrying,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Retrying, Discovered) => true,
            (Retrying, _) => false,
            (_, Retrying) => true,
            (Discovered, Rendering) => true,
            (Rendering, Extracting) => true,
            // unchanged fingerprint short-circuit
            (Rendering, Completed) => true,
            (Extracting, Aggregating) => true,
            (Aggregating, Matching) => true,
            (Matching, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Rendering => "rendering",
            JobState::Extracting => "extracting",
            JobState::Aggregating => "aggregating",
            JobState::Matching => "matching",
            JobState::Completed => "completed",
            JobState::Retrying => "retrying",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Extraction outcome for one rendered page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index.
    pub page_index: usize,
    pub image_ref: Option<BlobRef>,
    pub status: PageStatus,
    pub listings: Vec<CandidateListing>,
    /// Raw model output of the last attempt, kept for auditing.
    pub raw_response: Option<String>,
    /// Extraction attempts made for this page.
    pub attempts: u32,
    pub error: Option<PageError>,
}

impl PageResult {
    pub fn pending(page_index: usize) -> Self {
        Self {
            page_index,
            image_ref: None,
            status: PageStatus::Pending,
            listings: Vec::new(),
            raw_response: None,
            attempts: 0,
            error: None,
        }
    }

    pub fn failed(page_index: usize, error: PageError) -> Self {
        Self {
            status: PageStatus::Failed,
            error: Some(error),
            ..Self::pending(page_index)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != PageStatus::Pending
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Every page failed extraction.
    AllPagesFailed,
    /// Transient errors outlasted the retry budget.
    AttemptsExhausted,
    /// The PDF itself is unusable.
    DocumentRejected,
    /// The store refused to serve the flyer.
    SourceRejected,
    /// Any other non-retryable error.
    NonRetryable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::AllPagesFailed => "all pages failed",
            FailureReason::AttemptsExhausted => "retry attempts exhausted",
            FailureReason::DocumentRejected => "document rejected",
            FailureReason::SourceRejected => "source rejected",
            FailureReason::NonRetryable => "non-retryable error",
        };
        f.write_str(s)
    }
}

/// Human-readable error record kept on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorSummary {
    pub class: ErrorClass,
    /// Set once the job is `Failed`.
    pub reason: Option<FailureReason>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What the job does after a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { eligible_at: DateTime<Utc> },
    Exhausted,
}

/// One flyer ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub source: SourceRef,
    pub state: JobState,
    /// Retries consumed so far. Quota cool-downs do not count.
    pub attempts: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<JobErrorSummary>,
    pub pages: Vec<PageResult>,
    /// SHA-256 of the source PDF of the current attempt.
    pub fingerprint: Option<String>,
    pub pdf_ref: Option<BlobRef>,
    /// Completed without work because the content had not changed.
    pub unchanged: bool,
    /// Optimistic-concurrency version, bumped by the catalog on each update.
    pub version: u64,
}

impl ExtractionJob {
    pub fn new(source: SourceRef, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source,
            state: JobState::Discovered,
            attempts: 0,
            next_eligible_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            error: None,
            pages: Vec::new(),
            fingerprint: None,
            pdf_ref: None,
            unchanged: false,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a worker may pick this job up at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Discovered => true,
            JobState::Retrying => self.next_eligible_at.map_or(true, |t| t <= now),
            _ => false,
        }
    }

    /// Move to `to`, enforcing the transition table.
    pub fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> Result<(), IngestError> {
        if self.is_terminal() {
            return Err(IngestError::TerminalJob(self.id));
        }
        if !self.state.can_transition_to(to) {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// `Retrying → Discovered` once the backoff has elapsed. Returns whether
    /// the job is ready to start.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<bool, IngestError> {
        match self.state {
            JobState::Discovered => Ok(true),
            JobState::Retrying if self.is_eligible(now) => {
                self.transition(JobState::Discovered, now)?;
                self.next_eligible_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// `Discovered → Rendering` on worker pickup. Clears per-attempt state.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), IngestError> {
        self.transition(JobState::Rendering, now)?;
        self.started_at = Some(now);
        self.pages.clear();
        self.fingerprint = None;
        self.unchanged = false;
        Ok(())
    }

    /// Terminal failure with a reason.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        class: ErrorClass,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        self.transition(JobState::Failed, now)?;
        self.next_eligible_at = None;
        self.error = Some(JobErrorSummary {
            class,
            reason: Some(reason),
            message: message.into(),
            at: now,
        });
        Ok(())
    }

    /// Schedule a retry after a transient error, or fail if the budget is spent.
    pub fn retry_or_fail(
        &mut self,
        policy: &RetryPolicy,
        class: ErrorClass,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, IngestError> {
        let message = message.into();
        if self.attempts + 1 >= policy.max_attempts {
            self.fail(FailureReason::AttemptsExhausted, class, message, now)?;
            return Ok(RetryDecision::Exhausted);
        }
        let delay = chrono::Duration::from_std(policy.backoff(self.attempts))
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let eligible_at = now + delay;
        self.transition(JobState::Retrying, now)?;
        self.attempts += 1;
        self.next_eligible_at = Some(eligible_at);
        self.error = Some(JobErrorSummary {
            class,
            reason: None,
            message,
            at: now,
        });
        Ok(RetryDecision::Retry { eligible_at })
    }

    /// Recover a job left mid-pipeline by a worker whose lease expired.
    /// Counts as a consumed attempt but is eligible again immediately.
    pub fn restart_abandoned(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, IngestError> {
        let message = format!("previous worker abandoned the job in state {}", self.state);
        if self.attempts + 1 >= policy.max_attempts {
            self.fail(
                FailureReason::AttemptsExhausted,
                ErrorClass::TransientIo,
                message,
                now,
            )?;
            return Ok(RetryDecision::Exhausted);
        }
        self.transition(JobState::Retrying, now)?;
        self.attempts += 1;
        self.next_eligible_at = Some(now);
        self.error = Some(JobErrorSummary {
            class: ErrorClass::TransientIo,
            reason: None,
            message,
            at: now,
        });
        Ok(RetryDecision::Retry { eligible_at: now })
    }

    /// Park the job until a store cool-down ends. Does not consume an attempt.
    pub fn defer(
        &mut self,
        until: DateTime<Utc>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        self.transition(JobState::Retrying, now)?;
        self.next_eligible_at = Some(until);
        self.error = Some(JobErrorSummary {
            class: ErrorClass::SourceQuota,
            reason: None,
            message: message.into(),
            at: now,
        });
        Ok(())
    }

    pub fn pages_succeeded(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| p.status == PageStatus::Succeeded)
            .count()
    }

    pub fn pages_failed(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| p.status == PageStatus::Failed)
            .count()
    }

    /// All candidate listings of succeeded pages, in page then listing order.
    pub fn candidates(&self) -> Vec<CandidateListing> {
        let mut pages: Vec<&PageResult> = self
            .pages
            .iter()
            .filter(|p| p.status == PageStatus::Succeeded)
            .collect();
        pages.sort_by_key(|p| p.page_index);
        pages
            .into_iter()
            .flat_map(|p| p.listings.iter().cloned())
            .collect()
    }
}

/// Content fingerprint of a flyer: lowercase hex SHA-256.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceRef;

    fn job() -> ExtractionJob {
        ExtractionJob::new(
            SourceRef::new("store-a", "2024-01-01", "https://a.example/flyer.pdf"),
            Utc::now(),
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let now = Utc::now();
        let mut j = job();
        j.begin(now).unwrap();
        assert_eq!(j.started_at, Some(now));
        for s in [
            JobState::Extracting,
            JobState::Aggregating,
            JobState::Matching,
            JobState::Completed,
        ] {
            j.transition(s, now).unwrap();
        }
        assert!(j.is_terminal());
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut j = job();
        let err = j.transition(JobState::Matching, Utc::now()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidTransition { .. }));
        assert_eq!(j.state, JobState::Discovered);
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let now = Utc::now();
        let mut j = job();
        j.fail(
            FailureReason::DocumentRejected,
            ErrorClass::TerminalJobFailure,
            "corrupt",
            now,
        )
        .unwrap();
        let before = j.clone();
        assert!(matches!(
            j.transition(JobState::Retrying, now),
            Err(IngestError::TerminalJob(_))
        ));
        assert!(j.retry_or_fail(&policy(), ErrorClass::TransientIo, "x", now).is_err());
        assert_eq!(j, before);
    }

    #[test]
    fn retry_backs_off_then_exhausts() {
        let now = Utc::now();
        let mut j = job();
        j.begin(now).unwrap();

        let d = j
            .retry_or_fail(&policy(), ErrorClass::TransientIo, "timeout", now)
            .unwrap();
        assert_eq!(
            d,
            RetryDecision::Retry {
                eligible_at: now + chrono::Duration::seconds(1)
            }
        );
        assert_eq!(j.attempts, 1);
        assert!(!j.is_eligible(now));
        assert!(!j.resume(now).unwrap());

        let later = now + chrono::Duration::seconds(1);
        assert!(j.resume(later).unwrap());
        assert_eq!(j.state, JobState::Discovered);
        j.begin(later).unwrap();

        let d = j
            .retry_or_fail(&policy(), ErrorClass::TransientIo, "timeout", later)
            .unwrap();
        assert_eq!(
            d,
            RetryDecision::Retry {
                eligible_at: later + chrono::Duration::seconds(2)
            }
        );

        let again = later + chrono::Duration::seconds(2);
        j.resume(again).unwrap();
        j.begin(again).unwrap();
        let d = j
            .retry_or_fail(&policy(), ErrorClass::TransientIo, "timeout", again)
            .unwrap();
        assert_eq!(d, RetryDecision::Exhausted);
        assert_eq!(j.state, JobState::Failed);
        assert_eq!(
            j.error.as_ref().and_then(|e| e.reason),
            Some(FailureReason::AttemptsExhausted)
        );
    }

    #[test]
    fn quota_deferral_keeps_attempt_budget() {
        let now = Utc::now();
        let mut j = job();
        j.begin(now).unwrap();
        j.transition(JobState::Extracting, now).unwrap();
        let until = now + chrono::Duration::minutes(15);
        j.defer(until, "quota", now).unwrap();
        assert_eq!(j.state, JobState::Retrying);
        assert_eq!(j.attempts, 0);
        assert_eq!(j.next_eligible_at, Some(until));
        assert_eq!(
            j.error.as_ref().map(|e| e.class),
            Some(ErrorClass::SourceQuota)
        );
    }

    #[test]
    fn abandoned_job_restarts_immediately() {
        let now = Utc::now();
        let mut j = job();
        j.begin(now).unwrap();
        j.transition(JobState::Extracting, now).unwrap();

        let d = j.restart_abandoned(&policy(), now).unwrap();
        assert_eq!(d, RetryDecision::Retry { eligible_at: now });
        assert_eq!(j.attempts, 1);
        assert!(j.resume(now).unwrap());
        assert_eq!(j.state, JobState::Discovered);
    }

    #[test]
    fn candidates_follow_page_order() {
        use rust_decimal::Decimal;
        let mut j = job();
        let listing = |page: usize, name: &str| CandidateListing {
            name: name.into(),
            price: Decimal::new(129, 2),
            unit: None,
            valid_from: None,
            valid_to: None,
            page_index: page,
            listing_index: 0,
            confidence: None,
        };
        let mut p2 = PageResult::pending(2);
        p2.status = PageStatus::Succeeded;
        p2.listings = vec![listing(2, "c")];
        let mut p0 = PageResult::pending(0);
        p0.status = PageStatus::Succeeded;
        p0.listings = vec![listing(0, "a")];
        let p1 = PageResult::failed(
            1,
            PageError::RenderFailed {
                page: 1,
                detail: "x".into(),
            },
        );
        j.pages = vec![p2, p1, p0];

        let names: Vec<String> = j.candidates().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(j.pages_succeeded(), 2);
        assert_eq!(j.pages_failed(), 1);
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = fingerprint(b"%PDF-1.7 flyer");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint(b"%PDF-1.7 flyer"));
        assert_ne!(a, fingerprint(b"%PDF-1.7 flyer v2"));
    }
}
