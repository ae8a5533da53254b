//! Error types for the flyer-ingest pipeline.
//!
//! Errors come in three layers:
//!
//! * Component errors ([`RenderError`], [`ExtractionError`], [`SourceError`],
//!   [`BlobError`], [`CatalogError`], [`QueueError`]) raised by one stage or
//!   one external collaborator.
//!
//! * [`IngestError`]: job-level failure returned from the job runner and the
//!   scheduler. Wraps component errors transparently.
//!
//! * [`PageError`]: non-fatal, one page failed. Stored inside
//!   [`crate::job::PageResult`] so the rest of the flyer can still complete.
//!
//! Every error maps onto one [`ErrorClass`], which is the only thing the job
//! state machine looks at when deciding between retry, cool-down and failure.

use crate::job::JobState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network or storage hiccup. Retried with backoff against the attempt budget.
    TransientIo,
    /// Rate limit or quota from the model or the store endpoint. The store is
    /// cooled down; the job attempt budget is left untouched.
    SourceQuota,
    /// Malformed input or model output. Recorded per page.
    ValidationFailure,
    /// Not worth retrying. The job is marked `Failed`.
    TerminalJobFailure,
    /// Unique-constraint hit on idempotent re-application.
    CatalogConflict,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientIo | ErrorClass::SourceQuota)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::SourceQuota => "source_quota",
            ErrorClass::ValidationFailure => "validation_failure",
            ErrorClass::TerminalJobFailure => "terminal_job_failure",
            ErrorClass::CatalogConflict => "catalog_conflict",
        };
        f.write_str(s)
    }
}

// ── Rendering ────────────────────────────────────────────────────────────

/// Failure while turning PDF bytes into page images.
///
/// Variants carrying a `page` are page-scoped: only that page fails. The rest
/// are document-scoped and abort the job.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// First bytes are not `%PDF`.
    #[error("input is not a PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    /// Header, trailer or xref table cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    /// Rendered page would exceed the configured pixel ceiling.
    #[error("page {page} would render at {width}x{height} px, above the {max} px limit")]
    PageTooLarge {
        page: usize,
        width: u32,
        height: u32,
        max: u32,
    },

    /// pdfium returned an error for a specific page.
    #[error("rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    #[error("PNG encoding failed for page {page}: {detail}")]
    EncodeFailed { page: usize, detail: String },

    #[error("failed to bind to pdfium library: {0}")]
    PdfiumBindingFailed(String),

    /// The blocking render task panicked or the consumer vanished.
    #[error("render task failed: {0}")]
    Internal(String),
}

impl RenderError {
    /// Page this error is scoped to, if any.
    pub fn page(&self) -> Option<usize> {
        match self {
            RenderError::PageTooLarge { page, .. }
            | RenderError::RasterisationFailed { page, .. }
            | RenderError::EncodeFailed { page, .. } => Some(*page),
            _ => None,
        }
    }

    pub fn is_document_scoped(&self) -> bool {
        self.page().is_none()
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RenderError::NotAPdf { .. }
            | RenderError::CorruptPdf { .. }
            | RenderError::PasswordRequired
            | RenderError::PdfiumBindingFailed(_) => ErrorClass::TerminalJobFailure,
            RenderError::PageTooLarge { .. }
            | RenderError::RasterisationFailed { .. }
            | RenderError::EncodeFailed { .. } => ErrorClass::ValidationFailure,
            RenderError::Internal(_) => ErrorClass::TransientIo,
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

/// Failure returned by the extraction client for one page.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExtractionError {
    /// Timeout, connection reset, 5xx. Retryable by the caller.
    #[error("transient model failure: {detail}")]
    Transient { detail: String },

    /// Structured output could not be parsed or failed validation, even
    /// after the stricter retry.
    #[error("invalid model response: {detail}")]
    InvalidResponse { detail: String },

    /// HTTP 429 or an exhausted quota.
    #[error("model quota exceeded")]
    QuotaExceeded { retry_after_secs: Option<u64> },
}

impl ExtractionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExtractionError::Transient { .. } => ErrorClass::TransientIo,
            ExtractionError::InvalidResponse { .. } => ErrorClass::ValidationFailure,
            ExtractionError::QuotaExceeded { .. } => ErrorClass::SourceQuota,
        }
    }
}

// ── Store sources ────────────────────────────────────────────────────────

/// Failure while discovering or downloading flyers from a store.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("store endpoint unavailable for '{url}': {detail}")]
    Transient { url: String, detail: String },

    #[error("store endpoint rate limited '{url}'")]
    Quota {
        url: String,
        retry_after_secs: Option<u64>,
    },

    /// 4xx other than 429. Retrying will not help.
    #[error("store endpoint rejected '{url}' with HTTP {status}")]
    Rejected { url: String, status: u16 },

    #[error("download from '{url}' is not a PDF (first bytes: {magic:?})")]
    NotAPdf { url: String, magic: Vec<u8> },
}

impl SourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SourceError::Transient { .. } => ErrorClass::TransientIo,
            SourceError::Quota { .. } => ErrorClass::SourceQuota,
            SourceError::Rejected { .. } | SourceError::NotAPdf { .. } => {
                ErrorClass::TerminalJobFailure
            }
        }
    }
}

// ── External stores ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum BlobError {
    #[error("blob '{key}' not found")]
    NotFound { key: String },

    #[error("blob store unavailable: {detail}")]
    Unavailable { detail: String },
}

impl BlobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BlobError::NotFound { .. } => ErrorClass::TerminalJobFailure,
            BlobError::Unavailable { .. } => ErrorClass::TransientIo,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// A uniqueness constraint rejected the write. Usually means the same
    /// row was already written by a retried or concurrent execution.
    #[error("{entity} already exists for key '{key}'")]
    Conflict { entity: &'static str, key: String },

    /// Optimistic-concurrency check failed on a versioned update.
    #[error("{entity} '{key}' was modified concurrently (expected version {expected})")]
    StaleVersion {
        entity: &'static str,
        key: String,
        expected: u64,
    },

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("catalog store unavailable: {detail}")]
    Unavailable { detail: String },
}

impl CatalogError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CatalogError::Conflict { .. } | CatalogError::StaleVersion { .. } => {
                ErrorClass::CatalogConflict
            }
            CatalogError::NotFound { .. } => ErrorClass::TerminalJobFailure,
            CatalogError::Unavailable { .. } => ErrorClass::TransientIo,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The lease expired and another worker may hold the job now.
    #[error("lease on job {job_id} is no longer held")]
    LeaseLost { job_id: Uuid },

    #[error("job queue unavailable: {detail}")]
    Unavailable { detail: String },
}

// ── Job-level ────────────────────────────────────────────────────────────

/// Job-level error returned by the runner and the scheduler.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The model quota was hit while extracting; the store must cool down.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("illegal job transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("job {0} is in a terminal state and cannot be modified")]
    TerminalJob(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("no source registered for store '{0}'")]
    UnknownStore(String),

    #[error("job {job_id} did not finish within {secs}s of its lease")]
    LeaseDeadline { job_id: Uuid, secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Render(e) => e.class(),
            IngestError::Source(e) => e.class(),
            IngestError::Blob(e) => e.class(),
            IngestError::Catalog(e) => e.class(),
            IngestError::Extraction(e) => e.class(),
            IngestError::Queue(QueueError::LeaseLost { .. }) => ErrorClass::CatalogConflict,
            IngestError::Queue(QueueError::Unavailable { .. })
            | IngestError::LeaseDeadline { .. }
            | IngestError::Internal(_) => ErrorClass::TransientIo,
            IngestError::InvalidConfig(_)
            | IngestError::InvalidTransition { .. }
            | IngestError::TerminalJob(_)
            | IngestError::JobNotFound(_)
            | IngestError::UnknownStore(_) => ErrorClass::TerminalJobFailure,
        }
    }

    /// Operator-facing one-liner. Never includes raw upstream payloads.
    pub fn summary(&self) -> String {
        match self {
            IngestError::Render(RenderError::NotAPdf { .. }) => {
                "flyer download is not a PDF document".to_string()
            }
            IngestError::Render(RenderError::CorruptPdf { .. }) => {
                "flyer PDF is corrupt and could not be opened".to_string()
            }
            IngestError::Render(RenderError::PasswordRequired) => {
                "flyer PDF is password protected".to_string()
            }
            IngestError::Render(RenderError::PdfiumBindingFailed(_)) => {
                "PDF renderer library is not available".to_string()
            }
            IngestError::Render(_) => "flyer pages could not be rendered".to_string(),
            IngestError::Source(SourceError::Rejected { status, .. }) => {
                format!("store rejected the flyer download (HTTP {status})")
            }
            IngestError::Source(SourceError::NotAPdf { .. }) => {
                "store returned something other than a PDF".to_string()
            }
            IngestError::Source(SourceError::Quota { .. }) => {
                "store endpoint is rate limiting requests".to_string()
            }
            IngestError::Source(SourceError::Transient { .. }) => {
                "store endpoint was temporarily unavailable".to_string()
            }
            IngestError::Extraction(ExtractionError::QuotaExceeded { .. }) => {
                "extraction model quota exceeded".to_string()
            }
            IngestError::Extraction(_) => "extraction model call failed".to_string(),
            IngestError::Blob(_) => "flyer storage was unavailable".to_string(),
            IngestError::Catalog(_) => "product catalog was unavailable".to_string(),
            IngestError::Queue(_) => "job queue was unavailable".to_string(),
            IngestError::LeaseDeadline { secs, .. } => {
                format!("processing did not finish within {secs}s")
            }
            IngestError::UnknownStore(store) => format!("no flyer source configured for {store}"),
            IngestError::InvalidConfig(_)
            | IngestError::InvalidTransition { .. }
            | IngestError::TerminalJob(_)
            | IngestError::JobNotFound(_)
            | IngestError::Internal(_) => "internal pipeline error".to_string(),
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored alongside [`crate::job::PageResult`] when a page fails. The job
/// continues unless every page fails.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PageError {
    #[error("Page {page}: rendering failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    #[error("Page {page}: extraction failed after {attempts} attempts: {detail}")]
    ExtractionFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    #[error("Page {page}: model output rejected: {detail}")]
    InvalidResponse { page: usize, detail: String },

    #[error("Page {page}: could not store page image: {detail}")]
    StorageFailed { page: usize, detail: String },
}
