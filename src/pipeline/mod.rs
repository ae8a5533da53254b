//! Pipeline stages for turning a flyer PDF into candidate listings.
//!
//! Each submodule implements exactly one transformation step, so each can be
//! tested alone and swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ encode ──▶ extract ──▶ parse
//! (pdfium)   (PNG)      (VLM)       (validate)
//! ```
//!
//! 1. [`render`]: rasterise pages lazily on a blocking thread; pages arrive
//!    through a bounded channel
//! 2. [`encode`]: PNG-encode each page and base64-wrap it for the model
//! 3. [`extract`]: call the vision model with pacing, a per-call timeout and
//!    one strict retry on unparseable output
//! 4. [`parse`]: turn the untrusted reply into validated listings

pub mod encode;
pub mod extract;
pub mod parse;
pub mod render;
