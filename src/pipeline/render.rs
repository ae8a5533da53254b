//! PDF rasterisation: PDF bytes → lazy stream of PNG page images.
//!
//! pdfium is not async-safe, so the whole document lives on one
//! `spawn_blocking` thread. Pages are rendered one at a time and pushed into
//! a bounded channel; the consumer pulls them as a [`PageStream`]. With a
//! capacity of `n`, at most `n` rendered pages wait in memory, however long
//! the flyer is. The stream is single-use: once consumed or dropped, the
//! render thread stops and the document is released.
//!
//! Errors split in two:
//!
//! * document-scoped (not a PDF, corrupt, password) come back from
//!   [`PdfRenderer::open`] before any page is produced;
//! * page-scoped (rasterisation, oversize, encode) arrive as `Err` items in
//!   the stream, and the following pages keep coming.

use crate::config::RenderConfig;
use crate::error::RenderError;
use crate::pipeline::encode::encode_png;
use async_trait::async_trait;
use futures::Stream;
use pdfium_render::prelude::*;
use std::path::Path;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// pdfium renders at 72 points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// One rasterised page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 0-based page index.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

pub type PageStream = Pin<Box<dyn Stream<Item = Result<RenderedPage, RenderError>> + Send>>;

/// An opened document: its page count and the lazy page stream.
pub struct RenderedDocument {
    pub page_count: usize,
    pub pages: PageStream,
}

impl std::fmt::Debug for RenderedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedDocument")
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    /// Open `pdf` and start rendering. Document-scoped failures are returned
    /// here; page failures appear in the stream.
    async fn open(&self, pdf: Vec<u8>) -> Result<RenderedDocument, RenderError>;
}

/// Handle given to a blocking page producer.
pub struct PageEmitter {
    count_tx: Option<oneshot::Sender<Result<usize, RenderError>>>,
    page_tx: mpsc::Sender<Result<RenderedPage, RenderError>>,
}

impl PageEmitter {
    /// Report the page count. Must precede the first [`emit`](Self::emit).
    pub fn start(&mut self, page_count: usize) {
        if let Some(tx) = self.count_tx.take() {
            let _ = tx.send(Ok(page_count));
        }
    }

    /// Hand one page to the consumer, blocking while the channel is full.
    /// Returns `false` once the consumer has gone away.
    pub fn emit(&mut self, page: Result<RenderedPage, RenderError>) -> bool {
        self.start_if_needed();
        self.page_tx.blocking_send(page).is_ok()
    }

    fn start_if_needed(&mut self) {
        if self.count_tx.is_some() {
            warn!("Page emitted before the page count was reported");
            self.start(0);
        }
    }

    fn finish(mut self, result: Result<(), RenderError>) {
        match (self.count_tx.take(), result) {
            (Some(tx), Err(e)) => {
                let _ = tx.send(Err(e));
            }
            (Some(tx), Ok(())) => {
                let _ = tx.send(Ok(0));
            }
            (None, Err(e)) => {
                let _ = self.page_tx.blocking_send(Err(e));
            }
            (None, Ok(())) => {}
        }
    }
}

/// Run a blocking page producer on the blocking pool and expose its pages as
/// a [`RenderedDocument`].
///
/// `produce` must call [`PageEmitter::start`] once the page count is known;
/// an `Err` returned before that is reported as a document-scoped failure.
pub async fn stream_pages<F>(capacity: usize, produce: F) -> Result<RenderedDocument, RenderError>
where
    F: FnOnce(&mut PageEmitter) -> Result<(), RenderError> + Send + 'static,
{
    let (count_tx, count_rx) = oneshot::channel();
    let (page_tx, page_rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::task::spawn_blocking(move || {
        let mut emitter = PageEmitter {
            count_tx: Some(count_tx),
            page_tx,
        };
        let result = produce(&mut emitter);
        emitter.finish(result);
    });

    match count_rx.await {
        Ok(Ok(page_count)) => Ok(RenderedDocument {
            page_count,
            pages: Box::pin(ReceiverStream::new(page_rx)),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let detail = match handle.await {
                Err(e) => format!("render task panicked: {e}"),
                Ok(()) => "render task ended without reporting a page count".to_string(),
            };
            Err(RenderError::Internal(detail))
        }
    }
}

/// Renderer backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    config: RenderConfig,
}

impl PdfiumRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PdfRenderer for PdfiumRenderer {
    async fn open(&self, pdf: Vec<u8>) -> Result<RenderedDocument, RenderError> {
        check_magic(&pdf)?;
        let config = self.config.clone();
        stream_pages(config.channel_capacity, move |emitter| {
            render_blocking(&pdf, &config, emitter)
        })
        .await
    }
}

/// Reject input that does not start with `%PDF`.
pub fn check_magic(bytes: &[u8]) -> Result<(), RenderError> {
    if bytes.starts_with(b"%PDF") {
        Ok(())
    } else {
        Err(RenderError::NotAPdf {
            magic: bytes.iter().take(4).copied().collect(),
        })
    }
}

fn bind_pdfium(library_dir: Option<&Path>) -> Result<Pdfium, RenderError> {
    let bindings = match library_dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| RenderError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Blocking implementation: load once, render page by page.
fn render_blocking(
    pdf: &[u8],
    config: &RenderConfig,
    emitter: &mut PageEmitter,
) -> Result<(), RenderError> {
    let pdfium = bind_pdfium(config.pdfium_library_path.as_deref())?;

    let document = pdfium.load_pdf_from_byte_slice(pdf, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            RenderError::PasswordRequired
        } else {
            RenderError::CorruptPdf { detail: err_str }
        }
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);
    emitter.start(total_pages);

    let scale = config.dpi as f32 / POINTS_PER_INCH;
    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

    for idx in 0..total_pages {
        let result = pages
            .get(idx as u16)
            .map_err(|e| RenderError::RasterisationFailed {
                page: idx,
                detail: format!("{:?}", e),
            })
            .and_then(|page| render_page(&page, idx, scale, config.max_page_pixels, &render_config));

        if let Err(e) = &result {
            warn!("Page {}: {}", idx, e);
        }
        if !emitter.emit(result) {
            debug!("Page consumer dropped; stopping render at page {}", idx);
            break;
        }
    }

    Ok(())
}

fn render_page(
    page: &PdfPage<'_>,
    index: usize,
    scale: f32,
    max_pixels: u32,
    render_config: &PdfRenderConfig,
) -> Result<RenderedPage, RenderError> {
    let (width, height) = scaled_size(page.width().value, page.height().value, scale);
    check_dimensions(index, width, height, max_pixels)?;

    let bitmap = page
        .render_with_config(render_config)
        .map_err(|e| RenderError::RasterisationFailed {
            page: index,
            detail: format!("{:?}", e),
        })?;
    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        index,
        image.width(),
        image.height()
    );

    let png = encode_png(&image).map_err(|e| RenderError::EncodeFailed {
        page: index,
        detail: e.to_string(),
    })?;

    Ok(RenderedPage {
        index,
        width: image.width(),
        height: image.height(),
        png,
    })
}

/// Pixel size of a page of `width_pts` × `height_pts` at `scale`.
fn scaled_size(width_pts: f32, height_pts: f32, scale: f32) -> (u32, u32) {
    let px = |pts: f32| (pts * scale).round().max(0.0) as u32;
    (px(width_pts), px(height_pts))
}

fn check_dimensions(page: usize, width: u32, height: u32, max: u32) -> Result<(), RenderError> {
    if width > max || height > max {
        return Err(RenderError::PageTooLarge {
            page,
            width,
            height,
            max,
        });
    }
    Ok(())
}
