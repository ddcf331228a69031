//! Document decomposition: one staged file → ordered [`PageUnit`]s.
//!
//! PDFs are rasterised with pdfium; raster images are a single page. Any
//! failure, including a document with no pages, is fatal for that document
//! only.
//!
//! ## Why spawn_blocking?
//!
//! pdfium and the image decoders are CPU-bound and synchronous. Both run on
//! the blocking pool so the runtime's worker threads keep serving health
//! probes and backend calls for other pages.

use crate::config::WorkerConfig;
use crate::error::ExtractError;
use crate::output::PageUnit;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Extensions accepted as single-page raster documents.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "tiff", "bmp", "webp", "gif"];

/// How a staged file is decomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image,
}

impl DocumentKind {
    /// Classify by magic bytes first, then by extension.
    pub fn detect(path: &Path, head: &[u8]) -> Option<Self> {
        if head.starts_with(b"%PDF") {
            return Some(DocumentKind::Pdf);
        }
        if image::guess_format(head).is_ok() {
            return Some(DocumentKind::Image);
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())?;
        if ext == "pdf" {
            Some(DocumentKind::Pdf)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(DocumentKind::Image)
        } else {
            None
        }
    }
}

/// Split the file at `path` into pages named after `document`.
pub async fn decompose(
    path: &Path,
    document: &str,
    config: &WorkerConfig,
) -> Result<Vec<PageUnit>, ExtractError> {
    let fail = |detail: String| ExtractError::PageDecomposition {
        document: document.to_string(),
        detail,
    };

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| fail(format!("cannot read staged file: {e}")))?;
    let kind = DocumentKind::detect(path, &bytes[..bytes.len().min(64)])
        .ok_or_else(|| fail("unsupported document format".to_string()))?;

    let images = match kind {
        DocumentKind::Pdf => {
            let owned = path.to_path_buf();
            let library = config.pdfium_library.clone();
            let dpi = config.dpi;
            let max_pixels = config.max_rendered_pixels;
            tokio::task::spawn_blocking(move || {
                render_pdf_blocking(&owned, library.as_deref(), dpi, max_pixels)
            })
            .await
            .map_err(|e| ExtractError::Internal(format!("Render task panicked: {e}")))?
            .map_err(fail)?
        }
        DocumentKind::Image => tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|img| vec![img])
        })
        .await
        .map_err(|e| ExtractError::Internal(format!("Decode task panicked: {e}")))?
        .map_err(|e| fail(format!("cannot decode image: {e}")))?,
    };

    if images.is_empty() {
        return Err(fail("document has no pages".to_string()));
    }

    info!("{}: {} page(s) ({:?})", document, images.len(), kind);
    Ok(images
        .into_iter()
        .enumerate()
        .map(|(i, image)| PageUnit {
            document: document.to_string(),
            ordinal: i + 1,
            image,
        })
        .collect())
}

fn bind_pdfium(library: Option<&Path>) -> Result<Pdfium, String> {
    let bindings = match library {
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| format!("pdfium library unavailable: {e:?}"))?;
    Ok(Pdfium::new(bindings))
}

fn render_pdf_blocking(
    path: &Path,
    library: Option<&Path>,
    dpi: u32,
    max_pixels: u32,
) -> Result<Vec<DynamicImage>, String> {
    let pdfium = bind_pdfium(library)?;

    let document = pdfium.load_pdf_from_file(path, None).map_err(|e| {
        let detail = format!("{e:?}");
        if detail.to_ascii_lowercase().contains("password") {
            "document is password-protected".to_string()
        } else {
            format!("corrupt or unreadable PDF: {detail}")
        }
    })?;

    let pages = document.pages();
    let total = pages.len();

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::with_capacity(total as usize);
    for idx in 0..total {
        let page = pages
            .get(idx)
            .map_err(|e| format!("page {}: {e:?}", idx + 1))?;
        let image = page
            .render_with_config(&render_config)
            .map_err(|e| format!("page {}: rasterisation failed: {e:?}", idx + 1))?
            .as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }
    Ok(images)
}
