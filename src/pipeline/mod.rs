//! Page extraction pipeline: one document in, ordered page results out.
//!
//! Each submodule implements exactly one step.
//!
//! ## Data Flow
//!
//! ```text
//! staged file ──▶ decompose ──▶ encode ──▶ extract ──▶ aggregate
//!                 (pdfium /     (resize,    (backend,   (ordered
//!                  image)        PNG)        retries)    sections)
//! ```
//!
//! 1. [`decompose`]: split a PDF or raster image into [`PageUnit`]s; runs
//!    in `spawn_blocking`
//! 2. [`encode`]: shrink to `max_img_size` and PNG-encode
//! 3. [`extract`]: submit one page to the backend with retry/backoff; a
//!    failure stays local to its page
//! 4. [`aggregate`]: join results in page order with explicit markers for
//!    empty and failed pages
//! 5. [`postprocess`]: reply cleanup used by the VLM backend

pub mod aggregate;
pub mod decompose;
pub mod encode;
pub mod extract;
pub mod postprocess;

pub use extract::ExtractionContext;

use crate::backend::ExtractionBackend;
use crate::config::WorkerConfig;
use crate::error::ExtractError;
use crate::output::{DocumentContent, PageOutcome, PageResult, PageUnit};
use futures::stream::{self, StreamExt};
use std::path::Path;
use tracing::info;

/// Drives the per-document steps against one backend.
#[derive(Clone, Copy)]
pub struct PageExtractionPipeline<'a> {
    backend: &'a dyn ExtractionBackend,
    config: &'a WorkerConfig,
}

impl<'a> PageExtractionPipeline<'a> {
    pub fn new(backend: &'a dyn ExtractionBackend, config: &'a WorkerConfig) -> Self {
        Self { backend, config }
    }

    /// Split the staged file into ordered pages.
    pub async fn decompose(
        &self,
        path: &Path,
        document: &str,
    ) -> Result<Vec<PageUnit>, ExtractError> {
        decompose::decompose(path, document, self.config).await
    }

    /// Extract a single page.
    pub async fn extract_page(&self, unit: PageUnit, ctx: &ExtractionContext<'_>) -> PageResult {
        extract::extract_page(self.backend, unit, ctx, self.config).await
    }

    /// Extract every page with at most `page_concurrency` in flight.
    ///
    /// Results come back sorted by ordinal whatever order they finished in.
    pub async fn process_pages(
        &self,
        pages: Vec<PageUnit>,
        ctx: &ExtractionContext<'_>,
    ) -> Vec<PageResult> {
        let total = pages.len();
        let concurrency = self.config.page_concurrency.max(1);
        let callback = self.config.progress_callback.as_deref();
        let ctx = *ctx;

        let mut results: Vec<PageResult> = stream::iter(pages)
            .map(|unit| async move {
                let document = unit.document.clone();
                let ordinal = unit.ordinal;
                if let Some(cb) = callback {
                    cb.on_page_start(&document, ordinal, total);
                }
                let result = self.extract_page(unit, &ctx).await;
                if let Some(cb) = callback {
                    match &result.outcome {
                        PageOutcome::Content(text) => {
                            cb.on_page_complete(&document, ordinal, total, text.len())
                        }
                        PageOutcome::Empty => cb.on_page_complete(&document, ordinal, total, 0),
                        PageOutcome::Failed(e) => {
                            cb.on_page_error(&document, ordinal, total, &e.to_string())
                        }
                    }
                }
                result
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        results.sort_by_key(|r| r.ordinal);
        results
    }

    /// Join ordered results into the document's content string.
    pub fn aggregate(results: &[PageResult]) -> String {
        aggregate::aggregate(results)
    }

    /// Decompose, extract and aggregate one document.
    pub async fn run(
        &self,
        path: &Path,
        document: &str,
        ctx: &ExtractionContext<'_>,
    ) -> Result<DocumentContent, ExtractError> {
        let pages = self.decompose(path, document).await?;
        let page_count = pages.len();
        if let Some(cb) = &self.config.progress_callback {
            cb.on_document_start(document, page_count);
        }

        let results = self.process_pages(pages, ctx).await;
        let failed = results.iter().filter(|r| r.outcome.is_failed()).count();
        let succeeded = page_count - failed;
        if let Some(cb) = &self.config.progress_callback {
            cb.on_document_complete(document, page_count, succeeded);
        }
        info!(
            "{}: {}/{} pages extracted via {}",
            document,
            succeeded,
            page_count,
            self.backend.name()
        );

        Ok(DocumentContent {
            document: document.to_string(),
            page_count,
            content: Self::aggregate(&results),
            pages: results,
        })
    }
}
