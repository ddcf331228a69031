//! Per-page extraction: prepare the image, call the backend, retry.
//!
//! ## Retry Strategy
//!
//! Transport errors, 429/5xx replies and unparseable responses are retried
//! with exponential backoff (`retry_backoff_ms * 2^(attempt-1)`, capped at
//! [`MAX_BACKOFF_MS`]). Each attempt is bounded by `api_timeout_secs`. A non-retryable error ends the
//! loop early.
//!
//! The PNG handed to the backend lives in a page-scoped temp file inside the
//! request directory and is deleted as soon as the page settles, whatever
//! the outcome.

use crate::backend::{BackendError, ExtractionBackend, ExtractionSchema, PageImage};
use crate::config::WorkerConfig;
use crate::error::PageError;
use crate::output::{PageOutcome, PageResult, PageUnit};
use crate::pipeline::encode::{encode_png, fit_within};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Upper bound on the sleep between two attempts.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Request-wide parameters shared by every page.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub schema: &'a ExtractionSchema,
    pub model: &'a str,
    /// Longest edge of the submitted image.
    pub max_img_size: u32,
    /// Directory that receives the page-scoped temp files.
    pub scratch_dir: &'a Path,
}

/// Extract one page. Never fails: errors become [`PageOutcome::Failed`].
pub async fn extract_page(
    backend: &dyn ExtractionBackend,
    unit: PageUnit,
    ctx: &ExtractionContext<'_>,
    config: &WorkerConfig,
) -> PageResult {
    let start = Instant::now();
    let document = unit.document.clone();
    let ordinal = unit.ordinal;

    let scratch = match prepare_image(unit, ctx.max_img_size, ctx.scratch_dir).await {
        Ok(file) => file,
        Err(detail) => {
            warn!("{} page {}: {}", document, ordinal, detail);
            let mut result = PageResult::from_outcome(
                document,
                ordinal,
                PageOutcome::Failed(PageError::Encode {
                    page: ordinal,
                    detail,
                }),
            );
            result.duration_ms = start.elapsed().as_millis() as u64;
            return result;
        }
    };

    let page = PageImage {
        document: &document,
        ordinal,
        path: scratch.path(),
        mime_type: "image/png",
    };
    let call_timeout = Duration::from_secs(config.api_timeout_secs);

    let mut last_failure: Option<PageError> = None;
    let mut attempt = 0u32;
    let mut reply = None;

    while attempt <= config.max_retries {
        if attempt > 0 {
            let backoff = backoff_delay(config.retry_backoff_ms, attempt);
            warn!(
                "{} page {}: retry {}/{} after {}ms",
                document, ordinal, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(call_timeout, backend.extract(&page, ctx.model, ctx.schema)).await {
            Ok(Ok(out)) => {
                reply = Some(out);
                break;
            }
            Ok(Err(e)) => {
                warn!(
                    "{} page {}: attempt {} failed: {}",
                    document,
                    ordinal,
                    attempt + 1,
                    e
                );
                let retryable = e.is_retryable();
                last_failure = Some(extraction_error(ordinal, attempt, &e));
                if !retryable {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "{} page {}: attempt {} timed out after {}s",
                    document,
                    ordinal,
                    attempt + 1,
                    config.api_timeout_secs
                );
                last_failure = Some(PageError::Timeout {
                    page: ordinal,
                    secs: config.api_timeout_secs,
                });
            }
        }
        attempt += 1;
    }

    let retries = attempt.min(config.max_retries);
    if let Err(e) = scratch.close() {
        warn!("{} page {}: failed to delete page image: {}", document, ordinal, e);
    }
    let duration_ms = start.elapsed().as_millis() as u64;

    match reply {
        Some(out) => {
            let content = out.content.trim();
            let outcome = if content.is_empty() {
                PageOutcome::Empty
            } else {
                PageOutcome::Content(content.to_string())
            };
            debug!(
                "{} page {}: {} fields, {} tables in {}ms",
                document,
                ordinal,
                out.fields.len(),
                out.tables.len(),
                duration_ms
            );
            PageResult {
                document,
                ordinal,
                outcome,
                fields: out.fields,
                tables: out.tables,
                duration_ms,
                retries,
            }
        }
        None => {
            let error = last_failure.unwrap_or_else(|| PageError::Extraction {
                page: ordinal,
                retries,
                detail: "no attempt was made".to_string(),
            });
            let mut result = PageResult::from_outcome(document, ordinal, PageOutcome::Failed(error));
            result.duration_ms = duration_ms;
            result.retries = retries;
            result
        }
    }
}

fn extraction_error(page: usize, retries: u32, e: &BackendError) -> PageError {
    PageError::Extraction {
        page,
        retries,
        detail: e.to_string(),
    }
}

/// Delay before retry `attempt` (1-based). Saturates instead of overflowing.
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// Resize, encode and write the page image to a temp file in `dir`.
async fn prepare_image(
    unit: PageUnit,
    max_img_size: u32,
    dir: &Path,
) -> Result<NamedTempFile, String> {
    let dir = dir.to_path_buf();
    let ordinal = unit.ordinal;
    tokio::task::spawn_blocking(move || {
        let img = fit_within(unit.image, max_img_size);
        let bytes = encode_png(&img).map_err(|e| format!("PNG encoding failed: {e}"))?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("page-{ordinal:04}-"))
            .suffix(".png")
            .tempfile_in(&dir)
            .map_err(|e| format!("cannot create page image in {}: {e}", dir.display()))?;
        file.write_all(&bytes)
            .and_then(|_| file.flush())
            .map_err(|e| format!("cannot write page image: {e}"))?;
        Ok(file)
    })
    .await
    .map_err(|e| format!("encode task panicked: {e}"))?
}
