//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::WorkerConfigBuilder::progress_callback`] to receive
//! events as the pipeline processes each page of each document.
//!
//! # Example
//!
//! ```rust
//! use docext_worker::{ExtractionProgressCallback, WorkerConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FailureCounter {
//!     failed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for FailureCounter {
//!     fn on_page_error(&self, document: &str, page: usize, _total: usize, error: &str) {
//!         self.failed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{document} page {page}: {error}");
//!     }
//! }
//!
//! let counter = Arc::new(FailureCounter { failed: AtomicUsize::new(0) });
//! let config = WorkerConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the page pipeline as it processes each document.
///
/// Implementations must be `Send + Sync`: with `page_concurrency > 1` the
/// page events of one document may arrive concurrently and out of order.
/// All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once per document after it has been decomposed.
    fn on_document_start(&self, document: &str, total_pages: usize) {
        let _ = (document, total_pages);
    }

    /// Called just before a page is submitted to the backend.
    fn on_page_start(&self, document: &str, page: usize, total_pages: usize) {
        let _ = (document, page, total_pages);
    }

    /// Called when a page produced a result (content or an empty marker).
    fn on_page_complete(&self, document: &str, page: usize, total_pages: usize, content_len: usize) {
        let _ = (document, page, total_pages, content_len);
    }

    /// Called when a page failed after all retries.
    fn on_page_error(&self, document: &str, page: usize, total_pages: usize, error: &str) {
        let _ = (document, page, total_pages, error);
    }

    /// Called once per document after every page has been attempted.
    fn on_document_complete(&self, document: &str, total_pages: usize, success_count: usize) {
        let _ = (document, total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::WorkerConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ExtractionProgressCallback for Tracking {
        fn on_page_start(&self, _d: &str, _p: usize, _t: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _d: &str, _p: usize, _t: usize, _len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _d: &str, _p: usize, _t: usize, _e: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_document_start("a.pdf", 2);
        cb.on_page_start("a.pdf", 1, 2);
        cb.on_page_complete("a.pdf", 1, 2, 10);
        cb.on_page_error("a.pdf", 2, 2, "boom");
        cb.on_document_complete("a.pdf", 2, 1);
    }

    #[test]
    fn tracking_callback_through_arc_dyn() {
        let tracker = Arc::new(Tracking::default());
        let cb: ProgressCallback = tracker.clone();
        cb.on_page_start("a.pdf", 1, 2);
        cb.on_page_complete("a.pdf", 1, 2, 12);
        cb.on_page_start("a.pdf", 2, 2);
        cb.on_page_error("a.pdf", 2, 2, "timeout");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
