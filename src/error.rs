//! Error types for the docext-worker library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`ExtractError`]: **Fatal** for the operation that returned it: the
//!   supervised server could not be started, a job could not be staged, or no
//!   document in a job produced anything. Job-level errors are folded into a
//!   failure envelope by [`crate::job::JobHandler`] and never escape it.
//!
//! * [`PageError`]: **Non-fatal**: a single page failed (encode glitch,
//!   backend timeout, malformed reply) while its sibling pages carried on.
//!   Stored inside [`crate::output::PageResult`] and rendered as an explicit
//!   marker in the aggregated document content.
//!
//! * [`ValidationError`]: the inbound job payload is malformed. It carries
//!   every violation found, not just the first one.

use crate::supervisor::ServerState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docext-worker library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Request errors ────────────────────────────────────────────────────
    /// The job payload failed validation; nothing was staged.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // ── Supervisor errors ─────────────────────────────────────────────────
    /// The supervised server never answered its health check in time.
    #[error(
        "Extraction server on {host}:{port} did not become ready within {secs}s\n\
The process was stopped. Increase the startup timeout for large models."
    )]
    StartupTimeout { host: String, port: u16, secs: u64 },

    /// The supervised server exited before it ever became ready.
    #[error("Extraction server exited before becoming ready ({status})\n{output}")]
    ProcessCrash { status: String, output: String },

    /// A second server was started while one is still live.
    #[error("An extraction server is already running (pid {pid:?}); stop it first")]
    AlreadyRunning { pid: Option<u32> },

    /// The requested operation makes no sense for the handle's current state.
    #[error("Cannot {operation} a server handle in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    /// The server program could not be spawned at all.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A job arrived before the supervised server reported readiness.
    #[error("Extraction server is not ready (state: {state})")]
    ServerNotReady { state: ServerState },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// A document could not be split into pages. Fatal for that document.
    #[error("Failed to decompose '{document}' into pages: {detail}")]
    PageDecomposition { document: String, detail: String },

    /// Every page of every decomposable document failed in the backend.
    #[error("Extraction backend failed on all {pages} pages\nFirst error: {first_error}")]
    BackendCall { pages: usize, first_error: String },

    /// None of the documents in the job could be decomposed.
    #[error("None of the {total} documents could be processed\nFirst error: {first_error}")]
    NoDocumentsProcessed { total: usize, first_error: String },

    // ── Staging errors ────────────────────────────────────────────────────
    /// One input document could not be decoded or written to disk.
    #[error("Failed to stage document '{document}': {detail}")]
    Staging { document: String, detail: String },

    /// A filesystem operation outside staging failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (task panic, poisoned state).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    /// The envelope category this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Processing,
        }
    }
}

/// Failure category reported in the `error_type` field of a job response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "validation_error")]
    Validation,
    #[serde(rename = "processing_error")]
    Processing,
}

/// Every violation found in one job payload.
///
/// Displayed as a single `; `-joined message so a caller can fix all issues
/// in one round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    /// Whether any recorded violation contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.violations.iter().any(|v| v.contains(needle))
    }
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::output::PageOutcome::Failed`]. The document continues
/// unless every page fails.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// The page raster could not be encoded or written to its scratch file.
    #[error("Page {page}: could not prepare page image: {detail}")]
    Encode { page: usize, detail: String },

    /// The backend call failed after retries.
    #[error("Page {page}: extraction failed after {retries} retries: {detail}")]
    Extraction {
        page: usize,
        retries: u32,
        detail: String,
    },

    /// The backend call timed out on its final attempt.
    #[error("Page {page}: extraction timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },
}

impl PageError {
    /// Short human-readable reason, without the page prefix.
    pub fn reason(&self) -> String {
        match self {
            PageError::Encode { detail, .. } => detail.clone(),
            PageError::Extraction { detail, .. } => detail.clone(),
            PageError::Timeout { secs, .. } => format!("timed out after {secs}s"),
        }
    }
}

/// Render an error and its `source()` chain, one cause per line.
///
/// Used as the diagnostic detail of processing-failure envelopes.
pub fn diagnostic_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = format!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\ncaused by: {cause}"));
        source = cause.source();
    }
    out
}
