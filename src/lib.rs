//! # docext-worker
//!
//! Extract structured fields and tables from documents with a locally served
//! vision-language model.
//!
//! The crate has three parts that are built to work together:
//!
//! * a **process supervisor** that launches a slow-starting model server,
//!   waits for it under a hard deadline and shuts it down cleanly;
//! * a **page pipeline** that splits a document into pages, sends each one
//!   to an extraction backend and keeps going when individual pages fail;
//! * a **job handler** that validates a JSON request, stages its documents
//!   in a private temp directory, runs the pipeline and always cleans up.
//!
//! ## Pipeline Overview
//!
//! ```text
//! job JSON
//!  │
//!  ├─ 1. Validate  accumulate every payload violation
//!  ├─ 2. Stage     base64 → files in a request-scoped TempDir
//!  ├─ 3. Gate      server state must be Ready (watch channel)
//!  ├─ 4. Pages     pdfium / image decode (spawn_blocking)
//!  ├─ 5. Extract   per-page backend call, retries, isolated failures
//!  ├─ 6. Merge     fields and table rows in request order
//!  └─ 7. Respond   success / validation_error / processing_error
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docext_worker::{JobHandler, ProcessSupervisor, ServerConfig, VlmBackend, WorkerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ServerConfig::default();
//!     let worker = WorkerConfig::default();
//!
//!     let supervisor = ProcessSupervisor::new(server.clone())?;
//!     let mut handle = supervisor.run_until_ready().await?;
//!
//!     let backend = Arc::new(VlmBackend::for_server(&server, &worker)?);
//!     let handler = JobHandler::new(backend, handle.subscribe(), worker);
//!
//!     let job = serde_json::json!({
//!         "files": [{"filename": "invoice.pdf", "data": "JVBERi0xLjcK..."}],
//!         "fields": [{"name": "invoice_number", "description": "The invoice number"}]
//!     });
//!     println!("{}", serde_json::to_string(&handler.handle(&job).await)?);
//!
//!     supervisor.stop(&mut handle).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docext-worker` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docext-worker = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod supervisor;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{
    BackendError, BackendOutput, ExtractionBackend, ExtractionSchema, RemoteBackend, SchemaItem,
    SchemaKind, VlmBackend,
};
pub use config::{DeviceMode, Dtype, ServerConfig, ServerConfigBuilder, WorkerConfig, WorkerConfigBuilder};
pub use error::{ErrorKind, ExtractError, PageError, ValidationError};
pub use job::{ExtractionRequest, JobHandler, JobResponse, StagingArea};
pub use output::{
    DocumentContent, DocumentProvenance, ExtractionResult, FieldResult, PageOutcome, PageResult,
    PageUnit, TableRow,
};
pub use pipeline::{ExtractionContext, PageExtractionPipeline};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use supervisor::{ProcessSupervisor, ServeCommand, ServerProcessHandle, ServerState};
