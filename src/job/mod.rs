//! Job handling: validate → stage → invoke → respond → clean up.
//!
//! ```text
//! JSON payload ──▶ validate ──▶ stage (TempDir) ──▶ pipeline per document
//!                     │              │                     │
//!                     ▼              ▼                     ▼
//!             validation_error  processing_error     merge → success
//!                                    └──── cleanup runs on every path ────┘
//! ```

mod handler;
pub mod merge;
pub mod request;
pub mod response;
pub mod staging;

pub use handler::JobHandler;
pub use request::{job_input, ExtractionRequest, FieldSpec, InputDocument, TableSpec};
pub use response::{FailureEnvelope, JobResponse, ResponseMetadata, SuccessEnvelope};
pub use staging::{CleanupReport, StagingArea, TempResource};
