//! The top-level job orchestrator.

use super::merge::merge;
use super::request::{job_input, validate, ExtractionRequest};
use super::response::JobResponse;
use super::staging::StagingArea;
use crate::backend::{ExtractionBackend, ExtractionSchema};
use crate::config::WorkerConfig;
use crate::error::{ExtractError, ValidationError};
use crate::output::{DocumentContent, DocumentProvenance, ExtractionResult};
use crate::pipeline::{ExtractionContext, PageExtractionPipeline};
use crate::supervisor::ServerState;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Validates, stages, runs and answers one job at a time per call.
///
/// Holds no per-request state, so one handler may serve concurrent calls;
/// each call stages into its own temp directory.
pub struct JobHandler {
    backend: Arc<dyn ExtractionBackend>,
    readiness: watch::Receiver<ServerState>,
    config: WorkerConfig,
}

impl JobHandler {
    /// `readiness` is usually [`crate::ServerProcessHandle::subscribe`]; use
    /// [`ServerState::ready_signal`] when no supervised server is involved.
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        readiness: watch::Receiver<ServerState>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            backend,
            readiness,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Check the raw payload and build the typed request.
    pub fn validate(&self, payload: &Value) -> Result<ExtractionRequest, ValidationError> {
        validate(payload, &self.config)
    }

    /// Decode every document into a fresh staging area.
    ///
    /// On failure whatever was already staged is cleaned up before the
    /// error is returned.
    pub async fn stage(&self, request: &ExtractionRequest) -> Result<StagingArea, ExtractError> {
        let mut area = StagingArea::create(self.config.temp_root.as_deref())?;
        for (index, doc) in request.files.iter().enumerate() {
            if let Err(e) = area.stage(index, doc).await {
                let report = area.cleanup();
                if !report.is_complete() {
                    warn!(
                        "Partial staging cleanup incomplete: {}/{} deleted",
                        report.deleted, report.allocated
                    );
                }
                return Err(e);
            }
        }
        Ok(area)
    }

    /// Run the pipeline over every staged document and merge the results.
    pub async fn invoke(
        &self,
        request: &ExtractionRequest,
        staging: &StagingArea,
    ) -> Result<ExtractionResult, ExtractError> {
        let state = *self.readiness.borrow();
        if state != ServerState::Ready {
            return Err(ExtractError::ServerNotReady { state });
        }

        let schema = ExtractionSchema::from_request(request);
        let ctx = ExtractionContext {
            schema: &schema,
            model: &request.model_name,
            max_img_size: request.max_img_size,
            scratch_dir: staging.path(),
        };
        let pipeline = PageExtractionPipeline::new(self.backend.as_ref(), &self.config);

        let mut contents: Vec<DocumentContent> = Vec::new();
        let mut provenance = Vec::with_capacity(staging.resources().len());
        let mut first_doc_error: Option<String> = None;

        for resource in staging.resources() {
            match pipeline.run(&resource.path, &resource.document, &ctx).await {
                Ok(content) => {
                    provenance.push(DocumentProvenance {
                        filename: content.document.clone(),
                        num_pages: content.page_count,
                        failed_pages: content.failed_pages(),
                        content: content.content.clone(),
                        error: None,
                    });
                    contents.push(content);
                }
                Err(e) => {
                    warn!("Skipping document '{}': {}", resource.document, e);
                    first_doc_error.get_or_insert_with(|| e.to_string());
                    provenance.push(DocumentProvenance {
                        filename: resource.document.clone(),
                        num_pages: 0,
                        failed_pages: Vec::new(),
                        content: String::new(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if contents.is_empty() {
            return Err(ExtractError::NoDocumentsProcessed {
                total: staging.resources().len(),
                first_error: first_doc_error.unwrap_or_else(|| "no documents staged".to_string()),
            });
        }

        if contents.iter().all(DocumentContent::all_failed) {
            let pages = contents.iter().map(|c| c.page_count).sum();
            let first_error = contents
                .iter()
                .flat_map(|c| c.pages.iter())
                .find_map(|p| p.error())
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(ExtractError::BackendCall { pages, first_error });
        }

        let refs: Vec<&DocumentContent> = contents.iter().collect();
        let (fields, tables) = merge(request, &refs);

        Ok(ExtractionResult {
            fields,
            tables,
            documents: provenance,
        })
    }

    /// Process one job payload end to end. Never fails; errors become
    /// failure envelopes. Staged files are removed on every path.
    pub async fn handle(&self, job: &Value) -> JobResponse {
        let started = Instant::now();
        let payload = job_input(job);

        let request = match self.validate(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("Rejected job: {}", e);
                return JobResponse::failure(&e.into());
            }
        };
        info!(
            "Job: {} document(s), {} field(s), {} table(s), model {}",
            request.files.len(),
            request.fields.len(),
            request.tables.len(),
            request.model_name
        );

        let staging = match self.stage(&request).await {
            Ok(s) => s,
            Err(e) => {
                error!("Staging failed: {}", e);
                return JobResponse::failure(&e);
            }
        };

        let outcome = AssertUnwindSafe(self.invoke(&request, &staging))
            .catch_unwind()
            .await;

        let report = staging.cleanup();
        if report.is_complete() && report.warnings.is_empty() {
            info!("Cleaned up {} staged file(s)", report.deleted);
        } else {
            warn!(
                "Cleanup deleted {}/{} staged file(s) with {} warning(s)",
                report.deleted,
                report.allocated,
                report.warnings.len()
            );
        }

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(ExtractError::Internal(format!(
                "extraction panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match result {
            Ok(result) => {
                info!(
                    "Job done in {:.1}s: {} field(s), {} table row(s)",
                    started.elapsed().as_secs_f64(),
                    result.fields.len(),
                    result.tables.len()
                );
                JobResponse::success(
                    result,
                    request.fields.len(),
                    request.tables.len(),
                    request.model_name.clone(),
                )
            }
            Err(e) => {
                error!("Job failed: {}", e);
                JobResponse::failure(&e)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
