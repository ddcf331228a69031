//! Response envelopes written back to the caller.

use crate::error::{diagnostic_chain, ErrorKind, ExtractError};
use crate::output::{DocumentProvenance, ExtractionResult, FieldResult, TableRow};
use serde::{Deserialize, Serialize};

/// Success or failure envelope; serialised without a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    Success(SuccessEnvelope),
    Failure(FailureEnvelope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEnvelope {
    pub success: bool,
    pub fields: Vec<FieldResult>,
    pub tables: Vec<TableRow>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub num_documents: usize,
    pub num_fields: usize,
    pub num_tables: usize,
    pub num_pages: usize,
    pub model_used: String,
    pub documents: Vec<DocumentProvenance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEnvelope {
    pub success: bool,
    pub error: String,
    pub error_type: ErrorKind,
    /// Error and cause chain; processing failures only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl JobResponse {
    pub fn success(
        result: ExtractionResult,
        num_fields: usize,
        num_tables: usize,
        model_used: impl Into<String>,
    ) -> Self {
        JobResponse::Success(SuccessEnvelope {
            success: true,
            metadata: ResponseMetadata {
                num_documents: result.documents.len(),
                num_fields,
                num_tables,
                num_pages: result.num_pages(),
                model_used: model_used.into(),
                documents: result.documents,
            },
            fields: result.fields,
            tables: result.tables,
        })
    }

    /// The envelope for `err`, categorised by its [`ErrorKind`].
    pub fn failure(err: &ExtractError) -> Self {
        let traceback = match err.kind() {
            ErrorKind::Validation => None,
            ErrorKind::Processing => Some(diagnostic_chain(err)),
        };
        JobResponse::Failure(FailureEnvelope {
            success: false,
            error: err.to_string(),
            error_type: err.kind(),
            traceback,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResponse::Success(_))
    }

    pub fn error_type(&self) -> Option<ErrorKind> {
        match self {
            JobResponse::Success(_) => None,
            JobResponse::Failure(f) => Some(f.error_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::supervisor::ServerState;

    #[test]
    fn validation_failure_has_no_traceback() {
        let err: ExtractError = ValidationError::new(vec!["'files' list cannot be empty".into()]).into();
        let v = serde_json::to_value(JobResponse::failure(&err)).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error_type"], "validation_error");
        assert_eq!(v["error"], "'files' list cannot be empty");
        assert!(v.get("traceback").is_none());
    }

    #[test]
    fn processing_failure_carries_traceback() {
        let err = ExtractError::ServerNotReady {
            state: ServerState::Starting,
        };
        let resp = JobResponse::failure(&err);
        assert_eq!(resp.error_type(), Some(ErrorKind::Processing));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v["traceback"].as_str().unwrap().starts_with("error: "));
    }

    #[test]
    fn success_metadata_counts() {
        let result = ExtractionResult {
            fields: vec![],
            tables: vec![],
            documents: vec![
                DocumentProvenance {
                    filename: "a.pdf".into(),
                    num_pages: 2,
                    failed_pages: vec![],
                    content: "x".into(),
                    error: None,
                },
                DocumentProvenance {
                    filename: "b.png".into(),
                    num_pages: 1,
                    failed_pages: vec![1],
                    content: "y".into(),
                    error: None,
                },
            ],
        };
        let v = serde_json::to_value(JobResponse::success(result, 3, 1, "m")).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["metadata"]["num_documents"], 2);
        assert_eq!(v["metadata"]["num_pages"], 3);
        assert_eq!(v["metadata"]["num_fields"], 3);
        assert_eq!(v["metadata"]["model_used"], "m");
        assert!(v["metadata"]["documents"][0].get("error").is_none());
    }
}
