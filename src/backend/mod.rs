//! The extraction-backend seam.
//!
//! A backend receives one prepared page image plus the requested schema and
//! returns whatever field values, table rows and content text it found.
//! The pipeline never looks inside the content; it only aggregates it.
//!
//! Two implementations ship with the crate:
//!
//! * [`VlmBackend`]: talks to the supervised OpenAI-compatible server.
//! * [`RemoteBackend`]: calls a UI-layer extraction service over RPC.

pub mod remote;
pub mod vlm;

pub use remote::{DataFrame, RemoteBackend};
pub use vlm::VlmBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Whether a schema item names a scalar field or a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Field,
    Table,
}

impl SchemaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaKind::Field => "field",
            SchemaKind::Table => "table",
        }
    }
}

/// One requested field or table, flattened for transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaItem {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SchemaKind,
    #[serde(default)]
    pub description: String,
}

/// Fields first, then tables, each in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub items: Vec<SchemaItem>,
}

impl ExtractionSchema {
    pub fn from_request(request: &crate::job::ExtractionRequest) -> Self {
        let fields = request.fields.iter().map(|f| SchemaItem {
            name: f.name.clone(),
            kind: SchemaKind::Field,
            description: f.description.clone(),
        });
        let tables = request.tables.iter().map(|t| SchemaItem {
            name: t.name.clone(),
            kind: SchemaKind::Table,
            description: t.description.clone(),
        });
        Self {
            items: fields.chain(tables).collect(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &SchemaItem> {
        self.items.iter().filter(|i| i.kind == SchemaKind::Field)
    }

    pub fn tables(&self) -> impl Iterator<Item = &SchemaItem> {
        self.items.iter().filter(|i| i.kind == SchemaKind::Table)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A page image prepared on disk for a backend call.
#[derive(Debug, Clone, Copy)]
pub struct PageImage<'a> {
    pub document: &'a str,
    /// 1-based page number.
    pub ordinal: usize,
    pub path: &'a Path,
    pub mime_type: &'static str,
}

/// A single field value reported by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Rows reported by a backend for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableValue {
    pub name: String,
    pub rows: Vec<Map<String, Value>>,
}

/// Everything a backend found on one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    /// Free-form page text. Opaque to the pipeline.
    pub content: String,
    pub fields: Vec<FieldValue>,
    pub tables: Vec<TableValue>,
}

/// Failure of a single backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unusable backend response: {0}")]
    InvalidResponse(String),

    #[error("cannot read page image '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    /// Whether repeating the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport { .. } => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::InvalidResponse(_) => true,
            BackendError::Io { .. } => false,
        }
    }
}

/// A service that extracts structured data from one page image.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn extract(
        &self,
        page: &PageImage<'_>,
        model: &str,
        schema: &ExtractionSchema,
    ) -> Result<BackendOutput, BackendError>;
}

/// Read a prepared page image from disk.
pub(crate) async fn read_page(page: &PageImage<'_>) -> Result<Vec<u8>, BackendError> {
    tokio::fs::read(page.path)
        .await
        .map_err(|source| BackendError::Io {
            path: page.path.to_path_buf(),
            source,
        })
}

/// Render a JSON scalar as field text. `null` yields `None`.
pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
