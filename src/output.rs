//! Value types produced by the page pipeline and the job handler.

use crate::backend::{FieldValue, TableValue};
use crate::error::PageError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One page of a decomposed document, ready for extraction.
#[derive(Debug, Clone)]
pub struct PageUnit {
    /// Name of the document this page came from.
    pub document: String,
    /// 1-based page number.
    pub ordinal: usize,
    pub image: DynamicImage,
}

/// What the backend produced for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PageOutcome {
    /// Non-blank content text.
    Content(String),
    /// The backend answered, but with nothing but whitespace.
    Empty,
    /// The page failed after all retries.
    Failed(PageError),
}

impl PageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PageOutcome::Failed(_))
    }
}

/// Result of extracting one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub document: String,
    /// 1-based page number.
    pub ordinal: usize,
    pub outcome: PageOutcome,
    /// Field values the backend reported for this page.
    #[serde(default)]
    pub fields: Vec<FieldValue>,
    /// Table rows the backend reported for this page, grouped by table.
    #[serde(default)]
    pub tables: Vec<TableValue>,
    /// Wall-clock time spent on this page, retries included.
    pub duration_ms: u64,
    /// Retry attempts used (0 means the first attempt settled it).
    pub retries: u32,
}

impl PageResult {
    /// A result carrying only an outcome.
    pub fn from_outcome(document: impl Into<String>, ordinal: usize, outcome: PageOutcome) -> Self {
        Self {
            document: document.into(),
            ordinal,
            outcome,
            fields: Vec::new(),
            tables: Vec::new(),
            duration_ms: 0,
            retries: 0,
        }
    }

    pub fn error(&self) -> Option<&PageError> {
        match &self.outcome {
            PageOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Aggregated output for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContent {
    pub document: String,
    pub page_count: usize,
    /// Page sections joined in page order, or the no-content sentinel.
    pub content: String,
    pub pages: Vec<PageResult>,
}

impl DocumentContent {
    pub fn failed_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.outcome.is_failed())
            .map(|p| p.ordinal)
            .collect()
    }

    /// True when every page failed.
    pub fn all_failed(&self) -> bool {
        !self.pages.is_empty() && self.pages.iter().all(|p| p.outcome.is_failed())
    }
}

/// One requested field and the value found for it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    pub name: String,
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Document the value came from.
    pub document: Option<String>,
    /// Page the value came from.
    pub page: Option<usize>,
}

/// One row of a requested table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub table: String,
    pub row: Map<String, Value>,
    pub document: String,
    pub page: usize,
}

/// Per-document provenance reported in the response metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProvenance {
    pub filename: String,
    pub num_pages: usize,
    pub failed_pages: Vec<usize>,
    pub content: String,
    /// Set when the document could not be decomposed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Merged output of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: Vec<FieldResult>,
    pub tables: Vec<TableRow>,
    pub documents: Vec<DocumentProvenance>,
}

impl ExtractionResult {
    pub fn num_pages(&self) -> usize {
        self.documents.iter().map(|d| d.num_pages).sum()
    }
}
