//! Merging per-page backend results into one job result.
//!
//! Fields: for each requested field, in request order, the first non-empty
//! value in document order then page order. Tables: rows grouped per
//! requested table in request order, each group in document/page order.
//! Names the request did not ask for are dropped.

use super::request::ExtractionRequest;
use crate::output::{DocumentContent, FieldResult, TableRow};
use std::collections::BTreeSet;
use tracing::warn;

/// Merge the documents' page results, in the order given.
pub fn merge(
    request: &ExtractionRequest,
    documents: &[&DocumentContent],
) -> (Vec<FieldResult>, Vec<TableRow>) {
    let mut unknown: BTreeSet<String> = BTreeSet::new();

    for doc in documents {
        for page in &doc.pages {
            for f in &page.fields {
                if !request.fields.iter().any(|spec| spec.name == f.name) {
                    unknown.insert(format!("field '{}'", f.name));
                }
            }
            for t in &page.tables {
                if !request.tables.iter().any(|spec| spec.name == t.name) {
                    unknown.insert(format!("table '{}'", t.name));
                }
            }
        }
    }
    if !unknown.is_empty() {
        warn!(
            "Dropping results for names that were not requested: {}",
            unknown.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    let fields = request
        .fields
        .iter()
        .map(|spec| {
            let found = documents.iter().find_map(|doc| {
                doc.pages.iter().find_map(|page| {
                    page.fields
                        .iter()
                        .find(|f| f.name == spec.name && !f.value.trim().is_empty())
                        .map(|f| (doc.document.as_str(), page.ordinal, f))
                })
            });
            match found {
                Some((document, page, f)) => FieldResult {
                    name: spec.name.clone(),
                    value: Some(f.value.trim().to_string()),
                    confidence: f.confidence,
                    document: Some(document.to_string()),
                    page: Some(page),
                },
                None => FieldResult {
                    name: spec.name.clone(),
                    value: None,
                    confidence: None,
                    document: None,
                    page: None,
                },
            }
        })
        .collect();

    let mut tables = Vec::new();
    for spec in &request.tables {
        for doc in documents {
            for page in &doc.pages {
                for t in page.tables.iter().filter(|t| t.name == spec.name) {
                    tables.extend(t.rows.iter().map(|row| TableRow {
                        table: spec.name.clone(),
                        row: row.clone(),
                        document: doc.document.clone(),
                        page: page.ordinal,
                    }));
                }
            }
        }
    }

    (fields, tables)
}
