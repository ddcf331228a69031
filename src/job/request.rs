//! Inbound job payload: typed request and its validation.
//!
//! Validation runs on the raw JSON so every problem in the payload can be
//! reported at once, instead of stopping at the first serde error.

use crate::config::WorkerConfig;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Filename used when a file entry carries none.
pub const DEFAULT_FILENAME: &str = "document";

/// A requested scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A requested table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One input document as sent by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDocument {
    pub filename: String,
    /// Base64 payload, optionally prefixed by a `data:...;base64,` URI header.
    pub data: String,
}

/// A validated extraction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub files: Vec<InputDocument>,
    pub fields: Vec<FieldSpec>,
    pub tables: Vec<TableSpec>,
    pub max_img_size: u32,
    pub model_name: String,
}

/// The payload of a job, unwrapping an optional `{"input": ...}` envelope.
pub fn job_input(job: &Value) -> &Value {
    match job.get("input") {
        Some(inner) if job.as_object().is_some_and(|o| o.len() == 1) => inner,
        _ => job,
    }
}

/// Check `payload` and build the typed request, reporting every violation.
pub fn validate(payload: &Value, defaults: &WorkerConfig) -> Result<ExtractionRequest, ValidationError> {
    let Some(obj) = payload.as_object() else {
        return Err(ValidationError::new(vec![
            "Request payload must be a JSON object".to_string(),
        ]));
    };

    let mut errors = Vec::new();
    let files = validate_files(obj, &mut errors);
    let fields = validate_specs(obj, "fields", "Field", "field", &mut errors);
    let tables = validate_specs(obj, "tables", "Table", "table", &mut errors);

    let field_count = obj.get("fields").and_then(Value::as_array).map_or(0, Vec::len);
    let table_count = obj.get("tables").and_then(Value::as_array).map_or(0, Vec::len);
    if field_count == 0 && table_count == 0 {
        errors.push("At least one field or table must be specified".to_string());
    }

    let max_img_size = match obj.get("max_img_size") {
        None | Some(Value::Null) => defaults.default_max_img_size,
        Some(v) => match v.as_u64() {
            Some(n) if (32..=u32::MAX as u64).contains(&n) => n as u32,
            _ => {
                errors.push(format!("'max_img_size' must be an integer ≥ 32, got {v}"));
                defaults.default_max_img_size
            }
        },
    };

    let model_name = match obj.get("model_name") {
        None | Some(Value::Null) => defaults.default_model.clone(),
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(_) => {
            errors.push("'model_name' must be a non-empty string".to_string());
            defaults.default_model.clone()
        }
    };

    if !errors.is_empty() {
        return Err(ValidationError::new(errors));
    }

    Ok(ExtractionRequest {
        files,
        fields: fields
            .into_iter()
            .map(|(name, description)| FieldSpec { name, description })
            .collect(),
        tables: tables
            .into_iter()
            .map(|(name, description)| TableSpec { name, description })
            .collect(),
        max_img_size,
        model_name,
    })
}

fn validate_files(obj: &Map<String, Value>, errors: &mut Vec<String>) -> Vec<InputDocument> {
    let list = match obj.get("files") {
        None => {
            errors.push("Missing required field: 'files'".to_string());
            return Vec::new();
        }
        Some(Value::Array(list)) => list,
        Some(_) => {
            errors.push("'files' must be a list".to_string());
            return Vec::new();
        }
    };
    if list.is_empty() {
        errors.push("'files' list cannot be empty".to_string());
    }

    let mut files = Vec::with_capacity(list.len());
    for (i, entry) in list.iter().enumerate() {
        let Some(file) = entry.as_object() else {
            errors.push(format!("File at index {i} must be a dictionary"));
            continue;
        };
        let data = match file.get("data") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => {
                errors.push(format!("File at index {i} has empty 'data'"));
                continue;
            }
            Some(_) => {
                errors.push(format!("File at index {i} 'data' must be a base64 string"));
                continue;
            }
            None => {
                errors.push(format!("File at index {i} missing required 'data' property"));
                continue;
            }
        };
        let filename = match file.get("filename") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            None | Some(Value::Null) => DEFAULT_FILENAME.to_string(),
            Some(Value::String(_)) => DEFAULT_FILENAME.to_string(),
            Some(_) => {
                errors.push(format!("File at index {i} 'filename' must be a string"));
                continue;
            }
        };
        files.push(InputDocument { filename, data });
    }
    files
}

/// Validate the `fields` or `tables` list; returns `(name, description)` pairs.
fn validate_specs(
    obj: &Map<String, Value>,
    key: &str,
    label: &str,
    noun: &str,
    errors: &mut Vec<String>,
) -> Vec<(String, String)> {
    let list = match obj.get(key) {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(list)) => list,
        Some(_) => {
            errors.push(format!("'{key}' must be a list"));
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(list.len());
    for (i, entry) in list.iter().enumerate() {
        let Some(spec) = entry.as_object() else {
            errors.push(format!("{label} at index {i} must be a dictionary"));
            continue;
        };
        let name = match spec.get("name") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::String(_)) => {
                errors.push(format!("{label} at index {i} has an empty 'name'"));
                continue;
            }
            Some(_) => {
                errors.push(format!("{label} at index {i} 'name' must be a string"));
                continue;
            }
            None => {
                errors.push(format!("{label} at index {i} missing required 'name' property"));
                continue;
            }
        };
        if !seen.insert(name.clone()) {
            errors.push(format!("Duplicate {noun} name '{name}'"));
            continue;
        }
        let description = spec
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        specs.push((name, description));
    }
    specs
}
