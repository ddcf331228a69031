//! RPC client for a UI-layer extraction service.
//!
//! The service exposes `POST <base>/extract_information` and speaks in
//! data frames: `{headers: [...], data: [[...]], metadata: null}`. The schema
//! goes out as a `name | type | description` frame; results come back as a
//! fields frame and a tables frame, either in an object
//! (`{"fields": ..., "tables": ...}`) or as a two-element array.

use super::{
    read_page, value_text, BackendError, BackendOutput, ExtractionBackend, ExtractionSchema,
    FieldValue, PageImage, TableValue,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Tabular transport shape used by the extraction service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub headers: Vec<String>,
    pub data: Vec<Vec<Value>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl DataFrame {
    /// The schema as a `name | type | description` frame.
    pub fn from_schema(schema: &ExtractionSchema) -> Self {
        Self {
            headers: vec!["name".into(), "type".into(), "description".into()],
            data: schema
                .items
                .iter()
                .map(|i| {
                    vec![
                        Value::from(i.name.as_str()),
                        Value::from(i.kind.as_str()),
                        Value::from(i.description.as_str()),
                    ]
                })
                .collect(),
            metadata: None,
        }
    }

    /// One map per row, keyed by header. Short rows yield `null` cells.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.data
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .enumerate()
                    .map(|(i, h)| (h.clone(), row.get(i).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect()
    }
}

/// Client for the remote extraction service.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
    auth: Option<(String, String)>,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|source| BackendError::Transport {
                endpoint: base_url.clone(),
                source,
            })?;
        Ok(Self {
            client,
            base_url,
            auth: None,
        })
    }

    /// Send HTTP basic credentials with every call.
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/extract_information", self.base_url)
    }
}

#[async_trait]
impl ExtractionBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn extract(
        &self,
        page: &PageImage<'_>,
        model: &str,
        schema: &ExtractionSchema,
    ) -> Result<BackendOutput, BackendError> {
        let bytes = read_page(page).await?;
        let filename = page
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("page-{}.png", page.ordinal));

        let body = json!({
            "file_inputs": [{ "filename": filename, "data": STANDARD.encode(&bytes) }],
            "model_name": model,
            "fields_and_tables": DataFrame::from_schema(schema),
        });

        let endpoint = self.endpoint();
        let mut req = self.client.post(&endpoint).json(&body);
        if let Some((user, password)) = &self.auth {
            req = req.basic_auth(user, Some(password));
        }

        let resp = req.send().await.map_err(|source| BackendError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }
        let reply: Value = resp.json().await.map_err(|source| BackendError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;

        let out = parse_reply(&reply, schema)?;
        debug!(
            "{} page {}: {} fields, {} tables from remote service",
            page.document,
            page.ordinal,
            out.fields.len(),
            out.tables.len()
        );
        Ok(out)
    }
}

/// Convert the service reply into a [`BackendOutput`].
pub fn parse_reply(reply: &Value, schema: &ExtractionSchema) -> Result<BackendOutput, BackendError> {
    let (fields, tables, content) = match reply {
        Value::Array(parts) if parts.len() == 2 => (Some(&parts[0]), Some(&parts[1]), None),
        Value::Object(obj) => (obj.get("fields"), obj.get("tables"), obj.get("content")),
        other => {
            return Err(BackendError::InvalidResponse(format!(
                "expected an object or a [fields, tables] pair, got {}",
                json_kind(other)
            )))
        }
    };

    let fields = match fields {
        Some(v) if !v.is_null() => field_values(&frame(v, "fields")?),
        _ => Vec::new(),
    };
    let tables = match tables {
        Some(v) if !v.is_null() => table_values(&frame(v, "tables")?, schema),
        _ => Vec::new(),
    };

    Ok(BackendOutput {
        content: content.and_then(value_text).unwrap_or_default(),
        fields,
        tables,
    })
}

fn frame(value: &Value, what: &str) -> Result<DataFrame, BackendError> {
    serde_json::from_value(value.clone())
        .map_err(|e| BackendError::InvalidResponse(format!("{what} is not a data frame: {e}")))
}

fn first_text(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| record.get(*k).and_then(value_text))
        .filter(|s| !s.trim().is_empty())
}

fn field_values(frame: &DataFrame) -> Vec<FieldValue> {
    frame
        .records()
        .iter()
        .filter_map(|r| {
            let name = first_text(r, &["name", "fields", "field"])?;
            let value = first_text(r, &["value", "answer"])?;
            let confidence = r
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c as f32);
            Some(FieldValue {
                name,
                value,
                confidence,
            })
        })
        .collect()
}

/// Group table rows by their `table` column.
///
/// Rows without one are attributed to the only requested table, or dropped
/// when the request named several.
fn table_values(frame: &DataFrame, schema: &ExtractionSchema) -> Vec<TableValue> {
    let requested: Vec<&str> = schema.tables().map(|t| t.name.as_str()).collect();
    let mut grouped: Vec<TableValue> = Vec::new();
    let mut dropped = 0usize;

    for mut record in frame.records() {
        let name = match record.remove("table").as_ref().and_then(value_text) {
            Some(n) => n,
            None if requested.len() == 1 => requested[0].to_string(),
            None => {
                dropped += 1;
                continue;
            }
        };
        match grouped.iter_mut().find(|t| t.name == name) {
            Some(t) => t.rows.push(record),
            None => grouped.push(TableValue {
                name,
                rows: vec![record],
            }),
        }
    }

    if dropped > 0 {
        warn!(
            "Dropped {} table rows with no 'table' column ({} tables requested)",
            dropped,
            requested.len()
        );
    }
    grouped
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
