//! Backend that queries the supervised OpenAI-compatible server directly.
//!
//! Each page becomes one `/v1/chat/completions` request: the extraction
//! system prompt, then a user turn holding the schema text and the page as a
//! base64 PNG data URI. The model is asked for a single JSON object,
//!
//! ```text
//! {"content": "...", "fields": {"name": "value"}, "tables": {"name": [{"col": "v"}]}}
//! ```
//!
//! which [`parse_reply`] turns back into a [`BackendOutput`].

use super::{
    read_page, value_text, BackendError, BackendOutput, ExtractionBackend, ExtractionSchema,
    FieldValue, PageImage, TableValue,
};
use crate::config::{ServerConfig, WorkerConfig, HOSTED_PREFIX};
use crate::pipeline::encode::data_uri;
use crate::pipeline::postprocess::{clean_model_text, extract_json_object};
use crate::prompts::{schema_instruction, EXTRACTION_SYSTEM_PROMPT};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Client for the local vision-language server.
#[derive(Debug, Clone)]
pub struct VlmBackend {
    client: reqwest::Client,
    base_url: String,
    temperature: f32,
    max_tokens: usize,
}

impl VlmBackend {
    pub fn new(
        base_url: impl Into<String>,
        temperature: f32,
        max_tokens: usize,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
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
            temperature,
            max_tokens,
        })
    }

    /// A backend pointed at the server described by `server`.
    pub fn for_server(server: &ServerConfig, worker: &WorkerConfig) -> Result<Self, BackendError> {
        Self::new(
            server.base_url(),
            worker.temperature,
            worker.max_tokens,
            Duration::from_secs(worker.api_timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request_body(&self, model: &str, schema: &ExtractionSchema, image_uri: String) -> Value {
        json!({
            "model": model.strip_prefix(HOSTED_PREFIX).unwrap_or(model),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": EXTRACTION_SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": schema_instruction(schema) },
                        { "type": "image_url", "image_url": { "url": image_uri } }
                    ]
                }
            ]
        })
    }
}

#[async_trait]
impl ExtractionBackend for VlmBackend {
    fn name(&self) -> &str {
        "vlm"
    }

    async fn extract(
        &self,
        page: &PageImage<'_>,
        model: &str,
        schema: &ExtractionSchema,
    ) -> Result<BackendOutput, BackendError> {
        let bytes = read_page(page).await?;
        let body = self.request_body(model, schema, data_uri(&bytes, page.mime_type));
        let endpoint = self.endpoint();

        let resp = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
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
        let text = reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackendError::InvalidResponse("reply has no choices[0].message.content".into())
            })?;

        debug!(
            "{} page {}: {} chars of model reply",
            page.document,
            page.ordinal,
            text.len()
        );
        Ok(parse_reply(text))
    }
}

/// Interpret a model reply.
///
/// A reply that carries no JSON object is kept whole as page content.
pub fn parse_reply(text: &str) -> BackendOutput {
    let Some(Value::Object(obj)) = extract_json_object(text) else {
        warn!("Model reply is not a JSON object; keeping it as plain content");
        return BackendOutput {
            content: clean_model_text(text),
            ..Default::default()
        };
    };

    let content = obj
        .get("content")
        .and_then(value_text)
        .map(|c| clean_model_text(&c))
        .unwrap_or_default();

    BackendOutput {
        content,
        fields: obj.get("fields").map(parse_fields).unwrap_or_default(),
        tables: obj.get("tables").map(parse_tables).unwrap_or_default(),
    }
}

fn parse_fields(value: &Value) -> Vec<FieldValue> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(name, v)| {
                value_text(v).map(|value| FieldValue {
                    name: name.clone(),
                    value,
                    confidence: None,
                })
            })
            .collect(),
        // [{"name": ..., "value": ..., "confidence": ...}]
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?.to_string();
                let value = value_text(item.get("value")?)?;
                let confidence = item
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .map(|c| c as f32);
                Some(FieldValue {
                    name,
                    value,
                    confidence,
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_tables(value: &Value) -> Vec<TableValue> {
    let Value::Object(map) = value else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(name, rows)| {
            let rows: Vec<Map<String, Value>> = rows
                .as_array()?
                .iter()
                .filter_map(|r| r.as_object().cloned())
                .collect();
            Some(TableValue {
                name: name.clone(),
                rows,
            })
        })
        .collect()
}
