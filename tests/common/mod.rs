//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use docext_worker::backend::{
    BackendError, BackendOutput, ExtractionBackend, ExtractionSchema, FieldValue, PageImage,
    TableValue,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ── Documents ────────────────────────────────────────────────────────────────

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb([200, 200, 200]),
    ));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

pub fn png_base64(width: u32, height: u32) -> String {
    STANDARD.encode(png_bytes(width, height))
}

// ── Scripted backend ─────────────────────────────────────────────────────────

/// What the backend does for one (document, page).
#[derive(Clone)]
pub enum Script {
    Reply(BackendOutput),
    /// Always fail with a retryable error.
    Fail(String),
    /// Wait before replying with the default output.
    Delay(Duration),
    Panic,
}

/// One recorded backend call.
#[derive(Debug, Clone)]
pub struct Call {
    pub document: String,
    pub ordinal: usize,
    pub path: PathBuf,
    pub file_existed: bool,
    pub model: String,
}

/// A fake backend driven by per-page scripts.
///
/// Unscripted pages reply with content `text of <document> p<ordinal>`.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: HashMap<(String, usize), Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, document: &str, ordinal: usize, script: Script) -> Self {
        self.scripts.insert((document.to_string(), ordinal), script);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn reply(content: &str, fields: &[(&str, &str)], tables: Vec<TableValue>) -> BackendOutput {
    BackendOutput {
        content: content.to_string(),
        fields: fields
            .iter()
            .map(|(n, v)| FieldValue {
                name: n.to_string(),
                value: v.to_string(),
                confidence: None,
            })
            .collect(),
        tables,
    }
}

#[async_trait]
impl ExtractionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(
        &self,
        page: &PageImage<'_>,
        model: &str,
        _schema: &ExtractionSchema,
    ) -> Result<BackendOutput, BackendError> {
        self.calls.lock().unwrap().push(Call {
            document: page.document.to_string(),
            ordinal: page.ordinal,
            path: page.path.to_path_buf(),
            file_existed: page.path.exists(),
            model: model.to_string(),
        });

        let default = || reply(&format!("text of {} p{}", page.document, page.ordinal), &[], vec![]);
        match self.scripts.get(&(page.document.to_string(), page.ordinal)) {
            None => Ok(default()),
            Some(Script::Reply(out)) => Ok(out.clone()),
            Some(Script::Fail(msg)) => Err(BackendError::InvalidResponse(msg.clone())),
            Some(Script::Delay(d)) => {
                tokio::time::sleep(*d).await;
                Ok(default())
            }
            Some(Script::Panic) => panic!("scripted backend panic"),
        }
    }
}

// ── HTTP stub ────────────────────────────────────────────────────────────────

/// One request received by an [`HttpStub`].
#[derive(Debug, Clone)]
pub struct Recorded {
    /// e.g. `POST /v1/chat/completions HTTP/1.1`
    pub line: String,
    /// Raw header block, one `name: value` per line.
    pub headers: String,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// A one-route HTTP server answering every request with a fixed reply.
pub struct HttpStub {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl HttpStub {
    pub async fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let body = body.to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let recorded = Arc::clone(&recorded);
                let body = body.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut socket).await {
                        recorded.lock().unwrap().push(request);
                    }
                    let response = format!(
                        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        reason(status),
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut lines = head.lines();
    let line = lines.next().unwrap_or_default().to_string();
    let headers = lines.collect::<Vec<_>>().join("\n");
    let end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..end]).into_owned();
    Some(Recorded {
        line,
        headers,
        body,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// A loopback port with nothing listening on it.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
