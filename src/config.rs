//! Configuration types for the supervised server and the extraction worker.
//!
//! Two structs, each with a builder whose `build()` validates ranges:
//!
//! * [`ServerConfig`]: how the model-serving process is launched, probed
//!   and stopped. Consumed by [`crate::supervisor::ProcessSupervisor`].
//! * [`WorkerConfig`]: how documents are rendered and pages submitted to the
//!   backend. Consumed by [`crate::pipeline`] and [`crate::job`].
//!
//! Defaults mirror the deployment this worker was built for: a Qwen2.5-VL
//! model behind vLLM on port 8000, five images per prompt, a 15 000 token
//! context, and a generous startup budget for cold model loads.

use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default model served by the supervised process.
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-VL-3B-Instruct";

/// Routing prefix some clients put in front of the served model name.
pub const HOSTED_PREFIX: &str = "hosted_vllm/";

// ── Server ───────────────────────────────────────────────────────────────

/// Configuration for the supervised model-serving process.
///
/// # Example
/// ```rust
/// use docext_worker::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::builder()
///     .model_name("Qwen/Qwen2.5-VL-7B-Instruct-AWQ")
///     .port(8001)
///     .start_timeout(Duration::from_secs(900))
///     .build()
///     .unwrap();
/// assert_eq!(config.port, 8001);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable launched as the server. Default: `vllm`.
    pub program: String,

    /// Model identifier passed to `serve`. A `hosted_vllm/` prefix is
    /// stripped before launch.
    pub model_name: String,

    /// Bind address of the server. Default: `0.0.0.0`.
    pub host: String,

    /// Bind port of the server. Default: 8000.
    pub port: u16,

    /// Maximum context length in tokens. Default: 15000.
    pub max_model_len: u32,

    /// Fraction of accelerator memory the server may claim. Default: 0.98.
    pub gpu_memory_utilization: f32,

    /// Maximum images per prompt. Default: 5.
    pub max_num_imgs: u32,

    /// Preferred numeric precision. Overridden to `float16` for AWQ models.
    pub dtype: Dtype,

    /// Accelerator selection. Default: probe at start.
    pub device: DeviceMode,

    /// Hard budget for the server to become healthy. Default: 300 s.
    pub start_timeout: Duration,

    /// Interval between health probes. Default: 2 s.
    pub poll_interval: Duration,

    /// Per-request timeout of a single health probe. Default: 1 s.
    pub health_timeout: Duration,

    /// Path polled for readiness. Default: `/v1/models`.
    pub health_path: String,

    /// How long a terminated server may take to exit before it is killed.
    /// Default: 10 s.
    pub stop_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "vllm".to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_model_len: 15000,
            gpu_memory_utilization: 0.98,
            max_num_imgs: 5,
            dtype: Dtype::default(),
            device: DeviceMode::default(),
            start_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            health_timeout: Duration::from_secs(1),
            health_path: "/v1/models".to_string(),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Create a new builder for `ServerConfig`.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Host to dial when probing or calling the server.
    ///
    /// A wildcard bind address is not dialable, so it maps to loopback.
    pub fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        }
    }

    /// Base URL of the server's HTTP API, e.g. `http://127.0.0.1:8000`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.connect_host(), self.port)
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.config.program = program.into();
        self
    }

    pub fn model_name(mut self, model: impl Into<String>) -> Self {
        self.config.model_name = model.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_model_len(mut self, n: u32) -> Self {
        self.config.max_model_len = n;
        self
    }

    pub fn gpu_memory_utilization(mut self, fraction: f32) -> Self {
        self.config.gpu_memory_utilization = fraction;
        self
    }

    pub fn max_num_imgs(mut self, n: u32) -> Self {
        self.config.max_num_imgs = n;
        self
    }

    pub fn dtype(mut self, dtype: Dtype) -> Self {
        self.config.dtype = dtype;
        self
    }

    pub fn device(mut self, device: DeviceMode) -> Self {
        self.config.device = device;
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.config.start_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn health_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_timeout = timeout;
        self
    }

    pub fn health_path(mut self, path: impl Into<String>) -> Self {
        self.config.health_path = path.into();
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServerConfig, ExtractError> {
        let c = &self.config;
        if c.program.trim().is_empty() {
            return Err(ExtractError::InvalidConfig(
                "Server program must not be empty".into(),
            ));
        }
        if c.model_name.trim().is_empty() {
            return Err(ExtractError::InvalidConfig(
                "Model name must not be empty".into(),
            ));
        }
        if c.port == 0 {
            return Err(ExtractError::InvalidConfig("Port must be ≥ 1".into()));
        }
        if !(c.gpu_memory_utilization > 0.0 && c.gpu_memory_utilization <= 1.0) {
            return Err(ExtractError::InvalidConfig(format!(
                "GPU memory utilization must be in (0, 1], got {}",
                c.gpu_memory_utilization
            )));
        }
        if c.max_num_imgs == 0 || c.max_model_len == 0 {
            return Err(ExtractError::InvalidConfig(
                "max_num_imgs and max_model_len must be ≥ 1".into(),
            ));
        }
        if c.poll_interval.is_zero() || c.start_timeout.is_zero() {
            return Err(ExtractError::InvalidConfig(
                "poll_interval and start_timeout must be non-zero".into(),
            ));
        }
        if !c.health_path.starts_with('/') {
            return Err(ExtractError::InvalidConfig(format!(
                "Health path must start with '/', got '{}'",
                c.health_path
            )));
        }
        Ok(self.config)
    }
}

// ── Worker ───────────────────────────────────────────────────────────────

/// Configuration for document decomposition and page extraction.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Rendering DPI used when rasterising PDF pages. Range: 72–600. Default: 300.
    pub dpi: u32,

    /// Safety cap on either rendered dimension, independent of DPI. Default: 4096.
    pub max_rendered_pixels: u32,

    /// Longest edge of the image submitted to the backend when a request
    /// does not set `max_img_size`. Default: 1024.
    pub default_max_img_size: u32,

    /// Model identifier used when a request does not set `model_name`.
    pub default_model: String,

    /// Pages of one document submitted concurrently. Default: 1 (sequential).
    pub page_concurrency: usize,

    /// Retry attempts per page on a retryable backend failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubling per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-page backend call timeout in seconds. Default: 300.
    pub api_timeout_secs: u64,

    /// Sampling temperature for VLM replies. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens generated per page reply. Default: 4096.
    pub max_tokens: usize,

    /// Explicit pdfium shared library. If None, the system library is used.
    pub pdfium_library: Option<PathBuf>,

    /// Parent directory for request-scoped staging directories.
    /// If None, the OS temp directory is used.
    pub temp_root: Option<PathBuf>,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 4096,
            default_max_img_size: 1024,
            default_model: format!("{HOSTED_PREFIX}{DEFAULT_MODEL}"),
            page_concurrency: 1,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 300,
            temperature: 0.0,
            max_tokens: 4096,
            pdfium_library: None,
            temp_root: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("default_max_img_size", &self.default_max_img_size)
            .field("default_model", &self.default_model)
            .field("page_concurrency", &self.page_concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("pdfium_library", &self.pdfium_library)
            .field("temp_root", &self.temp_root)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl WorkerConfig {
    /// Create a new builder for `WorkerConfig`.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WorkerConfig`].
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn default_max_img_size(mut self, px: u32) -> Self {
        self.config.default_max_img_size = px;
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.config.default_model = model.into();
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library = Some(path.into());
        self
    }

    pub fn temp_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.temp_root = Some(path.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkerConfig, ExtractError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(ExtractError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.default_max_img_size < 32 {
            return Err(ExtractError::InvalidConfig(format!(
                "max_img_size must be ≥ 32, got {}",
                c.default_max_img_size
            )));
        }
        if c.default_model.trim().is_empty() {
            return Err(ExtractError::InvalidConfig(
                "Default model must not be empty".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(ExtractError::InvalidConfig(
                "API timeout must be ≥ 1s".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Numeric precision requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    #[default]
    BFloat16,
    Float16,
}

impl Dtype {
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::BFloat16 => "bfloat16",
            Dtype::Float16 => "float16",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bfloat16" => Ok(Dtype::BFloat16),
            "float16" => Ok(Dtype::Float16),
            other => Err(ExtractError::InvalidConfig(format!(
                "Invalid dtype '{other}'. Must be 'bfloat16' or 'float16'."
            ))),
        }
    }
}

/// Which device profile the server is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Probe for an accelerator at start time. (default)
    #[default]
    Auto,
    /// Assume an accelerator is present.
    Accelerator,
    /// Force the CPU profile.
    Cpu,
}

impl FromStr for DeviceMode {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceMode::Auto),
            "gpu" | "cuda" | "accelerator" => Ok(DeviceMode::Accelerator),
            "cpu" => Ok(DeviceMode::Cpu),
            other => Err(ExtractError::InvalidConfig(format!(
                "Invalid device '{other}'. Must be 'auto', 'gpu' or 'cpu'."
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_deployment() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 8000);
        assert_eq!(c.max_model_len, 15000);
        assert_eq!(c.max_num_imgs, 5);
        assert_eq!(c.poll_interval, Duration::from_secs(2));
        assert_eq!(c.health_path, "/v1/models");
        assert_eq!(c.dtype, Dtype::BFloat16);
    }

    #[test]
    fn wildcard_host_dials_loopback() {
        let c = ServerConfig::default();
        assert_eq!(c.connect_host(), "127.0.0.1");
        assert_eq!(c.base_url(), "http://127.0.0.1:8000");

        let c = ServerConfig::builder().host("10.0.0.5").build().unwrap();
        assert_eq!(c.connect_host(), "10.0.0.5");
    }

    #[test]
    fn server_builder_rejects_bad_fraction() {
        let err = ServerConfig::builder()
            .gpu_memory_utilization(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("GPU memory utilization"));
    }

    #[test]
    fn server_builder_rejects_relative_health_path() {
        assert!(ServerConfig::builder()
            .health_path("v1/models")
            .build()
            .is_err());
    }

    #[test]
    fn worker_builder_clamps_dpi() {
        let c = WorkerConfig::builder().dpi(10_000).build().unwrap();
        assert_eq!(c.dpi, 600);
        let c = WorkerConfig::builder().page_concurrency(0).build().unwrap();
        assert_eq!(c.page_concurrency, 1);
    }

    #[test]
    fn worker_default_model_carries_routing_prefix() {
        let c = WorkerConfig::default();
        assert_eq!(c.default_model, "hosted_vllm/Qwen/Qwen2.5-VL-3B-Instruct");
    }

    #[test]
    fn dtype_parses_known_values_only() {
        assert_eq!("float16".parse::<Dtype>().unwrap(), Dtype::Float16);
        assert_eq!("BFloat16".parse::<Dtype>().unwrap(), Dtype::BFloat16);
        assert!("float32".parse::<Dtype>().is_err());
    }

    #[test]
    fn device_mode_accepts_aliases() {
        assert_eq!("cuda".parse::<DeviceMode>().unwrap(), DeviceMode::Accelerator);
        assert_eq!("cpu".parse::<DeviceMode>().unwrap(), DeviceMode::Cpu);
    }
}
