//! CLI binary for docext-worker.
//!
//! Starts (or connects to) the extraction backend, then answers job payloads:
//! one JSON object per stdin line, one response envelope per stdout line.
//! Logs and progress go to stderr.

use anyhow::{bail, Context, Result};
use clap::Parser;
use docext_worker::{
    DeviceMode, Dtype, ExtractError, ExtractionBackend, ExtractionProgressCallback, JobHandler,
    JobResponse, ProcessSupervisor, RemoteBackend, ServerConfig, ServerProcessHandle,
    ServerState, ValidationError, VlmBackend, WorkerConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

// ── Per-page progress on stderr ──────────────────────────────────────────────

struct CliProgressCallback;

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_page_complete(&self, document: &str, page: usize, total: usize, content_len: usize) {
        eprintln!(
            "  {} {} page {:>3}/{:<3}  {}",
            green("✓"),
            document,
            page,
            total,
            dim(&format!("{content_len:>5} chars"))
        );
    }

    fn on_page_error(&self, document: &str, page: usize, total: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        eprintln!(
            "  {} {} page {:>3}/{:<3}  {}",
            red("✗"),
            document,
            page,
            total,
            red(&msg)
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Start the local model server and answer jobs from stdin
  docext-worker < jobs.jsonl > responses.jsonl

  # A single job from a file
  docext-worker --job invoice-job.json

  # Larger quantized model, longer cold start
  docext-worker --model hosted_vllm/Qwen/Qwen2.5-VL-7B-Instruct-AWQ --start-timeout 900

  # Forward pages to a running extraction UI instead of a local server
  docext-worker --backend remote --remote-url http://localhost:7860 --job job.json

JOB FORMAT (one JSON object per line, optionally wrapped in {"input": ...}):
  {"files": [{"filename": "a.pdf", "data": "<base64>"}],
   "fields": [{"name": "invoice_number", "description": "The invoice number"}],
   "tables": [{"name": "line_items", "description": "Items purchased"}],
   "max_img_size": 1024, "model_name": "hosted_vllm/Qwen/Qwen2.5-VL-3B-Instruct"}

ENVIRONMENT VARIABLES:
  MODEL_NAME            Served model (default Qwen/Qwen2.5-VL-3B-Instruct)
  VLM_HOST / VLM_PORT   Server bind address (default 0.0.0.0:8000)
  MAX_MODEL_LEN         Context length (default 15000)
  GPU_MEMORY_UTIL       Accelerator memory fraction (default 0.98)
  MAX_NUM_IMGS          Images per prompt (default 5)
  VLLM_START_TIMEOUT    Startup budget in seconds (default 300)
  PDFIUM_LIB_PATH       Path to libpdfium; the system library otherwise
  RUST_LOG              Overrides the log filter
"#;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendArg {
    /// Supervise a local OpenAI-compatible server and query it directly.
    Vlm,
    /// Call a remote extraction service.
    Remote,
}

/// Extract structured fields and tables from documents with a local VLM server.
#[derive(Parser, Debug)]
#[command(
    name = "docext-worker",
    version,
    about = "Extract structured fields and tables from documents with a local VLM server",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Extraction backend.
    #[arg(long, env = "DOCEXT_BACKEND", value_enum, default_value = "vlm")]
    backend: BackendArg,

    /// Model served and used for extraction.
    #[arg(long, env = "MODEL_NAME", default_value = docext_worker::config::DEFAULT_MODEL)]
    model: String,

    /// Server executable.
    #[arg(long, env = "VLLM_PROGRAM", default_value = "vllm")]
    program: String,

    /// Server bind host.
    #[arg(long, env = "VLM_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server bind port.
    #[arg(long, env = "VLM_PORT", default_value_t = 8000)]
    port: u16,

    /// Maximum context length in tokens.
    #[arg(long, env = "MAX_MODEL_LEN", default_value_t = 15000)]
    max_model_len: u32,

    /// Fraction of accelerator memory the server may use.
    #[arg(long, env = "GPU_MEMORY_UTIL", default_value_t = 0.98)]
    gpu_memory_util: f32,

    /// Maximum images per prompt.
    #[arg(long, env = "MAX_NUM_IMGS", default_value_t = 5)]
    max_num_imgs: u32,

    /// Numeric precision: bfloat16 or float16 (AWQ models force float16).
    #[arg(long, env = "DTYPE", default_value = "bfloat16")]
    dtype: String,

    /// Device: auto, gpu or cpu.
    #[arg(long, env = "VLM_DEVICE", default_value = "auto")]
    device: String,

    /// Seconds to wait for the server to become ready.
    #[arg(long, env = "VLLM_START_TIMEOUT", default_value_t = 300)]
    start_timeout: u64,

    /// Remote extraction service URL (remote backend).
    #[arg(long, env = "GRADIO_URL")]
    remote_url: Option<String>,

    /// Remote service credentials as user:password.
    #[arg(long, env = "DOCEXT_REMOTE_AUTH")]
    remote_auth: Option<String>,

    /// Rendering DPI for PDF pages (72–600).
    #[arg(long, env = "DOCEXT_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Pages of one document extracted concurrently.
    #[arg(short = 'c', long, env = "DOCEXT_PAGE_CONCURRENCY", default_value_t = 1)]
    page_concurrency: usize,

    /// Retries per page on backend failure.
    #[arg(long, env = "DOCEXT_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-page backend call timeout in seconds.
    #[arg(long, env = "DOCEXT_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// Path to the pdfium shared library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Directory for request staging directories.
    #[arg(long, env = "DOCEXT_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Answer a single job read from this JSON file, then exit.
    #[arg(long)]
    job: Option<PathBuf>,

    /// Disable the startup spinner and per-page lines.
    #[arg(long, env = "DOCEXT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCEXT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCEXT_QUIET")]
    quiet: bool,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let dtype: Dtype = self.dtype.parse()?;
        let device: DeviceMode = self.device.parse()?;
        Ok(ServerConfig::builder()
            .program(&self.program)
            .model_name(&self.model)
            .host(&self.host)
            .port(self.port)
            .max_model_len(self.max_model_len)
            .gpu_memory_utilization(self.gpu_memory_util)
            .max_num_imgs(self.max_num_imgs)
            .dtype(dtype)
            .device(device)
            .start_timeout(Duration::from_secs(self.start_timeout))
            .build()?)
    }

    fn worker_config(&self) -> Result<WorkerConfig> {
        let model = if self.model.starts_with(docext_worker::config::HOSTED_PREFIX) {
            self.model.clone()
        } else {
            format!("{}{}", docext_worker::config::HOSTED_PREFIX, self.model)
        };
        let mut builder = WorkerConfig::builder()
            .dpi(self.dpi)
            .default_model(model)
            .page_concurrency(self.page_concurrency)
            .max_retries(self.max_retries)
            .api_timeout_secs(self.api_timeout);
        if let Some(lib) = &self.pdfium_lib {
            builder = builder.pdfium_library(lib);
        }
        if let Some(dir) = &self.temp_dir {
            builder = builder.temp_root(dir);
        }
        if self.show_progress() {
            builder = builder.progress_callback(Arc::new(CliProgressCallback));
        }
        Ok(builder.build()?)
    }

    fn show_progress(&self) -> bool {
        !self.quiet && !self.no_progress
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let server = cli.server_config().context("Invalid server configuration")?;
    let worker = cli.worker_config().context("Invalid worker configuration")?;

    // ── Backend ──────────────────────────────────────────────────────────
    let mut supervised: Option<(ProcessSupervisor, ServerProcessHandle)> = None;
    let (backend, readiness) = match cli.backend {
        BackendArg::Vlm => {
            let supervisor = ProcessSupervisor::new(server.clone())?;
            let mut handle = supervisor.start().context("Failed to start the model server")?;
            let ready = wait_with_spinner(&supervisor, &mut handle, &server, cli.show_progress()).await;
            if let Err(e) = ready {
                supervisor.stop(&mut handle).await;
                return Err(e);
            }
            let readiness = handle.subscribe();
            supervised = Some((supervisor, handle));
            let backend: Arc<dyn ExtractionBackend> =
                Arc::new(VlmBackend::for_server(&server, &worker)?);
            (backend, readiness)
        }
        BackendArg::Remote => {
            let Some(url) = cli.remote_url.as_deref() else {
                bail!("--remote-url (or GRADIO_URL) is required with --backend remote");
            };
            let mut remote = RemoteBackend::new(url, Duration::from_secs(worker.api_timeout_secs))?;
            if let Some(auth) = cli.remote_auth.as_deref() {
                let (user, password) = auth
                    .split_once(':')
                    .context("--remote-auth must be user:password")?;
                remote = remote.with_basic_auth(user, password);
            }
            let backend: Arc<dyn ExtractionBackend> = Arc::new(remote);
            (backend, ServerState::ready_signal())
        }
    };

    let handler = JobHandler::new(backend, readiness, worker);

    // ── Jobs ─────────────────────────────────────────────────────────────
    let outcome = tokio::select! {
        r = serve_jobs(&handler, cli.job.as_deref()) => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down");
            Ok(())
        }
    };

    if let Some((supervisor, mut handle)) = supervised {
        supervisor.stop(&mut handle).await;
    }
    outcome
}

async fn wait_with_spinner(
    supervisor: &ProcessSupervisor,
    handle: &mut ServerProcessHandle,
    server: &ServerConfig,
    show: bool,
) -> Result<()> {
    let spinner = if show {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}  ⏱ {elapsed_precise}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("Starting {} on port {}…", server.model_name, server.port));
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    } else {
        None
    };

    let result = tokio::select! {
        r = supervisor.wait_ready(handle, server.start_timeout) => r.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("Interrupted while waiting for the model server")),
    };

    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
    match &result {
        Ok(()) if show => eprintln!("{} Model server ready", green("✔")),
        Err(_) if show => eprintln!("{} Model server failed to start", red("✘")),
        _ => {}
    }
    result
}

async fn serve_jobs(handler: &JobHandler, job_file: Option<&std::path::Path>) -> Result<()> {
    if let Some(path) = job_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read job file {}", path.display()))?;
        let response = answer(handler, &text).await;
        return write_response(&response);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = answer(handler, &line).await;
        write_response(&response)?;
    }
    Ok(())
}

async fn answer(handler: &JobHandler, text: &str) -> JobResponse {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(job) => handler.handle(&job).await,
        Err(e) => JobResponse::failure(&ExtractError::Validation(ValidationError::new(vec![
            format!("Request payload is not valid JSON: {e}"),
        ]))),
    }
}

fn write_response(response: &JobResponse) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, response)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
