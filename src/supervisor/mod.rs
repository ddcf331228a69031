//! Lifecycle of the local model-serving process.
//!
//! ```text
//!  NotStarted ──start──▶ Starting ──health 200──▶ Ready
//!                           │                       │
//!                     exit / timeout               stop
//!                           ▼                       ▼
//!                         Failed ─────stop────▶  Stopped
//! ```
//!
//! [`ProcessSupervisor::start`] returns as soon as the child is spawned.
//! [`ProcessSupervisor::wait_ready`] is the one place that suspends, polling
//! the health endpoint until the server answers, the child dies, or the
//! deadline passes. [`ProcessSupervisor::stop`] is idempotent.

pub mod command;
mod handle;
pub mod probe;

pub use command::{DeviceProfile, ServeCommand};
pub use handle::{OutputLog, ServerProcessHandle, OUTPUT_LOG_LINES};

use crate::config::ServerConfig;
use crate::error::ExtractError;
use handle::{LiveMarker, LiveSlot};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Interval between "still waiting" log lines during startup.
const PROGRESS_LOG_EVERY: Duration = Duration::from_secs(30);

/// Upper bound on waiting for the output drains after a crash.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle state of a [`ServerProcessHandle`].
///
/// Declaration order is the transition rank: a handle never moves to an
/// earlier variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotStarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::NotStarted => "not_started",
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Failed => "failed",
            ServerState::Stopped => "stopped",
        }
    }

    /// A receiver that always reports `Ready`.
    ///
    /// For job handlers whose backend does not depend on a supervised server.
    /// The sender lives for the whole process, so `changed()` stays pending
    /// instead of returning a closed-channel error.
    pub fn ready_signal() -> watch::Receiver<ServerState> {
        static READY: Lazy<watch::Sender<ServerState>> =
            Lazy::new(|| watch::channel(ServerState::Ready).0);
        READY.subscribe()
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starts, watches and stops one model-serving process at a time.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: ServerConfig,
    client: reqwest::Client,
    live: Arc<LiveMarker>,
}

impl ProcessSupervisor {
    pub fn new(config: ServerConfig) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(config.health_timeout)
            .no_proxy()
            .build()
            .map_err(|e| ExtractError::Internal(format!("health client: {e}")))?;
        Ok(Self {
            config,
            client,
            live: Arc::new(LiveMarker::default()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Probe the hardware, build the serve command and spawn it.
    pub fn start(&self) -> Result<ServerProcessHandle, ExtractError> {
        let accelerator = self.config.device.resolve();
        if !accelerator {
            warn!(
                "No GPU detected: starting '{}' on CPU. Expect extraction to be \
                 orders of magnitude slower.",
                self.config.model_name
            );
        }
        let cmd = ServeCommand::for_server(&self.config, accelerator);
        self.start_command(&cmd)
    }

    /// Spawn a prepared command under this supervisor's lifecycle.
    pub fn start_command(&self, cmd: &ServeCommand) -> Result<ServerProcessHandle, ExtractError> {
        let slot = LiveSlot::acquire(&self.live).ok_or_else(|| ExtractError::AlreadyRunning {
            pid: self.live.pid(),
        })?;

        info!("Starting server: {}", cmd.display());
        let mut child = cmd.to_command().spawn().map_err(|source| ExtractError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let pid = child.id();
        slot.record_pid(pid);

        let mut handle =
            ServerProcessHandle::unstarted(self.config.connect_host(), self.config.port);
        handle.health_path = self.config.health_path.clone();
        if let Some(stdout) = child.stdout.take() {
            handle.drains.push(drain_output(stdout, "stdout", handle.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            handle.drains.push(drain_output(stderr, "stderr", handle.output.clone()));
        }
        handle.child = Some(child);
        handle.pid = pid;
        handle.started_at = Some(Instant::now());
        handle.slot = Some(slot);
        handle.transition(ServerState::Starting);

        info!("Server process spawned (pid {:?}) on port {}", pid, handle.port);
        Ok(handle)
    }

    /// Poll the health endpoint until the server is ready.
    ///
    /// On timeout the process is stopped before `StartupTimeout` is returned.
    /// A child that exits first yields `ProcessCrash` and a `Failed` handle.
    pub async fn wait_ready(
        &self,
        handle: &mut ServerProcessHandle,
        timeout: Duration,
    ) -> Result<(), ExtractError> {
        match handle.state() {
            ServerState::Ready => return Ok(()),
            ServerState::Starting => {}
            state => {
                return Err(ExtractError::InvalidState {
                    operation: "wait for",
                    state,
                })
            }
        }

        let started = Instant::now();
        let deadline = started + timeout;
        handle.deadline = Some(deadline);
        let url = handle.health_url();
        let mut next_report = started + PROGRESS_LOG_EVERY;

        info!("Waiting up to {}s for server at {}", timeout.as_secs(), url);

        loop {
            if let Some(status) = exited(handle) {
                return Err(self.crashed(handle, status).await);
            }

            match self.client.get(&url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    handle.transition(ServerState::Ready);
                    info!(
                        "Server ready after {:.1}s (pid {:?})",
                        started.elapsed().as_secs_f64(),
                        handle.pid
                    );
                    return Ok(());
                }
                Ok(resp) => debug!("Health probe returned {}", resp.status()),
                Err(e) => debug!("Health probe failed: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if now >= next_report {
                info!(
                    "Still waiting for server ({}s elapsed, {}s left)",
                    started.elapsed().as_secs(),
                    deadline.saturating_duration_since(now).as_secs()
                );
                next_report += PROGRESS_LOG_EVERY;
            }
            // Wake early if the child exits mid-pause.
            let pause = self.config.poll_interval.min(deadline - now);
            match handle.child.as_mut() {
                Some(child) => {
                    tokio::select! {
                        _ = child.wait() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
        }

        error!(
            "Server did not become ready within {}s; stopping it",
            timeout.as_secs()
        );
        self.stop(handle).await;
        Err(ExtractError::StartupTimeout {
            host: handle.host.clone(),
            port: handle.port,
            secs: timeout.as_secs(),
        })
    }

    /// Terminate the process, escalating to a kill after `stop_grace`.
    ///
    /// Calling this on an unstarted or already stopped handle sends nothing
    /// and leaves it `Stopped`.
    pub async fn stop(&self, handle: &mut ServerProcessHandle) {
        if let Some(mut child) = handle.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                terminate(&mut child);
                match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
                    Ok(Ok(status)) => info!("Server exited ({})", status),
                    Ok(Err(e)) => warn!("Waiting for server exit failed: {}", e),
                    Err(_) => {
                        warn!(
                            "Server ignored SIGTERM for {}s; killing it",
                            self.config.stop_grace.as_secs()
                        );
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill server (pid {:?}): {}", handle.pid, e);
                        }
                    }
                }
            }
        }
        handle.release_slot();
        handle.transition(ServerState::Stopped);
    }

    /// `start` followed by `wait_ready` with the configured timeout.
    pub async fn run_until_ready(&self) -> Result<ServerProcessHandle, ExtractError> {
        let mut handle = self.start()?;
        if let Err(e) = self.wait_ready(&mut handle, self.config.start_timeout).await {
            self.stop(&mut handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn crashed(&self, handle: &mut ServerProcessHandle, status: String) -> ExtractError {
        for drain in handle.drains.drain(..) {
            let _ = tokio::time::timeout(DRAIN_GRACE, drain).await;
        }
        handle.child = None;
        handle.release_slot();
        handle.transition(ServerState::Failed);
        error!("Server exited during startup ({})", status);
        ExtractError::ProcessCrash {
            status,
            output: handle.output.snapshot(),
        }
    }
}

/// The child's exit status, if it has exited.
fn exited(handle: &mut ServerProcessHandle) -> Option<String> {
    let child = handle.child.as_mut()?;
    match child.try_wait() {
        Ok(Some(status)) => Some(status.to_string()),
        Ok(None) => None,
        Err(e) => Some(format!("unknown exit status: {e}")),
    }
}

fn drain_output<R>(reader: R, stream: &'static str, log: OutputLog) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "docext_worker::server", stream, "{}", line);
            log.push(line);
        }
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("SIGTERM to pid {} failed ({}); killing instead", pid, errno);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_rank_follows_lifecycle() {
        assert!(ServerState::NotStarted < ServerState::Starting);
        assert!(ServerState::Starting < ServerState::Ready);
        assert!(ServerState::Ready < ServerState::Failed);
        assert!(ServerState::Failed < ServerState::Stopped);
    }

    #[test]
    fn ready_signal_reports_ready() {
        let rx = ServerState::ready_signal();
        assert_eq!(*rx.borrow(), ServerState::Ready);
    }

    #[tokio::test]
    async fn ready_signal_never_closes() {
        let mut rx = ServerState::ready_signal();
        let waited = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(waited.is_err(), "changed() resolved: {waited:?}");
        assert_eq!(*rx.borrow(), ServerState::Ready);
    }

    #[tokio::test]
    async fn stop_on_unstarted_handle_only_records_stopped() {
        let sup = ProcessSupervisor::new(ServerConfig::default()).unwrap();
        let mut handle = ServerProcessHandle::unstarted("127.0.0.1", 8000);
        sup.stop(&mut handle).await;
        assert_eq!(handle.state(), ServerState::Stopped);
        sup.stop(&mut handle).await;
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn wait_ready_rejects_unstarted_handle() {
        let sup = ProcessSupervisor::new(ServerConfig::default()).unwrap();
        let mut handle = ServerProcessHandle::unstarted("127.0.0.1", 8000);
        let err = sup
            .wait_ready(&mut handle, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::InvalidState {
                state: ServerState::NotStarted,
                ..
            }
        ));
    }
}
