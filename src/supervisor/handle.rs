//! The explicitly owned handle to one supervised server process.

use super::ServerState;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Lines of child output retained for crash reports.
pub const OUTPUT_LOG_LINES: usize = 200;

/// Bounded ring buffer of the child's most recent stdout/stderr lines.
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Retained lines joined with newlines, oldest first.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared "one live server" marker for a supervisor.
#[derive(Debug, Default)]
pub(crate) struct LiveMarker {
    active: AtomicBool,
    pid: AtomicU32,
}

impl LiveMarker {
    /// Pid of the live server, if any is recorded.
    pub(crate) fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Occupies the marker until dropped.
#[derive(Debug)]
pub(crate) struct LiveSlot(Arc<LiveMarker>);

impl LiveSlot {
    pub(crate) fn acquire(marker: &Arc<LiveMarker>) -> Option<Self> {
        marker
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(marker)))
    }

    pub(crate) fn record_pid(&self, pid: Option<u32>) {
        self.0.pid.store(pid.unwrap_or(0), Ordering::Release);
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.0.pid.store(0, Ordering::Release);
        self.0.active.store(false, Ordering::Release);
    }
}

/// Handle to one server process.
///
/// Created by [`super::ProcessSupervisor::start`]; its state only moves
/// forward and every transition is published on a `watch` channel. Dropping
/// a handle whose child is still running kills the child.
#[derive(Debug)]
pub struct ServerProcessHandle {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) health_path: String,
    pub(crate) state_tx: watch::Sender<ServerState>,
    pub(crate) child: Option<Child>,
    pub(crate) pid: Option<u32>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) output: OutputLog,
    pub(crate) drains: Vec<JoinHandle<()>>,
    pub(crate) slot: Option<LiveSlot>,
}

impl ServerProcessHandle {
    /// A handle that has never been started.
    pub fn unstarted(host: impl Into<String>, port: u16) -> Self {
        let (state_tx, _) = watch::channel(ServerState::NotStarted);
        Self {
            host: host.into(),
            port,
            health_path: "/v1/models".to_string(),
            state_tx,
            child: None,
            pid: None,
            started_at: None,
            deadline: None,
            output: OutputLog::new(OUTPUT_LOG_LINES),
            drains: Vec::new(),
            slot: None,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    /// A receiver observing every state transition of this handle.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Readiness deadline set by the last `wait_ready` call.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Most recent lines the child wrote to stdout or stderr.
    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    pub(crate) fn health_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.health_path)
    }

    /// Move to `next` if it ranks above the current state.
    ///
    /// Returns false (and leaves the state alone) for a regression.
    pub(crate) fn transition(&mut self, next: ServerState) -> bool {
        let current = self.state();
        if next <= current {
            if next != current {
                warn!(
                    "Ignoring server state regression {} -> {} (pid {:?})",
                    current, next, self.pid
                );
            }
            return false;
        }
        self.state_tx.send_replace(next);
        true
    }

    /// Release the single-live-server slot held by this handle.
    pub(crate) fn release_slot(&mut self) {
        self.slot.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_log_keeps_most_recent_lines() {
        let log = OutputLog::new(3);
        for i in 0..5 {
            log.push(format!("line {i}"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.snapshot(), "line 2\nline 3\nline 4");
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut handle = ServerProcessHandle::unstarted("127.0.0.1", 8000);
        let rx = handle.subscribe();

        assert!(handle.transition(ServerState::Starting));
        assert!(handle.transition(ServerState::Ready));
        assert!(!handle.transition(ServerState::Starting));
        assert_eq!(handle.state(), ServerState::Ready);
        assert_eq!(*rx.borrow(), ServerState::Ready);

        assert!(handle.transition(ServerState::Stopped));
        assert!(!handle.transition(ServerState::Failed));
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[test]
    fn live_slot_is_exclusive_until_dropped() {
        let marker = Arc::new(LiveMarker::default());
        let slot = LiveSlot::acquire(&marker).unwrap();
        slot.record_pid(Some(42));
        assert!(LiveSlot::acquire(&marker).is_none());
        assert_eq!(marker.pid(), Some(42));

        drop(slot);
        assert_eq!(marker.pid(), None);
        assert!(LiveSlot::acquire(&marker).is_some());
    }
}
