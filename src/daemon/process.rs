//! A running daemon instance.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::process::Child;
use tokio::sync::{watch, Mutex, MutexGuard};

use super::marker::LogStream;

/// Lifecycle of a [`ManagedProcess`].
///
/// `Starting -> Active -> (RotatingIdentity -> Active)* -> Terminating -> Terminated`,
/// or `Failed` when a launch attempt dies or times out, or the process
/// disappears outside of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Active,
    RotatingIdentity,
    Terminating,
    Terminated,
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Active => "active",
            ProcessState::RotatingIdentity => "rotating identity",
            ProcessState::Terminating => "terminating",
            ProcessState::Terminated => "terminated",
            ProcessState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One daemon process bound to a SOCKS port.
///
/// The child handle sits behind an async mutex that doubles as the
/// per-process operation queue: signal operations take it for their whole
/// duration, so at most one of them reads the log stream at a time.
pub struct ManagedProcess {
    pid: u32,
    port: u16,
    data_dir: PathBuf,
    attempts: u32,
    state: watch::Sender<ProcessState>,
    logs: LogStream,
    child: Mutex<Child>,
}

impl ManagedProcess {
    pub(crate) fn new(
        child: Child,
        pid: u32,
        port: u16,
        data_dir: PathBuf,
        attempts: u32,
        logs: LogStream,
    ) -> Self {
        let (state, _) = watch::channel(ProcessState::Starting);
        Self {
            pid,
            port,
            data_dir,
            attempts,
            state,
            logs,
            child: Mutex::new(child),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// SOCKS port the daemon listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// How many launches it took to reach `Active`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn logs(&self) -> &LogStream {
        &self.logs
    }

    /// Whether the child has exited. Waits for any in-flight operation.
    pub async fn has_exited(&self) -> std::io::Result<bool> {
        Ok(self.child.lock().await.try_wait()?.is_some())
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Daemon {} {} -> {}", self.pid, previous, state);
        }
    }

    /// Take the operation lock.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Child> {
        self.child.lock().await
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("state", &self.state())
            .finish()
    }
}
