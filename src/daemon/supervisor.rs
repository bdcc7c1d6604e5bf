//! Spawning and signalling the Tor daemon.
//!
//! # How it works
//!
//! 1. Launch `tor --SOCKSPort <port> --DataDirectory <dir>` with stdout piped
//! 2. Pump stdout into a [`LogStream`] and race the bootstrap marker against
//!    the attempt timeout and the process exiting
//! 3. On timeout, SIGKILL the attempt, let the port settle and relaunch with
//!    the same port and directory, up to [`RetryPolicy::max_attempts`]
//! 4. Later operations send a signal and wait for the daemon to acknowledge
//!    it in its log output

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::marker::{LogStream, Marker, MarkerMatcher, MarkerSet, SubstringMatcher};
use super::process::{ManagedProcess, ProcessState};
use super::signal::{self, DaemonSignal};
use crate::config::DaemonConfig;
use crate::error::{Error, Result};

/// Wait after a kill or a clean shutdown so the OS releases the port.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Launch attempts before giving up on bootstrap.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How long to wait for the child to be reaped after a shutdown ack.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do when bootstrap does not finish in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt bootstrap timeout. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Total launches allowed, including the first.
    pub max_attempts: u32,
    /// Extra pause between attempts, on top of the settle delay.
    pub backoff: Duration,
    /// Added to the timeout for every retry.
    pub timeout_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Single attempt, no timeout.
    pub fn none() -> Self {
        Self {
            timeout: None,
            max_attempts: 1,
            backoff: Duration::ZERO,
            timeout_step: Duration::ZERO,
        }
    }

    /// Kill and relaunch whenever an attempt exceeds `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            ..Self::none()
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn timeout_step(mut self, step: Duration) -> Self {
        self.timeout_step = step;
        self
    }

    /// Timeout for the given 1-based attempt. Saturates instead of overflowing.
    pub fn timeout_for(&self, attempt: u32) -> Option<Duration> {
        self.timeout.map(|t| {
            let step = self
                .timeout_step
                .checked_mul(attempt.saturating_sub(1))
                .unwrap_or(Duration::MAX);
            t.saturating_add(step)
        })
    }
}

enum Attempt {
    Active(ManagedProcess),
    TimedOut,
}

enum Bootstrap {
    Ready,
    TimedOut,
}

/// Launches and controls daemon processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    binary: PathBuf,
    extra_args: Vec<String>,
    markers: MarkerSet,
    settle_delay: Duration,
    matcher: Arc<dyn MarkerMatcher>,
}

impl ProcessSupervisor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            markers: MarkerSet::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            matcher: Arc::new(SubstringMatcher),
        }
    }

    /// Build a supervisor from configuration, locating the tor binary.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let binary =
            Self::find_binary(config.tor_binary.as_deref()).ok_or(Error::BinaryNotFound)?;
        Ok(Self::new(binary)
            .extra_args(config.extra_args.clone())
            .markers(config.markers.clone())
            .settle_delay(config.settle_delay()))
    }

    /// Find the tor binary at an explicit path or in PATH.
    pub fn find_binary(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Some(path.to_path_buf());
            }
            if let Ok(path) = which::which(path) {
                return Some(path);
            }
        }

        ["tor", "/usr/bin/tor", "/usr/local/bin/tor"]
            .into_iter()
            .find_map(|candidate| which::which(candidate).ok())
    }

    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn markers(mut self, markers: MarkerSet) -> Self {
        self.markers = markers;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn MarkerMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, port: u16, data_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--SOCKSPort")
            .arg(port.to_string())
            .arg("--DataDirectory")
            .arg(data_dir)
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Launch the daemon and wait until it has bootstrapped.
    pub async fn spawn(
        &self,
        port: u16,
        data_dir: &Path,
        retry: &RetryPolicy,
    ) -> Result<ManagedProcess> {
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .spawn_once(port, data_dir, retry.timeout_for(attempt), attempt)
                .await?
            {
                Attempt::Active(process) => return Ok(process),
                Attempt::TimedOut if attempt >= max_attempts => {
                    return Err(Error::BootstrapExhausted { attempts: attempt });
                }
                Attempt::TimedOut => {
                    tokio::time::sleep(self.settle_delay.saturating_add(retry.backoff)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn spawn_once(
        &self,
        port: u16,
        data_dir: &Path,
        timeout: Option<Duration>,
        attempt: u32,
    ) -> Result<Attempt> {
        let mut child = self.command(port, data_dir).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::BinaryNotFound
            } else {
                Error::Io(e)
            }
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Io(std::io::Error::other("daemon exited before its pid was read")))?;
        debug!(
            "Launched {} (pid {}, attempt {}, port {})",
            self.binary.display(),
            pid,
            attempt,
            port
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("daemon stdout was not captured"))
        })?;

        let logs = LogStream::with_matcher(self.matcher.clone());
        let bootstrapped = logs.watch(self.markers.get(Marker::Bootstrapped));
        logs.pump(stdout, pid);

        let process = ManagedProcess::new(child, pid, port, data_dir.to_path_buf(), attempt, logs);

        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let outcome = {
            let mut child = process.lock().await;
            tokio::select! {
                biased;

                result = bootstrapped.wait() => match result {
                    Ok(()) => Ok(Bootstrap::Ready),
                    // Output closed early: the exit or the deadline decides.
                    Err(Error::LogStreamClosed { .. }) => {
                        debug!("Daemon {} closed its output before bootstrap", pid);
                        tokio::select! {
                            status = child.wait() => Err(exited_early(status?)),
                            _ = &mut deadline => give_up(&mut child, pid, timeout, attempt).await,
                        }
                    }
                    Err(e) => Err(e),
                },

                status = child.wait() => Err(exited_early(status?)),

                _ = &mut deadline => give_up(&mut child, pid, timeout, attempt).await,
            }
        };

        match outcome {
            Ok(Bootstrap::Ready) => {
                info!("Tor bootstrapped (pid {}, port {}, attempt {})", pid, port, attempt);
                process.set_state(ProcessState::Active);
                Ok(Attempt::Active(process))
            }
            Ok(Bootstrap::TimedOut) => {
                process.set_state(ProcessState::Failed);
                Ok(Attempt::TimedOut)
            }
            Err(e) => {
                process.set_state(ProcessState::Failed);
                Err(e)
            }
        }
    }

    /// Ask the daemon for a new identity (SIGHUP) and wait for the ack.
    pub async fn rotate_identity(&self, process: &ManagedProcess) -> Result<()> {
        let mut child = process.lock().await;
        let state = process.state();
        if state != ProcessState::Active {
            return Err(Error::NotActive { state });
        }

        process.set_state(ProcessState::RotatingIdentity);
        let result = self
            .signal_and_await_locked(
                process,
                DaemonSignal::RotateIdentity,
                self.markers.get(Marker::Reloaded),
            )
            .await;

        match result {
            Ok(()) => {
                info!("Tor identity rotated (pid {})", process.pid());
                process.set_state(ProcessState::Active);
                Ok(())
            }
            Err(e) => {
                let next = if child.try_wait()?.is_some() {
                    ProcessState::Failed
                } else {
                    ProcessState::Active
                };
                process.set_state(next);
                Err(e)
            }
        }
    }

    /// Shut the daemon down (SIGINT), wait for the ack and the settle delay,
    /// then reap it. Terminating an already terminated process succeeds.
    pub async fn terminate(&self, process: &ManagedProcess) -> Result<()> {
        let mut child = process.lock().await;
        if process.state() == ProcessState::Terminated {
            debug!("Daemon {} already terminated", process.pid());
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            debug!("Daemon {} already exited ({})", process.pid(), status);
            process.set_state(ProcessState::Terminated);
            return Ok(());
        }

        process.set_state(ProcessState::Terminating);

        if process.logs().is_ended() {
            // Output already closed, nothing left to acknowledge a signal.
            debug!("Daemon {} output closed, reaping", process.pid());
            reap(&mut child, process.pid()).await?;
            process.set_state(ProcessState::Terminated);
            return Ok(());
        }

        info!("Shutting down Tor process (pid {})...", process.pid());

        match self
            .signal_and_await_locked(
                process,
                DaemonSignal::Shutdown,
                self.markers.get(Marker::ShutDown),
            )
            .await
        {
            Ok(()) => tokio::time::sleep(self.settle_delay).await,
            Err(Error::LogStreamClosed { .. }) => {
                warn!(
                    "Daemon {} closed its output without acknowledging shutdown",
                    process.pid()
                );
            }
            Err(e) => {
                if child.try_wait()?.is_some() {
                    process.set_state(ProcessState::Terminated);
                }
                return Err(e);
            }
        }

        reap(&mut child, process.pid()).await?;
        process.set_state(ProcessState::Terminated);
        Ok(())
    }

    /// Send `signal` and wait for `marker` to appear in the daemon's output.
    ///
    /// Queues behind any other signal operation on the same process.
    pub async fn signal_and_await(
        &self,
        process: &ManagedProcess,
        signal: DaemonSignal,
        marker: &str,
    ) -> Result<()> {
        let _guard = process.lock().await;
        self.signal_and_await_locked(process, signal, marker).await
    }

    async fn signal_and_await_locked(
        &self,
        process: &ManagedProcess,
        signal: DaemonSignal,
        marker: &str,
    ) -> Result<()> {
        // Subscribe first so a fast ack cannot slip past.
        let ack = process.logs().watch(marker);
        if process.logs().is_ended() {
            return Err(Error::LogStreamClosed {
                marker: marker.to_string(),
            });
        }
        debug!("Sending {} to daemon {}", signal, process.pid());
        signal::send(process.pid(), signal)?;
        ack.wait().await
    }
}

fn exited_early(status: std::process::ExitStatus) -> Error {
    warn!("Tor exited before bootstrap ({})", status);
    Error::SpawnFailure { status }
}

/// Kill an attempt that missed its bootstrap deadline.
async fn give_up(
    child: &mut Child,
    pid: u32,
    timeout: Option<Duration>,
    attempt: u32,
) -> Result<Bootstrap> {
    warn!(
        "Tor did not bootstrap within {:?} (pid {}, attempt {}), killing",
        timeout.unwrap_or_default(),
        pid,
        attempt
    );
    kill(child, pid).await?;
    Ok(Bootstrap::TimedOut)
}

/// Wait for the child to exit, killing it if it takes too long.
async fn reap(child: &mut Child, pid: u32) -> Result<()> {
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(status) => {
            debug!("Daemon {} exited ({})", pid, status?);
            Ok(())
        }
        Err(_) => {
            warn!("Daemon {} is still running, killing", pid);
            kill(child, pid).await
        }
    }
}

async fn kill(child: &mut Child, pid: u32) -> Result<()> {
    match child.kill().await {
        Ok(()) => Ok(()),
        // Already gone
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(Error::Signal {
            signal: DaemonSignal::Kill.name(),
            pid,
            source: e,
        }),
    }
}
