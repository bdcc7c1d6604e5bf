//! Log marker watching on a daemon's stdout.
//!
//! The daemon reports its state transitions only through its log output.
//! A [`LogStream`] fans stdout chunks out to any number of [`MarkerWatch`]es,
//! each of which resolves the first time a chunk contains its marker.
//!
//! Watches are plain broadcast subscriptions: creating one registers it,
//! dropping it (on match, on error, or when the awaiting future is
//! cancelled) deregisters it. Nothing lingers to fire on later output.
//!
//! Streams can be fed by [`LogStream::pump`] from a real child process or by
//! [`LogStream::publish`] directly, which lets tests simulate the daemon.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Buffered chunks per stream before slow watchers start lagging.
const STREAM_CAPACITY: usize = 256;

/// Read size for the stdout pump.
const READ_CHUNK: usize = 4096;

/// The state transitions announced by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Bootstrap complete, the SOCKS port is usable.
    Bootstrapped,
    /// The daemon acknowledged a reload (identity rotation).
    Reloaded,
    /// The daemon acknowledged a graceful shutdown.
    ShutDown,
}

/// Marker substrings for each transition. Matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSet {
    pub bootstrap: String,
    pub reload: String,
    pub shutdown: String,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            bootstrap: "Done".to_string(),
            reload: "Received reload signal".to_string(),
            shutdown: "exiting cleanly".to_string(),
        }
    }
}

impl MarkerSet {
    /// Substring announcing the given transition.
    pub fn get(&self, marker: Marker) -> &str {
        match marker {
            Marker::Bootstrapped => &self.bootstrap,
            Marker::Reloaded => &self.reload,
            Marker::ShutDown => &self.shutdown,
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Decides whether a chunk of output contains a marker.
pub trait MarkerMatcher: Send + Sync + fmt::Debug {
    fn matches(&self, chunk: &str, marker: &str) -> bool;
}

/// Plain substring containment. Not line-anchored.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringMatcher;

impl MarkerMatcher for SubstringMatcher {
    fn matches(&self, chunk: &str, marker: &str) -> bool {
        chunk.contains(marker)
    }
}

#[derive(Debug, Clone)]
enum LogEvent {
    Chunk(Arc<str>),
    Eof,
}

/// Fan-out of one process's stdout.
#[derive(Clone)]
pub struct LogStream {
    tx: broadcast::Sender<LogEvent>,
    ended: Arc<AtomicBool>,
    matcher: Arc<dyn MarkerMatcher>,
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream")
            .field("watchers", &self.watcher_count())
            .field("ended", &self.is_ended())
            .field("matcher", &self.matcher)
            .finish()
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStream {
    pub fn new() -> Self {
        Self::with_matcher(Arc::new(SubstringMatcher))
    }

    pub fn with_matcher(matcher: Arc<dyn MarkerMatcher>) -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            tx,
            ended: Arc::new(AtomicBool::new(false)),
            matcher,
        }
    }

    /// Register a watch for `marker`. Only output published after this call
    /// can satisfy it.
    pub fn watch(&self, marker: &str) -> MarkerWatch {
        MarkerWatch {
            rx: self.tx.subscribe(),
            marker: marker.to_string(),
            matcher: self.matcher.clone(),
        }
    }

    /// Publish a chunk of output. Returns the number of watches it reached.
    pub fn publish(&self, chunk: impl Into<Arc<str>>) -> usize {
        self.tx.send(LogEvent::Chunk(chunk.into())).unwrap_or(0)
    }

    /// Mark the stream as finished. Pending and future watches fail.
    pub fn close(&self) {
        self.ended.store(true, Ordering::SeqCst);
        let _ = self.tx.send(LogEvent::Eof);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Number of currently registered watches.
    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Spawn a task copying `reader` into this stream until EOF.
    pub fn pump<R>(&self, mut reader: R, pid: u32) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stream = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        log_daemon_output(pid, &chunk);
                        stream.publish(chunk);
                    }
                    Err(e) => {
                        warn!("Reading daemon {} output failed: {}", pid, e);
                        break;
                    }
                }
            }
            debug!("Daemon {} stdout closed", pid);
            stream.close();
        })
    }
}

fn log_daemon_output(pid: u32, chunk: &str) {
    for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
        if line.contains("[warn]") || line.contains("[err]") {
            warn!("tor[{}]: {}", pid, line);
        } else {
            trace!("tor[{}]: {}", pid, line);
        }
    }
}

/// A registered interest in one marker.
pub struct MarkerWatch {
    rx: broadcast::Receiver<LogEvent>,
    marker: String,
    matcher: Arc<dyn MarkerMatcher>,
}

impl fmt::Debug for MarkerWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkerWatch")
            .field("marker", &self.marker)
            .finish()
    }
}

impl MarkerWatch {
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Wait for the first chunk containing the marker. Consumes the watch,
    /// so the subscription is released however this returns.
    pub async fn wait(mut self) -> Result<()> {
        loop {
            match self.rx.recv().await {
                Ok(LogEvent::Chunk(chunk)) => {
                    if self.matcher.matches(&chunk, &self.marker) {
                        return Ok(());
                    }
                }
                Ok(LogEvent::Eof) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::LogStreamClosed {
                        marker: self.marker,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Marker watch for {:?} skipped {} chunk(s) of output",
                        self.marker, skipped
                    );
                }
            }
        }
    }
}

/// Resolve once `marker` appears on `stream`.
pub async fn await_marker(stream: &LogStream, marker: &str) -> Result<()> {
    let watch = stream.watch(marker);
    if stream.is_ended() {
        return Err(Error::LogStreamClosed {
            marker: marker.to_string(),
        });
    }
    watch.wait().await
}
