//! Error types for the daemon supervisor and the tunneled transport.

use std::process::ExitStatus;

use thiserror::Error;

use crate::daemon::ProcessState;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while tunneling a connection through the SOCKS proxy.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to connect to SOCKS proxy {addr}: {source}")]
    ProxyConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(String),

    #[error("SOCKS5 connect to {target} rejected: {reason} (code {code})")]
    Rejected {
        target: String,
        code: u8,
        reason: &'static str,
    },

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level library error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Tor binary not found. Install tor or set tor_binary in config.")]
    BinaryNotFound,

    #[error("Daemon exited before bootstrap completed ({status})")]
    SpawnFailure { status: ExitStatus },

    #[error("Daemon failed to bootstrap after {attempts} attempt(s)")]
    BootstrapExhausted { attempts: u32 },

    #[error("Daemon output ended before marker {marker:?} was seen")]
    LogStreamClosed { marker: String },

    #[error("Failed to send {signal} to pid {pid}: {source}")]
    Signal {
        signal: &'static str,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon is {state}, expected it to be active")]
    NotActive { state: ProcessState },

    #[error("Agent does not own a daemon process")]
    NoManagedProcess,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Destroy failed (pool: {pool:?}, process: {process:?})")]
    Destroy {
        pool: Option<String>,
        process: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
