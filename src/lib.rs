//! toragent - managed Tor daemon and tunneled connections.
//!
//! Launches a private Tor daemon, waits for it to bootstrap, and opens TCP or
//! TLS connections through its SOCKS5 port. Identity rotation and shutdown
//! are driven by signals and confirmed from the daemon's log output.

pub mod agent;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ports;
pub mod tunnel;

pub use agent::{ConnectionPool, Transport, TransportAgent};
pub use config::{AgentConfig, DaemonConfig, TlsConfig};
pub use daemon::{
    await_marker, LogStream, ManagedProcess, Marker, MarkerSet, ProcessState, ProcessSupervisor,
    RetryPolicy,
};
pub use error::{Error, Result, TunnelError};
pub use tunnel::{Connection, Protocol, Target, TlsOptions, TunnelRequest, TunneledConnectionFactory};
