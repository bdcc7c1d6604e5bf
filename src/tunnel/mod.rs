//! Connections tunneled through the daemon's SOCKS5 endpoint.
//!
//! Plain targets get the raw tunneled socket. Secure targets get a TLS
//! session negotiated end-to-end with the target over that tunnel, using the
//! target hostname for SNI and certificate verification.

mod connection;
mod factory;
pub mod socks5;
pub mod tls;

pub use connection::{Connection, MaybeTlsStream};
pub use factory::{
    Protocol, Target, TunnelRequest, TunneledConnectionFactory, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_PLAIN_PORT, DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT, DEFAULT_SECURE_PORT,
};
pub use tls::TlsOptions;
