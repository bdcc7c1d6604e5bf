//! Produces connections tunneled through the daemon's SOCKS port.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use super::connection::Connection;
use super::socks5;
use super::tls::{self, TlsOptions};
use crate::error::TunnelError;

pub const DEFAULT_PROXY_HOST: &str = "localhost";
pub const DEFAULT_PROXY_PORT: u16 = 9050;
pub const DEFAULT_PLAIN_PORT: u16 = 80;
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Circuits can take a while to build; matches Tor's own circuit timeout scale.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether the target speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Plain,
    Secure,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" | "ws" => Some(Protocol::Plain),
            "https" | "wss" => Some(Protocol::Secure),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Plain => write!(f, "plain"),
            Protocol::Secure => write!(f, "secure"),
        }
    }
}

/// Resolved destination of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// A request for one tunneled connection.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub protocol: Protocol,
    pub host: String,
    /// `None` means "not specified by the caller".
    pub port: Option<u16>,
    pub tls: TlsOptions,
}

impl TunnelRequest {
    pub fn plain(host: impl Into<String>, port: impl Into<Option<u16>>) -> Self {
        Self {
            protocol: Protocol::Plain,
            host: host.into(),
            port: port.into(),
            tls: TlsOptions::default(),
        }
    }

    pub fn secure(host: impl Into<String>, port: impl Into<Option<u16>>) -> Self {
        Self {
            protocol: Protocol::Secure,
            ..Self::plain(host, port)
        }
    }

    /// Build a request from an `http(s)://` or `ws(s)://` URL.
    pub fn from_url(url: &Url) -> Result<Self, TunnelError> {
        let protocol = Protocol::from_scheme(url.scheme()).ok_or_else(|| {
            TunnelError::Handshake(format!("unsupported URL scheme: {}", url.scheme()))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::Handshake(format!("URL has no host: {}", url)))?;

        Ok(Self {
            protocol,
            host: host.to_string(),
            port: url.port(),
            tls: TlsOptions::default(),
        })
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Apply the port policy.
    ///
    /// Plain requests without a port use `default_port`. Secure requests
    /// without a port, or with the plain default of 80, go to 443.
    pub fn target(&self, default_port: u16) -> Target {
        let port = match (self.protocol, self.port) {
            (Protocol::Secure, None) => DEFAULT_SECURE_PORT,
            (Protocol::Secure, Some(DEFAULT_PLAIN_PORT)) => DEFAULT_SECURE_PORT,
            (Protocol::Secure, Some(port)) => port,
            (Protocol::Plain, None) => default_port,
            (Protocol::Plain, Some(port)) => port,
        };
        Target {
            protocol: self.protocol,
            host: self.host.clone(),
            port,
        }
    }
}

/// Opens SOCKS5 tunnels, upgrading them to TLS for secure targets.
#[derive(Clone)]
pub struct TunneledConnectionFactory {
    proxy_host: String,
    proxy_port: u16,
    default_port: u16,
    connect_timeout: Duration,
    default_tls: Arc<OnceCell<Arc<ClientConfig>>>,
}

impl fmt::Debug for TunneledConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunneledConnectionFactory")
            .field("proxy", &self.proxy_addr())
            .field("default_port", &self.default_port)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for TunneledConnectionFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT)
    }
}

impl TunneledConnectionFactory {
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            default_port: DEFAULT_PLAIN_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_tls: Arc::new(OnceCell::new()),
        }
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use `config` for every secure request with default TLS options.
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.default_tls = Arc::new(OnceCell::new_with(Some(config)));
        self
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// Where `request` will be tunneled to.
    pub fn target_for(&self, request: &TunnelRequest) -> Target {
        request.target(self.default_port)
    }

    async fn client_config(&self, options: &TlsOptions) -> Result<Arc<ClientConfig>, TunnelError> {
        if options.uses_default_config() {
            self.default_tls
                .get_or_try_init(|| async { tls::client_config(&TlsOptions::default()) })
                .await
                .cloned()
        } else {
            tls::client_config(options)
        }
    }

    /// Open a connection for `request`.
    pub async fn create_connection(
        &self,
        request: &TunnelRequest,
    ) -> Result<Connection, TunnelError> {
        let timeout = self.connect_timeout;
        tokio::time::timeout(timeout, self.connect(request))
            .await
            .map_err(|_| TunnelError::Timeout(timeout))?
    }

    async fn connect(&self, request: &TunnelRequest) -> Result<Connection, TunnelError> {
        let target = self.target_for(request);

        let mut tcp = TcpStream::connect((self.proxy_host.as_str(), self.proxy_port))
            .await
            .map_err(|source| TunnelError::ProxyConnect {
                addr: self.proxy_addr(),
                source,
            })?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on tunnel to {}: {}", target, e);
        }

        socks5::handshake(&mut tcp, &target.host, target.port).await?;
        debug!("Tunnel to {} established via {}", target, self.proxy_addr());

        match target.protocol {
            Protocol::Plain => Ok(Connection::plain(target, tcp)),
            Protocol::Secure => {
                let config = self.client_config(&request.tls).await?;
                let name = request.tls.server_name.as_deref().unwrap_or(&target.host);
                let server_name = tls::server_name(name)?;

                let stream = TlsConnector::from(config)
                    .connect(server_name, tcp)
                    .await
                    .map_err(|source| TunnelError::Tls {
                        host: name.to_string(),
                        source,
                    })?;
                debug!("TLS established with {}", target);
                Ok(Connection::secure(target, stream))
            }
        }
    }
}
