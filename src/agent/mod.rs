//! Transport agent: a connection factory plus an optional owned daemon.
//!
//! An agent is either unmanaged, pointing at a SOCKS proxy someone else
//! runs, or managed, owning a daemon it launched on a private port with a
//! private data directory. Destroying a managed agent shuts the daemon down.
//!
//! ```no_run
//! use toragent::{AgentConfig, Transport, TransportAgent, TunnelRequest};
//!
//! # async fn demo() -> toragent::Result<()> {
//! let agent = TransportAgent::create_managed(&AgentConfig::default(), true).await?;
//! let conn = agent
//!     .create_connection(&TunnelRequest::secure("check.torproject.org", None))
//!     .await?;
//! drop(conn);
//! agent.rotate_identity().await?;
//! agent.destroy().await?;
//! # Ok(())
//! # }
//! ```

mod pool;

use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, TlsConfig};
use crate::daemon::{ManagedProcess, ProcessSupervisor};
use crate::error::{Error, Result};
use crate::ports;
use crate::tunnel::{tls, Connection, TunnelRequest, TunneledConnectionFactory};

pub use pool::{ConnectionPool, DEFAULT_MAX_IDLE_PER_TARGET};

/// Address the managed daemon's SOCKS port listens on.
const MANAGED_PROXY_HOST: &str = "127.0.0.1";

/// Something that hands out tunneled connections and can be torn down.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_connection(&self, request: &TunnelRequest) -> Result<Connection>;

    async fn destroy(&self) -> Result<()>;
}

/// Logs at info when verbose, debug otherwise.
macro_rules! milestone {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

struct Managed {
    supervisor: ProcessSupervisor,
    process: ManagedProcess,
    data_dir: Mutex<Option<TempDir>>,
}

/// Tunneled transport with connection reuse and optional daemon ownership.
pub struct TransportAgent {
    factory: TunneledConnectionFactory,
    pool: ConnectionPool,
    managed: Option<Managed>,
}

impl std::fmt::Debug for TransportAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportAgent")
            .field("factory", &self.factory)
            .field("process", &self.process())
            .finish()
    }
}

impl TransportAgent {
    /// Unmanaged agent using `factory`'s proxy.
    pub fn new(factory: TunneledConnectionFactory) -> Self {
        Self {
            factory,
            pool: ConnectionPool::default(),
            managed: None,
        }
    }

    /// Unmanaged agent for the proxy named in `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        let factory = configure_tls(config, config.factory(&config.socks_host, config.socks_port))?;
        Ok(Self::new(factory))
    }

    pub fn with_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = pool;
        self
    }

    /// Launch a private daemon and build an agent that owns it.
    ///
    /// Allocates a free loopback port and a fresh `toragent-*` data directory,
    /// then waits for bootstrap under the configured retry policy.
    pub async fn create_managed(config: &AgentConfig, verbose: bool) -> Result<Self> {
        config.validate()?;
        let supervisor = ProcessSupervisor::from_config(&config.daemon)?;

        let port = ports::allocate_one()?;
        let data_dir = tempfile::Builder::new().prefix("toragent-").tempdir()?;

        milestone!(
            verbose,
            "Starting {} on SOCKS port {} (data dir {})",
            supervisor.binary().display(),
            port,
            data_dir.path().display()
        );

        let process = supervisor
            .spawn(port, data_dir.path(), &config.daemon.retry_policy())
            .await?;

        milestone!(
            verbose,
            "Daemon ready: pid {}, port {}, {} attempt(s)",
            process.pid(),
            port,
            process.attempts()
        );

        let factory = configure_tls(config, config.factory(MANAGED_PROXY_HOST, port))?;

        Ok(Self {
            factory,
            pool: ConnectionPool::default(),
            managed: Some(Managed {
                supervisor,
                process,
                data_dir: Mutex::new(Some(data_dir)),
            }),
        })
    }

    pub fn factory(&self) -> &TunneledConnectionFactory {
        &self.factory
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn is_managed(&self) -> bool {
        self.managed.is_some()
    }

    /// The owned daemon, if any.
    pub fn process(&self) -> Option<&ManagedProcess> {
        self.managed.as_ref().map(|m| &m.process)
    }

    pub fn supervisor(&self) -> Option<&ProcessSupervisor> {
        self.managed.as_ref().map(|m| &m.supervisor)
    }

    /// Proxy URL for clients that take one. `socks5h` so names resolve
    /// through the proxy.
    pub fn socks_url(&self) -> String {
        format!("socks5h://{}", self.factory.proxy_addr())
    }

    /// Give a connection back for reuse by later requests to the same target.
    ///
    /// Connections made with custom TLS options or a server name override are
    /// closed instead.
    pub fn release(&self, request: &TunnelRequest, conn: Connection) {
        if !request.tls.is_poolable() {
            return;
        }
        if let Some(conn) = self.pool.checkin(conn) {
            debug!("Pool full for {}, dropping connection", conn.target());
        }
    }

    /// Ask the owned daemon for new circuits.
    ///
    /// Pooled connections still ride the old circuits, so they are closed.
    pub async fn rotate_identity(&self) -> Result<()> {
        let managed = self.managed.as_ref().ok_or(Error::NoManagedProcess)?;
        managed.supervisor.rotate_identity(&managed.process).await?;

        if let Err(e) = self.pool.close_all().await {
            debug!("Error closing pooled connections after rotation: {}", e);
        }
        Ok(())
    }
}

fn configure_tls(
    config: &AgentConfig,
    factory: TunneledConnectionFactory,
) -> Result<TunneledConnectionFactory> {
    if config.tls == TlsConfig::default() {
        return Ok(factory);
    }
    if config.tls.insecure {
        warn!("TLS certificate verification disabled");
    }
    let client = tls::client_config(&config.tls.options()?)?;
    Ok(factory.tls_config(client))
}

#[async_trait]
impl Transport for TransportAgent {
    async fn create_connection(&self, request: &TunnelRequest) -> Result<Connection> {
        if request.tls.is_poolable() {
            let target = self.factory.target_for(request);
            if let Some(conn) = self.pool.checkout(&target) {
                return Ok(conn);
            }
        }
        Ok(self.factory.create_connection(request).await?)
    }

    /// Close pooled connections, then shut down the owned daemon.
    ///
    /// The daemon is always shut down, even if closing the pool failed.
    async fn destroy(&self) -> Result<()> {
        let pool_err = self.pool.close_all().await.err().map(|e| e.to_string());

        let process_err = match &self.managed {
            Some(managed) => match managed.supervisor.terminate(&managed.process).await {
                Ok(()) => {
                    let data_dir = managed
                        .data_dir
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    if let Some(dir) = data_dir {
                        if let Err(e) = dir.close() {
                            debug!("Failed to remove data directory: {}", e);
                        }
                    }
                    None
                }
                Err(e) => Some(e.to_string()),
            },
            None => None,
        };

        if pool_err.is_none() && process_err.is_none() {
            return Ok(());
        }
        warn!(
            "Destroy incomplete (pool: {:?}, process: {:?})",
            pool_err, process_err
        );
        Err(Error::Destroy {
            pool: pool_err,
            process: process_err,
        })
    }
}
