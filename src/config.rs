//! Agent configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables, then CLI flags.
//!
//! ```toml
//! socks_host = "localhost"
//! socks_port = 9050
//!
//! [daemon]
//! tor_binary = "/usr/local/bin/tor"
//! bootstrap_timeout_secs = 30
//! max_attempts = 5
//!
//! [daemon.markers]
//! bootstrap = "Done"
//!
//! [tls]
//! extra_roots = ["/etc/toragent/ca.pem"]
//! ```
//!
//! Environment:
//! - `SOCKS_PROXY=socks5://host:port` - proxy for unmanaged agents
//! - `TORAGENT_TOR_BINARY` - path to the tor binary
//! - `TORAGENT_BOOTSTRAP_TIMEOUT` - per-attempt bootstrap timeout in seconds
//! - `TORAGENT_MAX_ATTEMPTS` - launch attempts before giving up
//! - `TORAGENT_INSECURE_TLS=1` - skip certificate verification

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::daemon::{MarkerSet, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::error::{Error, Result};
use crate::tunnel::{
    tls, TlsOptions, TunneledConnectionFactory, DEFAULT_PLAIN_PORT, DEFAULT_PROXY_HOST,
    DEFAULT_PROXY_PORT,
};

/// File looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "toragent.toml";

/// Daemon launch and supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to tor binary (default: search PATH for "tor")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tor_binary: Option<PathBuf>,

    /// Extra command line arguments appended after the port and directory.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    /// Per-attempt bootstrap timeout. Default: 30
    pub bootstrap_timeout_secs: Option<u64>,

    /// Added to the bootstrap timeout on every retry. Default: 10
    pub timeout_step_secs: u64,

    /// Launch attempts before giving up. Default: 5
    pub max_attempts: u32,

    /// Pause between attempts on top of the settle delay. Default: 0
    pub retry_backoff_ms: u64,

    /// Wait after kill or shutdown for the port to be released. Default: 1000
    pub settle_delay_ms: u64,

    #[serde(skip_serializing_if = "MarkerSet::is_default")]
    pub markers: MarkerSet,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tor_binary: None,
            extra_args: Vec::new(),
            bootstrap_timeout_secs: Some(30),
            timeout_step_secs: 10,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: 0,
            settle_delay_ms: 1000,
            markers: MarkerSet::default(),
        }
    }
}

impl DaemonConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = match self.bootstrap_timeout_secs {
            Some(secs) => RetryPolicy::with_timeout(Duration::from_secs(secs)),
            None => RetryPolicy::none(),
        };
        policy
            .max_attempts(self.max_attempts)
            .backoff(Duration::from_millis(self.retry_backoff_ms))
            .timeout_step(Duration::from_secs(self.timeout_step_secs))
    }
}

/// TLS settings for secure targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Skip certificate verification (INSECURE).
    pub insecure: bool,

    /// PEM files with additional trust anchors.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_roots: Vec<PathBuf>,
}

impl TlsConfig {
    pub fn options(&self) -> Result<TlsOptions> {
        let mut extra_roots = Vec::new();
        for path in &self.extra_roots {
            extra_roots.extend(tls::load_pem_roots(path)?);
        }
        Ok(TlsOptions {
            server_name: None,
            insecure: self.insecure,
            extra_roots,
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// SOCKS proxy host for unmanaged agents. Default: localhost
    pub socks_host: String,

    /// SOCKS proxy port for unmanaged agents. Default: 9050
    pub socks_port: u16,

    /// Port used for plain targets that do not name one. Default: 80
    pub default_port: u16,

    /// Timeout for proxy connect plus SOCKS and TLS handshakes. Default: 120
    pub connect_timeout_secs: u64,

    pub daemon: DaemonConfig,

    pub tls: TlsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socks_host: DEFAULT_PROXY_HOST.to_string(),
            socks_port: DEFAULT_PROXY_PORT,
            default_port: DEFAULT_PLAIN_PORT,
            connect_timeout_secs: 120,
            daemon: DaemonConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl AgentConfig {
    /// Parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load `path` if given, else `toragent.toml` in the working directory if
    /// present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.is_file() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // SOCKS_PROXY - external proxy for unmanaged agents
        if let Some(proxy) = lookup("SOCKS_PROXY").filter(|v| !v.is_empty()) {
            let (host, port) = parse_proxy(&proxy)?;
            self.socks_host = host;
            self.socks_port = port;
        }

        if let Some(path) = lookup("TORAGENT_TOR_BINARY").filter(|v| !v.is_empty()) {
            self.daemon.tor_binary = Some(PathBuf::from(path));
        }

        if let Some(secs) = lookup("TORAGENT_BOOTSTRAP_TIMEOUT") {
            let secs = secs.parse().map_err(|_| {
                Error::Config(format!("TORAGENT_BOOTSTRAP_TIMEOUT is not a number: {}", secs))
            })?;
            self.daemon.bootstrap_timeout_secs = Some(secs);
        }

        if let Some(attempts) = lookup("TORAGENT_MAX_ATTEMPTS") {
            self.daemon.max_attempts = attempts.parse().map_err(|_| {
                Error::Config(format!("TORAGENT_MAX_ATTEMPTS is not a number: {}", attempts))
            })?;
        }

        if lookup("TORAGENT_INSECURE_TLS")
            .map(|v| is_truthy(&v))
            .unwrap_or(false)
        {
            self.tls.insecure = true;
        }

        Ok(self)
    }

    /// Apply CLI flag overrides.
    pub fn with_cli_overrides(
        mut self,
        tor_binary: Option<PathBuf>,
        proxy: Option<(String, u16)>,
        insecure: bool,
    ) -> Self {
        if let Some(path) = tor_binary {
            self.daemon.tor_binary = Some(path);
        }
        if let Some((host, port)) = proxy {
            self.socks_host = host;
            self.socks_port = port;
        }
        if insecure {
            self.tls.insecure = true;
        }
        self
    }

    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.socks_port == 0 {
            return Err(Error::Config("socks_port must not be 0".to_string()));
        }
        if self.default_port == 0 {
            return Err(Error::Config("default_port must not be 0".to_string()));
        }
        if self.daemon.max_attempts == 0 {
            return Err(Error::Config("daemon.max_attempts must be at least 1".to_string()));
        }
        if self.socks_host.is_empty() {
            return Err(Error::Config("socks_host must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Connection factory for the given proxy endpoint.
    pub fn factory(&self, proxy_host: &str, proxy_port: u16) -> TunneledConnectionFactory {
        TunneledConnectionFactory::new(proxy_host, proxy_port)
            .default_port(self.default_port)
            .connect_timeout(self.connect_timeout())
    }
}

/// Parse `socks5://host:port`, `socks5h://host:port` or `host:port`.
pub fn parse_proxy(value: &str) -> Result<(String, u16)> {
    let invalid = || Error::Config(format!("Invalid SOCKS proxy: {}", value));

    if value.contains("://") {
        let url = Url::parse(value).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "socks5" | "socks5h") {
            return Err(Error::Config(format!(
                "Unsupported proxy scheme {}, expected socks5",
                url.scheme()
            )));
        }
        let host = url.host_str().ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        return Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PROXY_PORT)));
    }

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}
