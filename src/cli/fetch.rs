//! Fetch command: one HTTP/1.1 GET through the tunnel.

use bytes::Bytes;
use console::style;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, CONNECTION, HOST, USER_AGENT};
use hyper::{HeaderMap, Method, Request, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use url::Url;

use super::helpers::{shutdown, start_managed};
use toragent::agent::{Transport, TransportAgent};
use toragent::config::AgentConfig;
use toragent::tunnel::{TunnelRequest, DEFAULT_PLAIN_PORT, DEFAULT_SECURE_PORT};

pub struct FetchOptions {
    pub rotate: bool,
    pub include_headers: bool,
    /// Use the configured proxy instead of launching a daemon.
    pub external_proxy: bool,
}

pub async fn cmd_fetch(
    config: &AgentConfig,
    url: &Url,
    options: FetchOptions,
    verbose: bool,
) -> anyhow::Result<()> {
    let agent = if options.external_proxy {
        TransportAgent::from_config(config)?
    } else {
        start_managed(config, verbose).await?
    };

    let result = fetch_with(&agent, url, &options).await;
    shutdown(&agent).await;
    let response = result?;

    let status_line = response.status_line();
    let status = if response.status.is_success() || response.status.is_redirection() {
        style(status_line).green()
    } else {
        style(status_line).red()
    };
    eprintln!("{}", status);
    if options.include_headers {
        for (name, value) in &response.headers {
            println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
        }
        println!();
    }
    println!("{}", String::from_utf8_lossy(&response.body));

    Ok(())
}

async fn fetch_with(
    agent: &TransportAgent,
    url: &Url,
    options: &FetchOptions,
) -> anyhow::Result<Response> {
    if options.rotate {
        if agent.is_managed() {
            agent.rotate_identity().await?;
            println!("{} New identity", style("✓").green());
        } else {
            eprintln!(
                "{} --rotate ignored: not managing a daemon",
                style("!").yellow()
            );
        }
    }

    let request = TunnelRequest::from_url(url)?;
    let conn = agent.create_connection(&request).await?;
    let secure = conn.is_secure();
    http_get(conn, url, secure).await
}

/// A fully read HTTP response.
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// e.g. `HTTP/1.1 200 OK`
    pub fn status_line(&self) -> String {
        format!("{:?} {}", self.version, self.status)
    }
}

/// `Host` header value: the port is included only when it is not the
/// scheme's default.
fn host_header(url: &Url, secure: bool) -> String {
    let host = url.host_str().unwrap_or_default();
    let default = if secure {
        DEFAULT_SECURE_PORT
    } else {
        DEFAULT_PLAIN_PORT
    };
    match url.port() {
        Some(port) if port != default => format!("{}:{}", host, port),
        _ => host.to_string(),
    }
}

fn build_request(url: &Url, secure: bool) -> anyhow::Result<Request<Empty<Bytes>>> {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, host_header(url, secure))
        .header(USER_AGENT, concat!("toragent/", env!("CARGO_PKG_VERSION")))
        .header(ACCEPT, "*/*")
        .header(CONNECTION, "close")
        .body(Empty::new())?)
}

/// Send a GET over `io` and read the whole response.
pub async fn http_get<T>(io: T, url: &Url, secure: bool) -> anyhow::Result<Response>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("HTTP connection closed: {}", e);
        }
    });

    let response = sender.send_request(build_request(url, secure)?).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    Ok(Response {
        version: parts.version,
        status: parts.status,
        headers: parts.headers,
        body,
    })
}
