//! Shared fixtures: a shell script that behaves like the tor daemon, a
//! minimal SOCKS5 server and TLS test servers.

#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use toragent::{ProcessSupervisor, TlsOptions};

pub const SETTLE: Duration = Duration::from_millis(50);

/// How the fake daemon behaves. `$4` is the data directory.
#[derive(Debug, Clone, Default)]
pub struct FakeTor {
    /// Seconds to wait before printing the bootstrap line.
    pub bootstrap_delay: Option<&'static str>,
    /// Launches that hang without bootstrapping before one succeeds.
    pub hang_launches: Option<u32>,
    /// Never bootstrap.
    pub never_bootstrap: bool,
    /// Exit with this code before bootstrapping.
    pub exit_code: Option<i32>,
    /// Seconds to wait before acknowledging SIGHUP.
    pub reload_delay: Option<&'static str>,
    /// Exit on SIGHUP without acknowledging.
    pub die_on_reload: bool,
    /// Close stdout without bootstrapping, then keep running.
    pub close_output: bool,
}

impl FakeTor {
    fn script(&self) -> String {
        let mut s = String::from("#!/bin/sh\nDIR=\"$4\"\necho \"$@\" >> \"$DIR/launches\"\n");

        let reload = if self.die_on_reload {
            "exit 0".to_string()
        } else {
            format!(
                "{}echo reload >> \"$DIR/reloads\"; echo \"[notice] Received reload signal (hup). Reloading config and resetting internal state.\"",
                self.reload_delay
                    .map(|d| format!("sleep {}; ", d))
                    .unwrap_or_default()
            )
        };
        s.push_str(&format!("trap '{}' HUP\n", reload));
        s.push_str(
            "trap 'echo \"[notice] Interrupt: exiting cleanly.\"; echo stopped >> \"$DIR/stopped\"; exit 0' INT\n",
        );
        s.push_str("echo \"[notice] Tor 0.4.8 running on Linux.\"\n");

        if let Some(code) = self.exit_code {
            s.push_str("echo \"[err] Reading config failed\"\n");
            s.push_str(&format!("exit {}\n", code));
        }

        let hang = "while true; do sleep 1 >/dev/null 2>&1 & wait $!; done\n";
        if self.close_output {
            s.push_str("exec >&-\n");
            s.push_str(hang);
        }
        if self.never_bootstrap {
            s.push_str(hang);
        }
        if let Some(n) = self.hang_launches {
            s.push_str(&format!(
                "if [ \"$(wc -l < \"$DIR/launches\")\" -le {} ]; then\n  {}fi\n",
                n, hang
            ));
        }
        if let Some(delay) = self.bootstrap_delay {
            s.push_str(&format!("sleep {}\n", delay));
        }

        s.push_str("echo \"[notice] Bootstrapped 50% (loading_descriptors)\"\n");
        s.push_str("echo \"[notice] Bootstrapped 100% (done): Done\"\n");
        s.push_str(hang);
        s
    }

    /// Write the script into `dir` and return its path.
    pub fn install(&self, dir: &Path) -> PathBuf {
        let path = dir.join("tor");
        fs::write(&path, self.script()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

/// Scratch layout for one test: a bin dir holding the script, a data dir.
pub struct Sandbox {
    pub bin: TempDir,
    pub data: TempDir,
    pub tor: PathBuf,
}

impl Sandbox {
    pub fn new(fake: FakeTor) -> Self {
        let bin = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let tor = fake.install(bin.path());
        Self { bin, data, tor }
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(&self.tor).settle_delay(SETTLE)
    }

    pub fn launches(&self) -> Vec<String> {
        read_lines(&self.data.path().join("launches"))
    }

    pub fn reloads(&self) -> usize {
        read_lines(&self.data.path().join("reloads")).len()
    }

    pub fn stopped(&self) -> bool {
        self.data.path().join("stopped").exists()
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// What the fake SOCKS server does with a CONNECT.
#[derive(Debug, Clone, Copy)]
pub enum SocksReply {
    /// Succeed and splice to the backend.
    Forward(SocketAddr),
    /// Splice to the backend until it hangs up, then reset the client.
    ResetAfterBackend(SocketAddr),
    /// Reply with this error code.
    Refuse(u8),
}

/// One-method SOCKS5 server that records requested destinations and forwards
/// every tunnel to a single backend regardless of the requested address.
pub struct FakeSocks {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<(String, u16)>>>,
}

impl FakeSocks {
    pub async fn start(reply: SocksReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve_socks(stream, reply, recorded).await;
                });
            }
        });

        Self { port, requests }
    }

    pub fn requests(&self) -> Vec<(String, u16)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_socks(
    mut client: TcpStream,
    reply: SocksReply,
    recorded: Arc<Mutex<Vec<(String, u16)>>>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    let host = match req[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let port = client.read_u16().await?;
    recorded.lock().unwrap().push((host, port));

    match reply {
        SocksReply::Refuse(code) => {
            client
                .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Ok(())
        }
        SocksReply::Forward(backend) => {
            let mut upstream = TcpStream::connect(backend).await?;
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
            Ok(())
        }
        SocksReply::ResetAfterBackend(backend) => {
            let mut upstream = TcpStream::connect(backend).await?;
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await?;

            let mut from_client = [0u8; 4096];
            let mut from_backend = [0u8; 4096];
            loop {
                tokio::select! {
                    n = client.read(&mut from_client) => {
                        let n = n?;
                        if n == 0 {
                            return Ok(());
                        }
                        upstream.write_all(&from_client[..n]).await?;
                    }
                    n = upstream.read(&mut from_backend) => {
                        let n = n?;
                        if n == 0 {
                            break;
                        }
                        client.write_all(&from_backend[..n]).await?;
                    }
                }
            }

            // Zero linger turns the close into an RST.
            #[allow(deprecated)]
            client.set_linger(Some(Duration::ZERO))?;
            drop(client);
            Ok(())
        }
    }
}

/// What a TLS test server does once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPeer {
    /// Echo application data back.
    Echo,
    /// Close the connection.
    HangUp,
    /// Write bytes that are not a TLS record, then idle.
    Garbage,
}

/// TLS server with a fresh self-signed certificate for `names`.
pub async fn tls_server(names: &[&str], peer: TlsPeer) -> (SocketAddr, CertificateDer<'static>) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(names).unwrap();
    let cert_der = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der.clone()], key)
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                match peer {
                    TlsPeer::Echo => {
                        let mut buf = [0u8; 1024];
                        while let Ok(n) = tls.read(&mut buf).await {
                            if n == 0 || tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = tls.flush().await;
                        }
                    }
                    TlsPeer::HangUp => drop(tls),
                    TlsPeer::Garbage => {
                        let _ = tls.flush().await;
                        let (mut tcp, _) = tls.into_inner();
                        let _ = tcp.write_all(b"GARBAGE, NOT A TLS RECORD\r\n").await;
                        let mut buf = [0u8; 1024];
                        while let Ok(n) = tcp.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, cert_der)
}

/// TLS echo server for `localhost`.
pub async fn tls_echo_server() -> (SocketAddr, CertificateDer<'static>) {
    tls_server(&["localhost"], TlsPeer::Echo).await
}

/// Options that trust `cert` on top of the usual roots.
pub fn trusting(cert: &CertificateDer<'static>) -> TlsOptions {
    TlsOptions {
        extra_roots: vec![cert.clone()],
        ..Default::default()
    }
}

/// Plain TCP echo server.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}
