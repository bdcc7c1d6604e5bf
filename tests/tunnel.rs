//! Tunneled connections through an in-process SOCKS5 server.

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{echo_server, tls_echo_server, tls_server, trusting, FakeSocks, SocksReply, TlsPeer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use toragent::tunnel::tls;
use toragent::{
    Error, TlsOptions, Transport, TransportAgent, TunnelError, TunnelRequest,
    TunneledConnectionFactory,
};

const ONION: &str = "duckduckgogg42xjoc72x3sjasowoarfbgcmvfimaftt6twagswzczad.onion";

#[tokio::test]
async fn test_plain_request_yields_raw_tunnel() {
    let socks = FakeSocks::start(SocksReply::Forward(echo_server().await)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    let mut conn = factory
        .create_connection(&TunnelRequest::plain(ONION, None))
        .await
        .unwrap();

    assert!(!conn.is_secure());
    assert!(conn.peer_certificates().is_none());
    assert_eq!(conn.target().port, 80);

    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert_eq!(
        socks.requests(),
        vec![(ONION.to_string(), 80)]
    );
}

#[tokio::test]
async fn test_plain_request_uses_factory_default_port() {
    let socks = FakeSocks::start(SocksReply::Forward(echo_server().await)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port).default_port(8080);

    factory
        .create_connection(&TunnelRequest::plain("example.com", None))
        .await
        .unwrap();
    factory
        .create_connection(&TunnelRequest::plain("10.0.0.1", 9000))
        .await
        .unwrap();

    assert_eq!(
        socks.requests(),
        vec![
            ("example.com".to_string(), 8080),
            ("10.0.0.1".to_string(), 9000)
        ]
    );
}

#[tokio::test]
async fn test_secure_request_on_port_80_goes_to_443_with_tls() {
    let (backend, cert) = tls_echo_server().await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    let request = TunnelRequest::secure("localhost", 80).with_tls(trusting(&cert));
    let mut conn = factory.create_connection(&request).await.unwrap();

    assert!(conn.is_secure());
    assert_eq!(conn.target().port, 443);
    assert_eq!(socks.requests(), vec![("localhost".to_string(), 443)]);
    let presented = conn.peer_certificates().unwrap();
    assert_eq!(presented[0], cert);

    conn.write_all(b"over tls").await.unwrap();
    let mut buf = [0u8; 8];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over tls");
}

#[tokio::test]
async fn test_secure_request_keeps_explicit_port() {
    let (backend, cert) = tls_echo_server().await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    factory
        .create_connection(&TunnelRequest::secure("localhost", 8443).with_tls(trusting(&cert)))
        .await
        .unwrap();

    assert_eq!(socks.requests(), vec![("localhost".to_string(), 8443)]);
}

#[tokio::test]
async fn test_untrusted_certificate_is_tls_error() {
    let (backend, _cert) = tls_echo_server().await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    let err = factory
        .create_connection(&TunnelRequest::secure("localhost", None))
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Tls { ref host, .. } if host == "localhost"));
}

#[tokio::test]
async fn test_server_name_override_is_verified() {
    let (backend, cert) = tls_echo_server().await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    // The certificate is for localhost, so verifying against another name fails.
    let mut tls = trusting(&cert);
    tls.server_name = Some("example.com".to_string());
    let err = factory
        .create_connection(&TunnelRequest::secure("localhost", None).with_tls(tls))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Tls { ref host, .. } if host == "example.com"));
}

#[tokio::test]
async fn test_tls_failure_after_handshake_surfaces_on_read() {
    let (backend, cert) = tls_server(&["localhost"], TlsPeer::Garbage).await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    let mut conn = factory
        .create_connection(&TunnelRequest::secure("localhost", None).with_tls(trusting(&cert)))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let err = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn test_insecure_mode_accepts_self_signed() {
    let (backend, _cert) = tls_echo_server().await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    let request = TunnelRequest::secure("localhost", None).with_tls(TlsOptions {
        insecure: true,
        ..Default::default()
    });
    let conn = factory.create_connection(&request).await.unwrap();
    assert!(conn.is_secure());
}

#[tokio::test]
async fn test_socks_rejection_surfaces_code() {
    let socks = FakeSocks::start(SocksReply::Refuse(0x05)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port);

    let err = factory
        .create_connection(&TunnelRequest::plain("example.com", 80))
        .await
        .unwrap_err();

    match err {
        TunnelError::Rejected { code, target, .. } => {
            assert_eq!(code, 0x05);
            assert_eq!(target, "example.com:80");
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_agent_reuses_released_connections() {
    let socks = FakeSocks::start(SocksReply::Forward(echo_server().await)).await;
    let agent = TransportAgent::new(TunneledConnectionFactory::new("127.0.0.1", socks.port));
    let request = TunnelRequest::plain("example.com", None);

    let conn = agent.create_connection(&request).await.unwrap();
    agent.release(&request, conn);
    assert_eq!(agent.pool().total_idle(), 1);

    let mut conn = agent.create_connection(&request).await.unwrap();
    assert_eq!(socks.requests().len(), 1);

    conn.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");

    // A different target needs a new tunnel.
    agent
        .create_connection(&TunnelRequest::plain("example.org", None))
        .await
        .unwrap();
    assert_eq!(socks.requests().len(), 2);
}

#[tokio::test]
async fn test_agent_destroy_closes_pool() {
    let socks = FakeSocks::start(SocksReply::Forward(echo_server().await)).await;
    let agent = TransportAgent::new(TunneledConnectionFactory::new("127.0.0.1", socks.port));
    let request = TunnelRequest::plain("example.com", None);

    let conn = agent.create_connection(&request).await.unwrap();
    agent.release(&request, conn);

    agent.destroy().await.unwrap();
    assert_eq!(agent.pool().total_idle(), 0);
}

#[tokio::test]
async fn test_agent_maps_tunnel_errors() {
    let socks = FakeSocks::start(SocksReply::Refuse(0x04)).await;
    let agent = TransportAgent::new(TunneledConnectionFactory::new("127.0.0.1", socks.port));

    let err = agent
        .create_connection(&TunnelRequest::plain("example.com", None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Tunnel(TunnelError::Rejected { code: 0x04, .. })
    ));
}

#[tokio::test]
async fn test_agent_does_not_reuse_sessions_verified_for_another_name() {
    let (backend, cert) = tls_server(&["alias.test"], TlsPeer::Echo).await;
    let socks = FakeSocks::start(SocksReply::Forward(backend)).await;
    let factory = TunneledConnectionFactory::new("127.0.0.1", socks.port)
        .tls_config(tls::client_config(&trusting(&cert)).unwrap());
    let agent = TransportAgent::new(factory);

    let aliased = TunnelRequest::secure("localhost", None).with_tls(TlsOptions {
        server_name: Some("alias.test".to_string()),
        ..Default::default()
    });
    let conn = agent.create_connection(&aliased).await.unwrap();
    agent.release(&aliased, conn);
    assert_eq!(agent.pool().total_idle(), 0);

    // Without the override the certificate does not match `localhost`.
    let err = agent
        .create_connection(&TunnelRequest::secure("localhost", None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Tunnel(TunnelError::Tls { ref host, .. }) if host == "localhost"
    ));
    assert_eq!(socks.requests().len(), 2);
}
