//! The single socket handed to callers.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use super::factory::Target;

/// Raw tunneled TCP or TLS on top of it.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

/// A connection to a target, tunneled through the SOCKS proxy.
///
/// For secure targets the TLS session is already established; there is no
/// way to reach the raw tunnel underneath. Reads and writes carry any TLS
/// failure as an `io::Error`, so there is one error channel either way.
pub struct Connection {
    target: Target,
    stream: MaybeTlsStream,
}

impl Connection {
    pub(crate) fn plain(target: Target, stream: TcpStream) -> Self {
        Self {
            target,
            stream: MaybeTlsStream::Plain(stream),
        }
    }

    pub(crate) fn secure(target: Target, stream: TlsStream<TcpStream>) -> Self {
        Self {
            target,
            stream: MaybeTlsStream::Secure(Box::new(stream)),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream, MaybeTlsStream::Secure(_))
    }

    /// Certificates presented by the target, if TLS was negotiated.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match &self.stream {
            MaybeTlsStream::Plain(_) => None,
            MaybeTlsStream::Secure(tls) => tls.get_ref().1.peer_certificates(),
        }
    }

    /// Negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match &self.stream {
            MaybeTlsStream::Plain(_) => None,
            MaybeTlsStream::Secure(tls) => tls.get_ref().1.alpn_protocol(),
        }
    }

    /// The TCP socket to the proxy.
    pub fn proxy_socket(&self) -> &TcpStream {
        match &self.stream {
            MaybeTlsStream::Plain(tcp) => tcp,
            MaybeTlsStream::Secure(tls) => tls.get_ref().0,
        }
    }

    pub fn into_inner(self) -> MaybeTlsStream {
        self.stream
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("secure", &self.is_secure())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            MaybeTlsStream::Secure(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.stream {
            MaybeTlsStream::Plain(s) => s.is_write_vectored(),
            MaybeTlsStream::Secure(s) => s.is_write_vectored(),
        }
    }
}
