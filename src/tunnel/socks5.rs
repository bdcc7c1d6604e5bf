//! Minimal SOCKS5 client (RFC 1928): no-auth greeting and CONNECT.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

/// SOCKS5 protocol constants (RFC 1928)
pub(crate) mod consts {
    pub const VERSION: u8 = 0x05;

    pub mod auth {
        pub const NO_AUTH: u8 = 0x00;
        pub const NO_ACCEPTABLE: u8 = 0xff;
    }

    pub mod cmd {
        pub const CONNECT: u8 = 0x01;
    }

    pub mod addr_type {
        pub const IPV4: u8 = 0x01;
        pub const DOMAIN: u8 = 0x03;
        pub const IPV6: u8 = 0x04;
    }

    pub mod reply {
        pub const SUCCESS: u8 = 0x00;
        pub const RESERVED: u8 = 0x00;
    }
}

/// Human-readable text for a SOCKS5 reply code. Codes 0xF0-0xF7 are Tor
/// extensions (onion service errors).
pub fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        0xf0 => "onion service descriptor can not be found",
        0xf1 => "onion service descriptor is invalid",
        0xf2 => "onion service introduction failed",
        0xf3 => "onion service rendezvous failed",
        0xf4 => "onion service missing client authorization",
        0xf5 => "onion service wrong client authorization",
        0xf6 => "onion service invalid address",
        0xf7 => "onion service introduction timed out",
        _ => "unknown error",
    }
}

/// Encode the CONNECT request for `host:port`.
///
/// IP literals are sent as addresses; anything else is sent as a domain name
/// so that resolution happens at the exit, not locally.
pub fn connect_request(host: &str, port: u16) -> Result<Vec<u8>, TunnelError> {
    use consts::*;

    let mut request = vec![VERSION, cmd::CONNECT, reply::RESERVED];
    let unbracketed = host.trim_start_matches('[').trim_end_matches(']');
    match unbracketed.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(addr_type::IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(addr_type::IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(TunnelError::Handshake(format!(
                    "hostname must be 1-255 bytes, got {}",
                    name.len()
                )));
            }
            request.push(addr_type::DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Run the client side of a SOCKS5 handshake on `stream`, leaving it
/// connected to `host:port` through the proxy.
pub async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use consts::*;

    let request = connect_request(host, port)?;

    stream.write_all(&[VERSION, 0x01, auth::NO_AUTH]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(TunnelError::Handshake(format!(
            "unexpected SOCKS version 0x{:02x}",
            choice[0]
        )));
    }
    match choice[1] {
        auth::NO_AUTH => {}
        auth::NO_ACCEPTABLE => {
            return Err(TunnelError::Handshake(
                "proxy requires authentication".to_string(),
            ))
        }
        other => {
            return Err(TunnelError::Handshake(format!(
                "proxy selected unsupported auth method 0x{:02x}",
                other
            )))
        }
    }

    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(TunnelError::Handshake(format!(
            "unexpected SOCKS version 0x{:02x} in reply",
            header[0]
        )));
    }
    if header[1] != reply::SUCCESS {
        return Err(TunnelError::Rejected {
            target: format!("{}:{}", host, port),
            code: header[1],
            reason: reply_reason(header[1]),
        });
    }

    // Bound address is unused but must be drained.
    let remaining = match header[3] {
        addr_type::IPV4 => 4 + 2,
        addr_type::IPV6 => 16 + 2,
        addr_type::DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(TunnelError::Handshake(format!(
                "invalid address type 0x{:02x} in reply",
                other
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    Ok(())
}
