//! Ephemeral port allocation.

use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Reserve `n` distinct free loopback ports.
///
/// All listeners are held until every port is picked so the OS cannot hand
/// out the same port twice, then released for the caller to bind.
pub fn allocate(n: usize) -> io::Result<Vec<u16>> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<io::Result<Vec<_>>>()?;

    listeners
        .iter()
        .map(|l| l.local_addr().map(|addr| addr.port()))
        .collect()
}

/// Reserve a single free loopback port.
pub fn allocate_one() -> io::Result<u16> {
    allocate(1)?
        .pop()
        .ok_or_else(|| io::Error::other("no port allocated"))
}
