//! Low-level UDP socket creation.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::TransportConfig;
use crate::error::{Result, TransportError};

/// Create a UDP socket bound to `addr` and register it with tokio.
pub(crate) fn bind_udp(addr: SocketAddr, config: &TransportConfig) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set send buffer: {e}")))?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set recv buffer: {e}")))?;
    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::SocketError(format!("set reuse addr: {e}")))?;
    }

    // For IPv6, allow IPv4 mapped addresses
    if addr.is_ipv6() {
        socket
            .set_only_v6(false)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
    }

    socket.bind(&addr.into()).map_err(|e| TransportError::BindFailed {
        addr,
        reason: e.to_string(),
    })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| {
        TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        }
        .into()
    })
}

/// The unspecified bind address matching `remote`'s family.
pub(crate) fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv6() {
        SocketAddr::from(([0u8; 16], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    }
}
