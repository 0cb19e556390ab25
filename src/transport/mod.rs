//! Reliable message transport over UDP.
//!
//! A [`Connection`] carries whole messages: `write` fragments a message
//! into Data packets, `read` returns it reassembled on the other side.
//! Loss is repaired by the per-connection engine, which exchanges periodic
//! Check packets (cumulative ack plus a selective ask list) and retransmits
//! exactly the fragments the peer reports missing.
//!
//! A [`Listener`] shares one UDP socket between many connections: inbound
//! handshakes, outbound dials and NAT hole punching all multiplex over it.

mod buffer;
mod conn;
mod listener;
mod socket;

pub use conn::{dial, dial_with_config, Connection};
pub use listener::Listener;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::protocol::DATA_HDR_SIZE;
use crate::MAX_MTU;

/// IPv6 + UDP header overhead assumed when sizing fragments.
const UDP_OVERHEAD: usize = 40 + 8;

/// Maximum fragment payload so a Data packet fits in one MTU-sized datagram.
pub const MAX_DATA_SIZE: usize = MAX_MTU - UDP_OVERHEAD - DATA_HDR_SIZE;

/// Maximum number of asks carried by a single Check packet.
pub const MAX_ASKS: usize = 10;

/// Number of fragments a message of `len` bytes occupies.
///
/// Zero-length messages still take one (empty) fragment so that they
/// consume a sequence number and are delivered in order.
pub fn fragment_count(len: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(MAX_DATA_SIZE)
    }
}

/// Transport configuration.
///
/// The defaults are the protocol's nominal timings; tests tighten them to
/// keep loss-recovery scenarios fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Interval between Check packets on an established connection.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Inactivity window after which an established connection closes.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Total time budget for the connection handshake.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Retransmit interval for the client's initial Conn packet.
    #[serde(default = "default_handshake_retransmit", with = "humantime_serde")]
    pub handshake_retransmit: Duration,

    /// Per-connection raw datagram queue depth.
    #[serde(default = "default_raw_queue")]
    pub raw_queue: usize,

    /// Per-connection reassembled message queue depth.
    #[serde(default = "default_message_queue")]
    pub message_queue: usize,

    /// Per-connection outgoing submission queue depth.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,

    /// Accept backlog of a listener.
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,

    /// Socket send buffer size in bytes.
    #[serde(default = "default_socket_buffer")]
    pub send_buffer_size: usize,

    /// Socket receive buffer size in bytes.
    #[serde(default = "default_socket_buffer")]
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR.
    #[serde(default = "default_reuse_addr")]
    pub reuse_addr: bool,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_handshake_retransmit() -> Duration {
    Duration::from_millis(500)
}
fn default_raw_queue() -> usize {
    64
}
fn default_message_queue() -> usize {
    32
}
fn default_send_queue() -> usize {
    64
}
fn default_accept_backlog() -> usize {
    32
}
fn default_socket_buffer() -> usize {
    2 * 1024 * 1024
} // 2 MB
fn default_reuse_addr() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            connection_timeout: default_connection_timeout(),
            handshake_timeout: default_handshake_timeout(),
            handshake_retransmit: default_handshake_retransmit(),
            raw_queue: default_raw_queue(),
            message_queue: default_message_queue(),
            send_queue: default_send_queue(),
            accept_backlog: default_accept_backlog(),
            send_buffer_size: default_socket_buffer(),
            recv_buffer_size: default_socket_buffer(),
            reuse_addr: default_reuse_addr(),
        }
    }
}

/// A writer bound to one peer over a (possibly shared) UDP socket.
///
/// Connections owned by a listener all write through the listener's socket;
/// a bare dialed connection writes through its own connected socket.
#[derive(Clone)]
pub(crate) struct PacketWriter {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    connected: bool,
}

impl PacketWriter {
    /// Writer over a shared, unconnected socket (listener-owned).
    pub(crate) fn new(socket: Arc<UdpSocket>, dest: SocketAddr) -> Self {
        Self {
            socket,
            dest,
            connected: false,
        }
    }

    /// Writer over a socket already connected to `dest`.
    pub(crate) fn new_connected(socket: Arc<UdpSocket>, dest: SocketAddr) -> Self {
        Self {
            socket,
            dest,
            connected: true,
        }
    }

    pub(crate) fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub(crate) fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub(crate) async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        if self.connected {
            self.socket.send(buf).await
        } else {
            self.socket.send_to(buf, self.dest).await
        }
    }
}

/// A raw datagram, truncated to its received length.
#[derive(Debug)]
pub(crate) struct RawPacket {
    pub buf: Vec<u8>,
}
