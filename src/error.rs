//! Error types for netioudp.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for netioudp operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for netioudp.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: CloseReason },

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("punch timeout")]
    PunchTimeout,

    #[error("listener closed")]
    ListenerClosed,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Rendezvous errors
    #[error("puncher error: {0}")]
    Puncher(#[from] PuncherError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),
}

/// Wire format parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("short packet: {len} bytes, need {need}")]
    ShortPacket { len: usize, need: usize },

    #[error("invalid packet kind: {0}")]
    InvalidPacketKind(u8),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected packet kind: expected {expected}, got {got}")]
    UnexpectedPacket { expected: &'static str, got: u8 },
}

/// Rendezvous message errors.
#[derive(Error, Debug)]
pub enum PuncherError {
    #[error("unknown message type 0x{0:x}")]
    UnknownType(u8),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("message not long enough, read {0} byte")]
    Truncated(usize),
}

/// Why a connection went away.
///
/// Recorded once on the first close and reported by every subsequent
/// read/write/close on that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// We closed the connection.
    Local,
    /// The peer sent a Close packet.
    Peer,
    /// No valid packet arrived within the inactivity window.
    Timeout,
    /// A new handshake from the same address superseded this connection.
    Reconnection,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "connection closed locally"),
            Self::Peer => write!(f, "connection closed by peer"),
            Self::Timeout => write!(f, "connection timeout"),
            Self::Reconnection => write!(f, "reconnection"),
        }
    }
}

impl Error {
    /// Check if error is recoverable (should retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout
                | Error::PunchTimeout
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if error indicates the connection is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed { .. } | Error::ListenerClosed
        )
    }
}
