//! # netioudp
//!
//! Reliable, connection-oriented, message-oriented transport layered on UDP,
//! plus a small rendezvous service (the "puncher") that helps two peers
//! behind NAT establish a direct connection over the same transport.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application Layer                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Rendezvous (puncher) — ID assignment, punch requests     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Connection engine — fragmentation, selective retransmission,  │
//! │   reassembly, keep-alive, handshake                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Listener — demultiplexes one UDP socket to many connections,  │
//! │   outbound dials, NAT hole punching                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                           UDP socket                            │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! Messages are atomic units: a [`transport::Connection`] delivers each
//! written message exactly once, in submission order, reassembled from
//! however many datagrams it took on the wire. There is no byte-stream
//! framing, no congestion control beyond fixed-interval ACK/NAK, and no
//! encryption.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)] // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)] // Intentional for wire-format fields
#![allow(clippy::similar_names)]
#![allow(clippy::cognitive_complexity)] // Complex state machines
#![allow(clippy::too_many_lines)] // Complete implementations
#![allow(clippy::future_not_send)] // Async internals
#![allow(clippy::ignored_unit_patterns)]

pub mod error;
pub mod protocol;
pub mod puncher;
pub mod transport;

pub use error::{Error, Result};
pub use transport::{Connection, Listener, TransportConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for wire compatibility
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum transmission unit for datagrams
pub const MAX_MTU: usize = 1500;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::protocol::PacketKind;
    pub use crate::puncher::{PuncherClient, PuncherMessage, PuncherServer};
    pub use crate::transport::{dial, Connection, Listener, TransportConfig};
}
