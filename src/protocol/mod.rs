//! Wire protocol for netioudp.
//!
//! Defines the fixed-layout packet formats shared by every connection. All
//! integers are little-endian.
//!
//! ## Packet layout
//!
//! ```text
//! ┌────────────┬─────────┬──────────────────────────────────────────┐
//! │ Status (1) │ Nr (4)  │ kind-specific payload                    │
//! └────────────┴─────────┴──────────────────────────────────────────┘
//! ```
//!
//! The low 7 bits of the status byte select the packet kind; the top bit is
//! reserved and ignored on receive. `Nr` is the sender's fragment sequence
//! number for packets that participate in ack accounting.
//!
//! Addresses travel as `BinAddr`: port (2), family tag (1), 16-byte IP
//! payload (IPv4 occupies the first 4 bytes, remainder zero).

mod packet;

pub use packet::{
    read_bin_addr, write_bin_addr, CheckPacket, ClosePacket, ConnOkPacket, ConnPacket, DataHeader,
    PacketHeader, PacketKind, MC_MODE_NO_MC,
};

/// Size of the common packet header.
pub const PACKET_HDR_SIZE: usize = 1 + 4;

/// Size of an encoded `BinAddr`.
pub const BIN_ADDR_SIZE: usize = 2 + 1 + 16;

/// Size of a Conn packet: header, protocol version, peer address, mc address.
pub const CONN_PACKET_SIZE: usize = PACKET_HDR_SIZE + 4 + 2 * BIN_ADDR_SIZE;

/// Size of a ConnOK packet: header, mc mode, peer address.
pub const CONN_OK_PACKET_SIZE: usize = PACKET_HDR_SIZE + 4 + BIN_ADDR_SIZE;

/// Size of a Close packet: header, peer address.
pub const CLOSE_PACKET_SIZE: usize = PACKET_HDR_SIZE + BIN_ADDR_SIZE;

/// Size of a Data packet header (fragment payload follows).
pub const DATA_HDR_SIZE: usize = PACKET_HDR_SIZE + 2 * 4;

/// Size of a Check packet header (ask arrays follow).
pub const CHECK_HDR_SIZE: usize = PACKET_HDR_SIZE + 4 * 4;
