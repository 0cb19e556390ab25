//! Packet structure and fixed-layout codecs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ProtocolError;
use crate::PROTOCOL_VERSION;

use super::{
    BIN_ADDR_SIZE, CHECK_HDR_SIZE, CLOSE_PACKET_SIZE, CONN_OK_PACKET_SIZE, CONN_PACKET_SIZE,
    DATA_HDR_SIZE, PACKET_HDR_SIZE,
};

/// Packet kind identifier (low 7 bits of the status byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Keep-alive probe; answered with another Ping.
    Ping = 0,
    /// Silently discarded.
    Test = 1,
    /// Handshake step 1/2.
    Conn = 2,
    /// Handshake step 3.
    ConnOk = 3,
    /// One message fragment.
    Data = 4,
    /// Periodic cumulative ack + selective nak.
    Check = 5,
    /// Connection teardown.
    Close = 6,
    /// Peer-to-peer address advertisement; dropped.
    AddAddr = 7,
}

impl PacketKind {
    /// Decode from a raw status byte. The top bit is reserved and ignored.
    pub fn from_status(status: u8) -> Option<Self> {
        match status & 0x7f {
            0 => Some(Self::Ping),
            1 => Some(Self::Test),
            2 => Some(Self::Conn),
            3 => Some(Self::ConnOk),
            4 => Some(Self::Data),
            5 => Some(Self::Check),
            6 => Some(Self::Close),
            7 => Some(Self::AddAddr),
            _ => None,
        }
    }
}

/// Common 5-byte packet header.
///
/// `status` is kept raw so that counters can be tracked even for packet
/// kinds this implementation does not handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub status: u8,
    pub nr: u32,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, nr: u32) -> Self {
        Self {
            status: kind as u8,
            nr,
        }
    }

    /// The packet kind, if the status byte names one we know.
    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::from_status(self.status)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < PACKET_HDR_SIZE {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: PACKET_HDR_SIZE,
            });
        }
        Ok(Self {
            status: buf[0],
            nr: LittleEndian::read_u32(&buf[1..5]),
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.status);
        let mut nr = [0u8; 4];
        LittleEndian::write_u32(&mut nr, self.nr);
        buf.extend_from_slice(&nr);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_HDR_SIZE);
        self.encode_into(&mut buf);
        buf
    }
}

/// Decode a 19-byte `BinAddr`.
///
/// Family 1 yields IPv4, family 2 IPv6; any other tag yields the
/// unspecified IPv6 address (the wire's "no address").
pub fn read_bin_addr(b: &[u8]) -> SocketAddr {
    debug_assert!(b.len() >= BIN_ADDR_SIZE);
    let port = LittleEndian::read_u16(&b[0..2]);
    let ip = match b[2] {
        1 => IpAddr::V4(Ipv4Addr::new(b[3], b[4], b[5], b[6])),
        2 => {
            let mut v6 = [0u8; 16];
            v6.copy_from_slice(&b[3..19]);
            IpAddr::V6(Ipv6Addr::from(v6))
        }
        _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

/// Encode a socket address as a 19-byte `BinAddr`.
///
/// IPv4 and IPv4-mapped IPv6 addresses use family 1 with the 12-byte tail
/// zeroed; everything else uses family 2.
pub fn write_bin_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    let mut port = [0u8; 2];
    LittleEndian::write_u16(&mut port, addr.port());
    buf.extend_from_slice(&port);
    let v4 = match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    };
    match (v4, addr.ip()) {
        (Some(ip), _) => {
            buf.push(1);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&[0u8; 12]);
        }
        (None, IpAddr::V6(ip)) => {
            buf.push(2);
            buf.extend_from_slice(&ip.octets());
        }
        (None, IpAddr::V4(_)) => unreachable!(),
    }
}

/// Handshake packet (steps 1 and 2 of the three-way handshake).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnPacket {
    pub nr: u32,
    pub protocol_ver: u32,
    /// The recipient's address as seen by the sender.
    pub addr: SocketAddr,
    /// Multicast address; always unspecified (multicast is disabled).
    pub mc_addr: SocketAddr,
}

impl ConnPacket {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            nr: 0,
            protocol_ver: PROTOCOL_VERSION,
            addr,
            mc_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < CONN_PACKET_SIZE {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: CONN_PACKET_SIZE,
            });
        }
        let hdr = PacketHeader::decode(buf)?;
        Ok(Self {
            nr: hdr.nr,
            protocol_ver: LittleEndian::read_u32(&buf[PACKET_HDR_SIZE..]),
            addr: read_bin_addr(&buf[PACKET_HDR_SIZE + 4..]),
            mc_addr: read_bin_addr(&buf[PACKET_HDR_SIZE + 4 + BIN_ADDR_SIZE..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONN_PACKET_SIZE);
        PacketHeader {
            status: PacketKind::Conn as u8,
            nr: self.nr,
        }
        .encode_into(&mut buf);
        let mut ver = [0u8; 4];
        LittleEndian::write_u32(&mut ver, self.protocol_ver);
        buf.extend_from_slice(&ver);
        write_bin_addr(&mut buf, &self.addr);
        write_bin_addr(&mut buf, &self.mc_addr);
        debug_assert_eq!(buf.len(), CONN_PACKET_SIZE);
        buf
    }
}

/// Multicast mode carried by ConnOK; only `NoMc` is ever sent.
pub const MC_MODE_NO_MC: u32 = 0;

/// Handshake completion packet (step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnOkPacket {
    pub nr: u32,
    pub mc_mode: u32,
    /// The recipient's address as seen by the sender.
    pub addr: SocketAddr,
}

impl ConnOkPacket {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            nr: 0,
            mc_mode: MC_MODE_NO_MC,
            addr,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < CONN_OK_PACKET_SIZE {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: CONN_OK_PACKET_SIZE,
            });
        }
        let hdr = PacketHeader::decode(buf)?;
        Ok(Self {
            nr: hdr.nr,
            mc_mode: LittleEndian::read_u32(&buf[PACKET_HDR_SIZE..]),
            addr: read_bin_addr(&buf[PACKET_HDR_SIZE + 4..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONN_OK_PACKET_SIZE);
        PacketHeader {
            status: PacketKind::ConnOk as u8,
            nr: self.nr,
        }
        .encode_into(&mut buf);
        let mut mode = [0u8; 4];
        LittleEndian::write_u32(&mut mode, self.mc_mode);
        buf.extend_from_slice(&mode);
        write_bin_addr(&mut buf, &self.addr);
        debug_assert_eq!(buf.len(), CONN_OK_PACKET_SIZE);
        buf
    }
}

/// Teardown packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePacket {
    pub nr: u32,
    /// The recipient's address as seen by the sender.
    pub addr: SocketAddr,
}

impl ClosePacket {
    pub fn new(addr: SocketAddr) -> Self {
        Self { nr: 0, addr }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < CLOSE_PACKET_SIZE {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: CLOSE_PACKET_SIZE,
            });
        }
        let hdr = PacketHeader::decode(buf)?;
        Ok(Self {
            nr: hdr.nr,
            addr: read_bin_addr(&buf[PACKET_HDR_SIZE..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CLOSE_PACKET_SIZE);
        PacketHeader {
            status: PacketKind::Close as u8,
            nr: self.nr,
        }
        .encode_into(&mut buf);
        write_bin_addr(&mut buf, &self.addr);
        debug_assert_eq!(buf.len(), CLOSE_PACKET_SIZE);
        buf
    }
}

/// Data packet header; the fragment payload follows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// This fragment's sequence number.
    pub nr: u32,
    /// Sequence number of the message's first fragment (the message id).
    pub fnr: u32,
    /// Total message size in bytes across all fragments.
    pub size: u32,
}

impl DataHeader {
    pub fn new(nr: u32, fnr: u32, size: u32) -> Self {
        Self { nr, fnr, size }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < DATA_HDR_SIZE {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: DATA_HDR_SIZE,
            });
        }
        let hdr = PacketHeader::decode(buf)?;
        Ok(Self {
            nr: hdr.nr,
            fnr: LittleEndian::read_u32(&buf[PACKET_HDR_SIZE..]),
            size: LittleEndian::read_u32(&buf[PACKET_HDR_SIZE + 4..]),
        })
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        PacketHeader {
            status: PacketKind::Data as u8,
            nr: self.nr,
        }
        .encode_into(buf);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, self.fnr);
        buf.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, self.size);
        buf.extend_from_slice(&word);
    }
}

/// Periodic ack/nak packet.
///
/// `nr` carries the sender's outgoing fragment counter so the receiver can
/// learn about fragments it never saw; `ack_nr` cumulatively acknowledges
/// every fragment below it; `asks` selectively requests retransmission.
/// The multicast ask array and ack counter exist on the wire but are always
/// empty/zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPacket {
    pub nr: u32,
    pub ack_nr: u32,
    pub asks: Vec<u32>,
}

impl CheckPacket {
    pub fn new(asks: Vec<u32>, ack_nr: u32, out_nr: u32) -> Self {
        Self {
            nr: out_nr,
            ack_nr,
            asks,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < CHECK_HDR_SIZE {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: CHECK_HDR_SIZE,
            });
        }
        let hdr = PacketHeader::decode(buf)?;
        let ask_count = LittleEndian::read_u32(&buf[PACKET_HDR_SIZE..]);
        let mcask_count = LittleEndian::read_u32(&buf[PACKET_HDR_SIZE + 4..]);
        let ack_nr = LittleEndian::read_u32(&buf[PACKET_HDR_SIZE + 8..]);
        // Declared counts come off the wire; validate against the actual
        // buffer before trusting them.
        let need = CHECK_HDR_SIZE as u64 + 4 * (u64::from(ask_count) + u64::from(mcask_count));
        if (buf.len() as u64) < need {
            return Err(ProtocolError::ShortPacket {
                len: buf.len(),
                need: need as usize,
            });
        }
        let ask_count = ask_count as usize;
        let mut asks = Vec::with_capacity(ask_count);
        let mut pos = CHECK_HDR_SIZE;
        for _ in 0..ask_count {
            asks.push(LittleEndian::read_u32(&buf[pos..]));
            pos += 4;
        }
        // The multicast ask array is length-validated above but its
        // contents are ignored.
        Ok(Self {
            nr: hdr.nr,
            ack_nr,
            asks,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHECK_HDR_SIZE + 4 * self.asks.len());
        PacketHeader {
            status: PacketKind::Check as u8,
            nr: self.nr,
        }
        .encode_into(&mut buf);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, self.asks.len() as u32);
        buf.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, 0); // mcask count
        buf.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, self.ack_nr);
        buf.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, 0); // mc ack nr
        buf.extend_from_slice(&word);
        debug_assert_eq!(buf.len(), CHECK_HDR_SIZE);
        for ask in &self.asks {
            LittleEndian::write_u32(&mut word, *ask);
            buf.extend_from_slice(&word);
        }
        buf
    }
}
