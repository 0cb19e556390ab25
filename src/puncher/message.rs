//! Rendezvous wire format.
//!
//! Every message starts with a 2-byte header `{type, version}`; integers
//! are little-endian. Version 1 is the only one supported.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::PuncherError;

/// Newest rendezvous protocol version supported.
pub const PUNCHER_VERSION: u8 = 1;

/// Upper bound on an encoded message; CReq (port and IP) is largest.
pub const MAX_PUNCHER_MESSAGE_SIZE: usize = 2 + 18;

const TYPE_ASS_ID: u8 = 0x51;
const TYPE_SREQ: u8 = 0x52;
const TYPE_CREQ: u8 = 0x53;
const TYPE_ID_REQ: u8 = 0x54;

/// One rendezvous message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuncherMessage {
    /// Host requesting a connection ID.
    IdReq,
    /// Puncher announcing the assigned ID.
    AssId { cid: u32 },
    /// Client requesting to be served with punching for an ID.
    SReq { cid: u32 },
    /// Puncher requesting a punch towards an address.
    CReq { addr: SocketAddr },
}

impl PuncherMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::IdReq => TYPE_ID_REQ,
            Self::AssId { .. } => TYPE_ASS_ID,
            Self::SReq { .. } => TYPE_SREQ,
            Self::CReq { .. } => TYPE_CREQ,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PUNCHER_MESSAGE_SIZE);
        buf.push(self.message_type());
        buf.push(PUNCHER_VERSION);
        match self {
            Self::IdReq => {}
            Self::AssId { cid } | Self::SReq { cid } => {
                let mut word = [0u8; 4];
                LittleEndian::write_u32(&mut word, *cid);
                buf.extend_from_slice(&word);
            }
            Self::CReq { addr } => {
                let mut port = [0u8; 2];
                LittleEndian::write_u16(&mut port, addr.port());
                buf.extend_from_slice(&port);
                let ip = match addr.ip() {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PuncherError> {
        if buf.len() < 2 {
            return Err(PuncherError::Truncated(buf.len()));
        }
        let msg_type = buf[0];
        if !matches!(msg_type, TYPE_ASS_ID | TYPE_SREQ | TYPE_CREQ | TYPE_ID_REQ) {
            return Err(PuncherError::UnknownType(msg_type));
        }
        let version = buf[1];
        if version != PUNCHER_VERSION {
            return Err(PuncherError::UnsupportedVersion(version));
        }
        match msg_type {
            TYPE_ID_REQ => Ok(Self::IdReq),
            TYPE_ASS_ID | TYPE_SREQ => {
                if buf.len() < 6 {
                    return Err(PuncherError::Truncated(buf.len()));
                }
                let cid = LittleEndian::read_u32(&buf[2..6]);
                if msg_type == TYPE_ASS_ID {
                    Ok(Self::AssId { cid })
                } else {
                    Ok(Self::SReq { cid })
                }
            }
            TYPE_CREQ => {
                if buf.len() < MAX_PUNCHER_MESSAGE_SIZE {
                    return Err(PuncherError::Truncated(buf.len()));
                }
                let port = LittleEndian::read_u16(&buf[2..4]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[4..20]);
                let v6 = Ipv6Addr::from(octets);
                let ip = v6
                    .to_ipv4_mapped()
                    .map_or(IpAddr::V6(v6), IpAddr::V4);
                Ok(Self::CReq {
                    addr: SocketAddr::new(ip, port),
                })
            }
            _ => unreachable!(),
        }
    }
}
