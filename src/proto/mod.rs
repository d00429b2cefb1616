pub mod addr;
pub mod candidate;
pub mod compact;
pub mod relay;

use std::fmt;

use crate::error::*;

// Every candidate-bearing packet carries a count octet (or a 32-bit count
// field in relay mode). Anything above this is treated as a malformed frame
// long before any table cap applies.
pub const MAX_WIRE_CANDIDATES: usize = 200;

/// `PacketType` is the leading octet of a compact-mode header.
///
/// `0x01..=0x7F` is end-to-end traffic the server never parses;
/// `0x80..=0xBF` is signaling and server relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketType(pub u8);

pub const REGISTER: PacketType = PacketType(0x80);
pub const REGISTER_ACK: PacketType = PacketType(0x81);
pub const PEER_INFO: PacketType = PacketType(0x82);
pub const PEER_INFO_ACK: PacketType = PacketType(0x83);
pub const NAT_PROBE: PacketType = PacketType(0x84);
pub const NAT_PROBE_ACK: PacketType = PacketType(0x85);
pub const ALIVE: PacketType = PacketType(0x86);
pub const ALIVE_ACK: PacketType = PacketType(0x87);
pub const UNREGISTER: PacketType = PacketType(0x88);
pub const PEER_OFF: PacketType = PacketType(0x89);
pub const RELAY_DATA: PacketType = PacketType(0xA0);
pub const RELAY_ACK: PacketType = PacketType(0xA1);

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("0x{:02X}", self.0);
        let s = match *self {
            REGISTER => "REGISTER",
            REGISTER_ACK => "REGISTER_ACK",
            PEER_INFO => "PEER_INFO",
            PEER_INFO_ACK => "PEER_INFO_ACK",
            NAT_PROBE => "NAT_PROBE",
            NAT_PROBE_ACK => "NAT_PROBE_ACK",
            ALIVE => "ALIVE",
            ALIVE_ACK => "ALIVE_ACK",
            UNREGISTER => "UNREGISTER",
            PEER_OFF => "PEER_OFF",
            RELAY_DATA => "RELAY_DATA",
            RELAY_ACK => "RELAY_ACK",
            _ => others.as_str(),
        };

        write!(f, "{s}")
    }
}

/// `PeerId` is the opaque 32-octet peer identifier carried in REGISTER,
/// ALIVE and UNREGISTER bodies and in relay-mode name fields. Shorter
/// identifiers are NUL padded; equality compares the full field.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; PeerId::LEN]);

impl PeerId {
    pub const LEN: usize = 32;

    /// Builds an id from up to 32 octets; the rest of the field stays NUL.
    pub fn new(id: &[u8]) -> Self {
        let mut b = [0u8; Self::LEN];
        let n = std::cmp::min(id.len(), Self::LEN);
        b[..n].copy_from_slice(&id[..n]);
        PeerId(b)
    }

    /// Reads a full 32-octet id field off the wire.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        let mut b = [0u8; Self::LEN];
        b.copy_from_slice(&buf[..Self::LEN]);
        Ok(PeerId(b))
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        PeerId([0u8; Self::LEN])
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s.as_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(Self::LEN);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}
