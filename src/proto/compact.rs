
use super::addr::*;
use super::candidate::{self, *};
use super::*;
use crate::error::*;

pub const HEADER_LEN: usize = 4;

// REGISTER_ACK flags bit: this server is willing to relay data packets.
pub const FLAG_RELAY_AVAILABLE: u8 = 0x01;
// PEER_INFO flags bit: no further fragments follow.
pub const FLAG_FINAL_FRAGMENT: u8 = 0x01;

// REGISTER_ACK status octet.
pub const STATUS_PEER_OFFLINE: u8 = 0;
pub const STATUS_PEER_ONLINE: u8 = 1;
pub const STATUS_TABLE_FULL: u8 = 2;

// Sanity bound on the ack number a client may carry in PEER_INFO_ACK.
pub const MAX_ACK_SEQ: u16 = 16;

/// `Header` is the fixed 4-octet compact-mode header: type octet, flags
/// octet, then a big-endian 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub typ: PacketType,
    pub flags: u8,
    pub seq: u16,
}

impl Header {
    pub fn new(typ: PacketType, flags: u8, seq: u16) -> Self {
        Header { typ, flags, seq }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        Ok(Header {
            typ: PacketType(buf[0]),
            flags: buf[1],
            seq: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Builds a complete datagram: this header followed by `body`.
    pub fn with_body(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(self.typ.0);
        out.push(self.flags);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(body);
        out
    }
}

/// Splits a datagram into its header and body.
pub fn split(data: &[u8]) -> Result<(Header, &[u8])> {
    let header = Header::decode(data)?;
    Ok((header, &data[HEADER_LEN..]))
}

/// REGISTER body: the caller's id, the intended partner's id and the
/// caller's current candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub local_id: PeerId,
    pub remote_id: PeerId,
    pub candidates: Vec<Candidate>,
}

impl Register {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 2 * PeerId::LEN + 1 {
            return Err(Error::ErrUnexpectedEof);
        }
        let local_id = PeerId::decode(body)?;
        let remote_id = PeerId::decode(&body[PeerId::LEN..])?;
        let count = body[2 * PeerId::LEN] as usize;
        if count > MAX_WIRE_CANDIDATES {
            return Err(Error::ErrCandidateCountOutOfRange);
        }
        let candidates = candidate::decode_list(&body[2 * PeerId::LEN + 1..], count)?;
        Ok(Register {
            local_id,
            remote_id,
            candidates,
        })
    }

    pub fn encode(&self, seq: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 * PeerId::LEN + 1 + self.candidates.len() * CANDIDATE_WIRE_LEN);
        body.extend_from_slice(&self.local_id.0);
        body.extend_from_slice(&self.remote_id.0);
        body.push(self.candidates.len() as u8);
        candidate::encode_list(&self.candidates, &mut body);
        Header::new(REGISTER, 0, seq).with_body(&body)
    }
}

/// REGISTER_ACK body: registration status, the candidate cap, the public
/// endpoint the server observed and the NAT-probe port (0 when disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAck {
    pub status: u8,
    pub max_candidates: u8,
    pub public: WireAddr,
    pub probe_port: u16,
}

impl RegisterAck {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 10 {
            return Err(Error::ErrUnexpectedEof);
        }
        Ok(RegisterAck {
            status: body[0],
            max_candidates: body[1],
            public: WireAddr::decode(&body[2..8])?,
            probe_port: u16::from_be_bytes([body[8], body[9]]),
        })
    }

    pub fn encode(&self, seq: u16, flags: u8) -> Vec<u8> {
        let mut body = Vec::with_capacity(10);
        body.push(self.status);
        body.push(self.max_candidates);
        let mut a = [0u8; ADDR_WIRE_LEN];
        // Infallible: the buffer is exactly one endpoint.
        let _ = self.public.encode(&mut a);
        body.extend_from_slice(&a);
        body.extend_from_slice(&self.probe_port.to_be_bytes());
        Header::new(REGISTER_ACK, flags, seq).with_body(&body)
    }
}

/// PEER_INFO body. With header seq 0 this is a server-originated candidate
/// push (reliable, base-indexed); with seq > 0 it is end-to-end traffic the
/// server merely relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub session_id: u64,
    pub base_index: u8,
    pub candidates: Vec<Candidate>,
}

impl PeerInfo {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 10 {
            return Err(Error::ErrUnexpectedEof);
        }
        let session_id = u64::from_be_bytes([
            body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
        ]);
        let base_index = body[8];
        let count = body[9] as usize;
        if count > MAX_WIRE_CANDIDATES {
            return Err(Error::ErrCandidateCountOutOfRange);
        }
        let candidates = candidate::decode_list(&body[10..], count)?;
        Ok(PeerInfo {
            session_id,
            base_index,
            candidates,
        })
    }

    pub fn encode(&self, seq: u16, flags: u8) -> Vec<u8> {
        let mut body = Vec::with_capacity(10 + self.candidates.len() * CANDIDATE_WIRE_LEN);
        body.extend_from_slice(&self.session_id.to_be_bytes());
        body.push(self.base_index);
        body.push(self.candidates.len() as u8);
        candidate::encode_list(&self.candidates, &mut body);
        Header::new(PEER_INFO, flags, seq).with_body(&body)
    }
}

/// PEER_INFO_ACK body is the 8-octet session id; the acknowledged sequence
/// number rides in the header `seq` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfoAck {
    pub session_id: u64,
}

impl PeerInfoAck {
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(PeerInfoAck {
            session_id: peek_session_id(body)?,
        })
    }

    pub fn encode(&self, ack_seq: u16) -> Vec<u8> {
        Header::new(PEER_INFO_ACK, 0, ack_seq).with_body(&self.session_id.to_be_bytes())
    }
}

/// ALIVE and UNREGISTER share one body layout: the two pair ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairIds {
    pub local_id: PeerId,
    pub remote_id: PeerId,
}

impl PairIds {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 2 * PeerId::LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        Ok(PairIds {
            local_id: PeerId::decode(body)?,
            remote_id: PeerId::decode(&body[PeerId::LEN..])?,
        })
    }

    pub fn encode(&self, typ: PacketType, seq: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 * PeerId::LEN);
        body.extend_from_slice(&self.local_id.0);
        body.extend_from_slice(&self.remote_id.0);
        Header::new(typ, 0, seq).with_body(&body)
    }
}

/// PEER_OFF body is the recipient's own session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerOff {
    pub session_id: u64,
}

impl PeerOff {
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(PeerOff {
            session_id: peek_session_id(body)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        Header::new(PEER_OFF, 0, 0).with_body(&self.session_id.to_be_bytes())
    }
}

/// NAT_PROBE_ACK body: the source endpoint observed on the probe port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatProbeAck {
    pub public: WireAddr,
}

impl NatProbeAck {
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(NatProbeAck {
            public: WireAddr::decode(body)?,
        })
    }

    pub fn encode(&self, seq: u16) -> Vec<u8> {
        let mut body = [0u8; ADDR_WIRE_LEN];
        let _ = self.public.encode(&mut body);
        Header::new(NAT_PROBE_ACK, 0, seq).with_body(&body)
    }
}

/// Reads the 8-octet session id that prefixes PEER_INFO, PEER_INFO_ACK,
/// PEER_OFF, RELAY_DATA and RELAY_ACK bodies.
pub fn peek_session_id(body: &[u8]) -> Result<u64> {
    if body.len() < 8 {
        return Err(Error::ErrUnexpectedEof);
    }
    Ok(u64::from_be_bytes([
        body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
    ]))
}
