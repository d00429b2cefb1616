
use std::fmt;

use super::*;
use crate::error::*;

/// The four magic octets opening every relay-mode frame ("P2P0").
pub const MAGIC: [u8; 4] = *b"P2P0";

pub const FRAME_HEADER_LEN: usize = 9;

// A frame body above this closes the connection.
pub const MAX_FRAME_LEN: usize = 65_536;

// Reply buffer bound for LIST_RES bodies.
pub const LIST_REPLY_MAX: usize = 1024;

pub const SIGNAL_HEADER_LEN: usize = 76;
pub const RELAY_CANDIDATE_LEN: usize = 32;

/// Candidate entries in relay mode are opaque 32-octet blobs; only the
/// clients interpret them.
pub type RelayCandidate = [u8; RELAY_CANDIDATE_LEN];

// CONNECT_ACK status octet.
pub const CONNECT_FORWARDED: u8 = 0;
pub const CONNECT_CACHED: u8 = 1;
pub const CONNECT_CACHE_FULL: u8 = 2;

/// `Opcode` is the type octet of a relay-mode frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode(pub u8);

pub const LOGIN: Opcode = Opcode(1);
pub const LOGIN_ACK: Opcode = Opcode(2);
pub const LIST: Opcode = Opcode(3);
pub const LIST_RES: Opcode = Opcode(4);
pub const CONNECT: Opcode = Opcode(5);
pub const OFFER: Opcode = Opcode(6);
pub const ANSWER: Opcode = Opcode(7);
pub const FORWARD: Opcode = Opcode(8);
pub const HEARTBEAT: Opcode = Opcode(9);
pub const CONNECT_ACK: Opcode = Opcode(10);

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("{}", self.0);
        let s = match *self {
            LOGIN => "LOGIN",
            LOGIN_ACK => "LOGIN_ACK",
            LIST => "LIST",
            LIST_RES => "LIST_RES",
            CONNECT => "CONNECT",
            OFFER => "OFFER",
            ANSWER => "ANSWER",
            FORWARD => "FORWARD",
            HEARTBEAT => "HEARTBEAT",
            CONNECT_ACK => "CONNECT_ACK",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}

/// `FrameHeader` is the fixed 9-octet frame prefix: magic, opcode, body
/// length.
///
/// The length field is little-endian on the wire. The protocol predates
/// this implementation and wrote the field in host order on little-endian
/// machines; the rest of both protocols stays big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        if buf[..4] != MAGIC {
            return Err(Error::ErrInvalidMagic);
        }
        let opcode = Opcode(buf[4]);
        let length = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
        if length as usize > MAX_FRAME_LEN {
            return Err(Error::ErrOversizedFrame);
        }
        Ok(FrameHeader { opcode, length })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        buf[..4].copy_from_slice(&MAGIC);
        buf[4] = self.opcode.0;
        buf[5..9].copy_from_slice(&self.length.to_le_bytes());
        Ok(())
    }
}

/// `Frame` is a complete relay-mode message: opcode plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, body: Vec<u8>) -> Self {
        Frame { opcode, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; FRAME_HEADER_LEN];
        let header = FrameHeader {
            opcode: self.opcode,
            length: self.body.len() as u32,
        };
        // Infallible: the buffer is exactly one header.
        let _ = header.encode(&mut out);
        out.extend_from_slice(&self.body);
        out
    }
}

/// `SignalHeader` is the fixed 76-octet prefix of a CONNECT/ANSWER payload:
/// sender and target names, then three big-endian 32-bit fields. Whatever
/// follows it is candidate blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalHeader {
    pub sender: PeerId,
    pub target: PeerId,
    pub timestamp: u32,
    pub delay_trigger: u32,
    pub count: u32,
}

impl SignalHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIGNAL_HEADER_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        Ok(SignalHeader {
            sender: PeerId::decode(buf)?,
            target: PeerId::decode(&buf[32..])?,
            timestamp: u32::from_be_bytes([buf[64], buf[65], buf[66], buf[67]]),
            delay_trigger: u32::from_be_bytes([buf[68], buf[69], buf[70], buf[71]]),
            count: u32::from_be_bytes([buf[72], buf[73], buf[74], buf[75]]),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sender.0);
        out.extend_from_slice(&self.target.0);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.delay_trigger.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
    }
}

/// Decoded CONNECT/ANSWER body: a 32-octet target name, the signaling
/// header and the candidate blobs it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub target: PeerId,
    pub header: SignalHeader,
    pub candidates: Vec<RelayCandidate>,
}

impl Signal {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let target = PeerId::decode(body)?;
        let header = SignalHeader::decode(&body[PeerId::LEN..])?;
        let count = header.count as usize;
        if count > MAX_WIRE_CANDIDATES {
            return Err(Error::ErrCandidateCountOutOfRange);
        }
        let blobs = &body[PeerId::LEN + SIGNAL_HEADER_LEN..];
        if blobs.len() < count * RELAY_CANDIDATE_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        let mut candidates = Vec::with_capacity(count);
        for i in 0..count {
            let mut c = [0u8; RELAY_CANDIDATE_LEN];
            c.copy_from_slice(&blobs[i * RELAY_CANDIDATE_LEN..(i + 1) * RELAY_CANDIDATE_LEN]);
            candidates.push(c);
        }
        Ok(Signal {
            target,
            header,
            candidates,
        })
    }

    /// The portion after the target name, forwarded verbatim to the peer.
    pub fn payload(body: &[u8]) -> &[u8] {
        &body[PeerId::LEN.min(body.len())..]
    }

    pub fn encode(&self, opcode: Opcode) -> Vec<u8> {
        let mut body = Vec::with_capacity(
            PeerId::LEN + SIGNAL_HEADER_LEN + self.candidates.len() * RELAY_CANDIDATE_LEN,
        );
        body.extend_from_slice(&self.target.0);
        self.header.encode(&mut body);
        for c in &self.candidates {
            body.extend_from_slice(c);
        }
        Frame::new(opcode, body).encode()
    }
}

/// LOGIN body: the client's 32-octet name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Login {
    pub name: PeerId,
}

impl Login {
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Login {
            name: PeerId::decode(body)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        Frame::new(LOGIN, self.name.0.to_vec()).encode()
    }
}

/// CONNECT_ACK body: status, number of candidates accepted, two reserved
/// octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub status: u8,
    pub candidates_acked: u8,
}

impl ConnectAck {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::ErrUnexpectedEof);
        }
        Ok(ConnectAck {
            status: body[0],
            candidates_acked: body[1],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        Frame::new(
            CONNECT_ACK,
            vec![self.status, self.candidates_acked, 0, 0],
        )
        .encode()
    }
}

/// Builds the OFFER/FORWARD frame delivered to a target: the sender's name
/// followed by the original payload, verbatim.
pub fn forwarded_frame(opcode: Opcode, sender: &PeerId, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(PeerId::LEN + payload.len());
    body.extend_from_slice(&sender.0);
    body.extend_from_slice(payload);
    Frame::new(opcode, body).encode()
}
