
use std::fmt;
use std::net::SocketAddr;

use super::addr::*;
use crate::error::*;

pub const CANDIDATE_WIRE_LEN: usize = 7;

// Per-pair candidate storage cap. Registrations declaring more are
// truncated silently at this bound.
pub const MAX_CANDIDATES: usize = 32;

/// Kind of endpoint a peer offers for hole punching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relay,
    PeerReflexive,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relay => "relay",
            CandidateKind::PeerReflexive => "prflx",
        };
        write!(f, "{s}")
    }
}

impl CandidateKind {
    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CandidateKind::Host),
            1 => Ok(CandidateKind::ServerReflexive),
            2 => Ok(CandidateKind::Relay),
            3 => Ok(CandidateKind::PeerReflexive),
            _ => Err(Error::ErrUnknownCandidateKind),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            CandidateKind::Host => 0,
            CandidateKind::ServerReflexive => 1,
            CandidateKind::Relay => 2,
            CandidateKind::PeerReflexive => 3,
        }
    }
}

/// `Candidate` is the packed 7-octet compact-mode candidate entry:
/// kind octet, then the endpoint in wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: WireAddr,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.addr)
    }
}

impl Candidate {
    /// A synthetic srflx candidate built from an endpoint the server
    /// observed as a datagram source.
    pub fn server_reflexive(addr: &SocketAddr) -> Result<Self> {
        Ok(Candidate {
            kind: CandidateKind::ServerReflexive,
            addr: WireAddr::from_socket_addr(addr)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < CANDIDATE_WIRE_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        buf[0] = self.kind.to_wire();
        self.addr.encode(&mut buf[1..])?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CANDIDATE_WIRE_LEN {
            return Err(Error::ErrUnexpectedEof);
        }
        Ok(Candidate {
            kind: CandidateKind::from_wire(buf[0])?,
            addr: WireAddr::decode(&buf[1..])?,
        })
    }
}

/// Appends `candidates` in wire form to `out`.
pub(crate) fn encode_list(candidates: &[Candidate], out: &mut Vec<u8>) {
    for c in candidates {
        let mut entry = [0u8; CANDIDATE_WIRE_LEN];
        // Infallible: the buffer is exactly one entry.
        let _ = c.encode(&mut entry);
        out.extend_from_slice(&entry);
    }
}

/// Reads `count` candidate entries from `buf`.
pub(crate) fn decode_list(buf: &[u8], count: usize) -> Result<Vec<Candidate>> {
    if buf.len() < count * CANDIDATE_WIRE_LEN {
        return Err(Error::ErrUnexpectedEof);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(Candidate::decode(&buf[i * CANDIDATE_WIRE_LEN..])?);
    }
    Ok(out)
}
