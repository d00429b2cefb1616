pub mod registry;
pub mod retransmit;

use std::fmt;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::proto::candidate::Candidate;
use crate::proto::PeerId;

// Default pair table capacity. A full table answers REGISTER with the
// table-full status and changes nothing.
pub const MAX_PAIRS: usize = 128;

// A pair with no traffic for this long is reclaimed by the cleanup pass.
pub const PAIR_TTL: Duration = Duration::from_secs(90);

/// `PairHandle` is a generation-tagged index into the pair table. A handle
/// held across a release dereferences to nothing rather than to a recycled
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for PairHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pair#{}.{}", self.index, self.generation)
    }
}

/// `PairKey` is the 64-octet composite lookup key `(local_id, remote_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub local_id: PeerId,
    pub remote_id: PeerId,
}

impl PairKey {
    pub fn new(local_id: PeerId, remote_id: PeerId) -> Self {
        PairKey {
            local_id,
            remote_id,
        }
    }

    /// The key of the opposite direction of the same registration.
    pub fn reversed(&self) -> Self {
        PairKey {
            local_id: self.remote_id,
            remote_id: self.local_id,
        }
    }
}

/// The sibling association of a pair. `Broken` means the sibling was
/// reclaimed while this side was still alive; the next REGISTER or ALIVE
/// from this side observes the break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerRef {
    #[default]
    None,
    Linked(PairHandle),
    Broken,
}

/// Delivery state of the initial server-originated candidate push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoAckState {
    #[default]
    Pending,
    Confirmed,
    GivenUp,
}

/// The one outstanding reliable seq=0 packet for a pair. `base_index` 0 is
/// the initial candidate push; 1..=255 (skipping 0 on wrap) is an
/// address-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInfo {
    pub base_index: u8,
    pub retry: u8,
    pub sent_at: Instant,
}

/// `Pair` is one direction of a registration: the record a peer creates by
/// declaring `(local_id, remote_id)` over compact-mode UDP.
#[derive(Debug, Clone)]
pub struct Pair {
    pub local_id: PeerId,
    pub remote_id: PeerId,
    /// 0 until the pair is first bilaterally matched.
    pub session_id: u64,
    /// Most recent observed source endpoint.
    pub addr: SocketAddr,
    pub candidates: Vec<Candidate>,
    pub peer_ref: PeerRef,
    pub last_active: Instant,
    pub info_ack: InfoAckState,
    /// Address-change notification counter; wraps 255 -> 1, never 0.
    pub addr_notify_seq: u8,
    /// Present iff this pair sits in the retransmit queue.
    pub pending: Option<PendingInfo>,
}

impl Pair {
    pub(crate) fn new(local_id: PeerId, remote_id: PeerId, addr: SocketAddr, now: Instant) -> Self {
        Pair {
            local_id,
            remote_id,
            session_id: 0,
            addr,
            candidates: vec![],
            peer_ref: PeerRef::None,
            last_active: now,
            info_ack: InfoAckState::Pending,
            addr_notify_seq: 0,
            pending: None,
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(self.local_id, self.remote_id)
    }

    /// The next address-change notification index, skipping 0 on wrap.
    pub fn next_notify_seq(&mut self) -> u8 {
        self.addr_notify_seq = match self.addr_notify_seq {
            255 => 1,
            n => n + 1,
        };
        self.addr_notify_seq
    }
}
