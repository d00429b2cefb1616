#[cfg(test)]
mod registry_test;

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tokio::time::{Duration, Instant};

use super::*;
use crate::error::*;
use crate::proto::PeerId;

struct Slot {
    generation: u32,
    pair: Option<Pair>,
}

/// `PairRegistry` holds compact-mode pairs in a fixed slot arena with two
/// indices: the 64-octet composite key, and the 64-bit session id once one
/// is assigned. A released slot is reachable from neither.
pub struct PairRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<PairKey, PairHandle>,
    by_session: HashMap<u64, PairHandle>,
}

impl PairRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                generation: 0,
                pair: None,
            });
            free.push(i as u32);
        }
        // Pop order is irrelevant; reverse so slot 0 goes out first.
        free.reverse();

        PairRegistry {
            slots,
            free,
            by_key: HashMap::new(),
            by_session: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, handle: PairHandle) -> Option<&Pair> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.pair.as_ref()
    }

    pub fn get_mut(&mut self, handle: PairHandle) -> Option<&mut Pair> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.pair.as_mut()
    }

    /// Constant-expected-time lookup on the composite key.
    pub fn find_by_composite(&self, local_id: &PeerId, remote_id: &PeerId) -> Option<PairHandle> {
        self.by_key
            .get(&PairKey::new(*local_id, *remote_id))
            .copied()
    }

    /// Constant-expected-time lookup on the session id; 0 never resolves.
    pub fn find_by_session(&self, session_id: u64) -> Option<PairHandle> {
        if session_id == 0 {
            return None;
        }
        self.by_session.get(&session_id).copied()
    }

    /// Allocates a slot for a new pair and indexes it by composite key.
    /// The session id stays 0 until the first bilateral match.
    pub fn insert(
        &mut self,
        local_id: PeerId,
        remote_id: PeerId,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<PairHandle> {
        let key = PairKey::new(local_id, remote_id);
        if self.by_key.contains_key(&key) {
            return Err(Error::ErrDuplicatePairKey);
        }
        let index = self.free.pop().ok_or(Error::ErrPairTableFull)?;
        let slot = &mut self.slots[index as usize];
        slot.pair = Some(Pair::new(local_id, remote_id, addr, now));
        let handle = PairHandle {
            index,
            generation: slot.generation,
        };
        self.by_key.insert(key, handle);
        Ok(handle)
    }

    /// Generates a fresh session id for the pair and adds it to the session
    /// index. Ids are unique for the lifetime of the registry; 0 is never
    /// produced.
    pub fn assign_session(&mut self, handle: PairHandle) -> Option<u64> {
        self.get(handle)?;

        let mut rng = rand::thread_rng();
        let session_id = loop {
            let sid = match rng.gen::<u64>() {
                0 => 1,
                n => n,
            };
            if !self.by_session.contains_key(&sid) {
                break sid;
            }
        };

        self.by_session.insert(session_id, handle);
        if let Some(pair) = self.get_mut(handle) {
            pair.session_id = session_id;
        }
        Some(session_id)
    }

    /// Removes the pair from both indices and frees its slot. If a live
    /// sibling still points here, its reference flips to `Broken` so its
    /// next REGISTER or ALIVE observes the loss. Returns the released pair.
    pub fn release(&mut self, handle: PairHandle) -> Option<Pair> {
        // Validate before mutating anything.
        self.get(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let pair = slot.pair.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        self.by_key.remove(&pair.key());
        if pair.session_id != 0 {
            self.by_session.remove(&pair.session_id);
        }

        if let PeerRef::Linked(sibling) = pair.peer_ref {
            if let Some(sib) = self.get_mut(sibling) {
                sib.peer_ref = PeerRef::Broken;
            }
        }

        Some(pair)
    }

    /// All live handles, in slot order.
    pub fn handles(&self) -> Vec<PairHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.pair.is_some())
            .map(|(i, s)| PairHandle {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Handles of pairs idle past `ttl` at `now`.
    pub fn expired(&self, now: Instant, ttl: Duration) -> Vec<PairHandle> {
        self.handles()
            .into_iter()
            .filter(|&h| {
                self.get(h)
                    .map(|p| now.duration_since(p.last_active) > ttl)
                    .unwrap_or(false)
            })
            .collect()
    }
}
