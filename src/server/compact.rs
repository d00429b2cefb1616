#[cfg(test)]
mod compact_test;

use std::net::SocketAddr;

use tokio::time::Instant;

use super::config::ServerConfig;
use crate::pairing::registry::PairRegistry;
use crate::pairing::retransmit::{RetransmitQueue, MAX_RETRIES, RETRY_INTERVAL};
use crate::pairing::*;
use crate::proto::addr::WireAddr;
use crate::proto::candidate::{Candidate, MAX_CANDIDATES};
use crate::proto::compact::{self, *};
use crate::proto::*;

/// A datagram the event loop should write: destination, then bytes.
pub type Outbound = (SocketAddr, Vec<u8>);

/// `CompactHandler` runs the compact-mode state machine: one call per
/// datagram, plus the periodic retransmit and cleanup passes. It owns the
/// pair registry and the seq=0 retransmit FIFO; the event loop owns the
/// sockets.
pub struct CompactHandler {
    registry: PairRegistry,
    pending: RetransmitQueue,
    probe_port: u16,
    relay_available: bool,
}

impl CompactHandler {
    pub fn new(config: &ServerConfig) -> Self {
        CompactHandler {
            registry: PairRegistry::new(config.max_pairs),
            pending: RetransmitQueue::new(),
            probe_port: config.probe_port,
            relay_available: config.relay_available,
        }
    }

    pub fn handle_packet(&mut self, now: Instant, src: SocketAddr, data: &[u8]) -> Vec<Outbound> {
        // Compact mode is IPv4-only; a v6 source cannot be represented in
        // any reply or candidate.
        if !src.is_ipv4() {
            log::debug!("dropping datagram from non-IPv4 source {src}");
            return vec![];
        }

        let (header, body) = match compact::split(data) {
            Ok(v) => v,
            Err(err) => {
                log::debug!("dropping malformed datagram from {src}: {err}");
                return vec![];
            }
        };

        match header.typ {
            REGISTER => self.on_register(now, src, &header, body),
            PEER_INFO_ACK => self.on_peer_info_ack(now, src, &header, data, body),
            PEER_INFO | RELAY_DATA | RELAY_ACK => self.on_relay(now, src, &header, data, body),
            ALIVE => self.on_alive(now, src, &header, body),
            UNREGISTER => self.on_unregister(src, body),
            typ => {
                log::debug!("dropping unhandled packet type {typ} from {src}");
                vec![]
            }
        }
    }

    fn on_register(
        &mut self,
        now: Instant,
        src: SocketAddr,
        header: &Header,
        body: &[u8],
    ) -> Vec<Outbound> {
        let mut out = vec![];

        let mut reg = match Register::decode(body) {
            Ok(reg) => reg,
            Err(err) => {
                log::debug!("dropping malformed REGISTER from {src}: {err}");
                return out;
            }
        };
        reg.candidates.truncate(MAX_CANDIDATES);

        let flags = if self.relay_available {
            FLAG_RELAY_AVAILABLE
        } else {
            0
        };
        let public = match WireAddr::from_socket_addr(&src) {
            Ok(a) => a,
            Err(_) => return out,
        };

        let mut addr_changed = false;
        let handle = match self.registry.find_by_composite(&reg.local_id, &reg.remote_id) {
            Some(handle) => {
                if let Some(pair) = self.registry.get_mut(handle) {
                    addr_changed = pair.addr != src;
                    pair.addr = src;
                    pair.candidates = reg.candidates.clone();
                    pair.last_active = now;
                }
                handle
            }
            None => match self.registry.insert(reg.local_id, reg.remote_id, src, now) {
                Ok(handle) => {
                    if let Some(pair) = self.registry.get_mut(handle) {
                        pair.candidates = reg.candidates.clone();
                    }
                    log::debug!("registered pair {}->{} from {src}", reg.local_id, reg.remote_id);
                    handle
                }
                Err(err) => {
                    log::warn!(
                        "cannot register {}->{} from {src}: {err}",
                        reg.local_id,
                        reg.remote_id
                    );
                    let ack = RegisterAck {
                        status: STATUS_TABLE_FULL,
                        max_candidates: MAX_CANDIDATES as u8,
                        public,
                        probe_port: self.probe_port,
                    };
                    out.push((src, ack.encode(header.seq, flags)));
                    return out;
                }
            },
        };

        let reverse = self
            .registry
            .find_by_composite(&reg.remote_id, &reg.local_id);

        let ack = RegisterAck {
            status: if reverse.is_some() {
                STATUS_PEER_ONLINE
            } else {
                STATUS_PEER_OFFLINE
            },
            max_candidates: MAX_CANDIDATES as u8,
            public,
            probe_port: self.probe_port,
        };
        out.push((src, ack.encode(header.seq, flags)));

        if let Some(rh) = reverse {
            let linked = self
                .registry
                .get(handle)
                .map(|p| p.peer_ref == PeerRef::Linked(rh))
                .unwrap_or(false)
                && self
                    .registry
                    .get(rh)
                    .map(|p| p.peer_ref == PeerRef::Linked(handle))
                    .unwrap_or(false);

            if !linked {
                self.link_pair(now, handle, rh, &mut out);
            } else if addr_changed {
                self.notify_addr_change(now, src, rh, &mut out);
            }
        }

        out
    }

    /// First bilateral match (or re-match after a break): cross-link the
    /// two records, hand out session ids where missing, reset the reliable
    /// seq=0 machinery and push each side the other's candidates.
    fn link_pair(
        &mut self,
        now: Instant,
        a: PairHandle,
        b: PairHandle,
        out: &mut Vec<Outbound>,
    ) {
        for (this, other) in [(a, b), (b, a)] {
            if self.registry.get(this).map(|p| p.session_id) == Some(0) {
                self.registry.assign_session(this);
            }
            self.pending.remove(this);
            if let Some(pair) = self.registry.get_mut(this) {
                pair.peer_ref = PeerRef::Linked(other);
                pair.info_ack = InfoAckState::Pending;
                pair.addr_notify_seq = 0;
                pair.pending = None;
            }
        }

        if let (Some(pa), Some(pb)) = (self.registry.get(a), self.registry.get(b)) {
            log::debug!(
                "linked {}<->{} (sessions {:x}/{:x})",
                pa.local_id,
                pb.local_id,
                pa.session_id,
                pb.session_id
            );
        }

        for handle in [a, b] {
            if let Some((dest, packet)) = self.build_info(handle, 0) {
                out.push((dest, packet));
                if let Some(pair) = self.registry.get_mut(handle) {
                    pair.pending = Some(PendingInfo {
                        base_index: 0,
                        retry: 0,
                        sent_at: now,
                    });
                }
                self.pending.enqueue(handle);
            }
        }
    }

    /// A linked peer re-registered from a new endpoint: push a one-entry
    /// srflx update to its sibling, on the sibling's reliability slot. The
    /// update waits while the sibling's initial seq=0 is still pending,
    /// since every retransmission already rebuilds from the current
    /// address.
    fn notify_addr_change(
        &mut self,
        now: Instant,
        new_addr: SocketAddr,
        peer: PairHandle,
        out: &mut Vec<Outbound>,
    ) {
        let base = match self.registry.get_mut(peer) {
            Some(p) if p.info_ack != InfoAckState::Pending => p.next_notify_seq(),
            _ => return,
        };

        if let Some((dest, packet)) = self.build_info(peer, base) {
            log::debug!("address change -> notifying peer at {dest} (base {base})");
            out.push((dest, packet));
            if let Some(pair) = self.registry.get_mut(peer) {
                pair.pending = Some(PendingInfo {
                    base_index: base,
                    retry: 0,
                    sent_at: now,
                });
            }
            self.pending.enqueue(peer);
        } else {
            log::debug!("address change to {new_addr} had no live sibling to notify");
        }
    }

    /// Builds the seq=0 PEER_INFO currently owed to `handle`: the sibling's
    /// observed endpoint as a synthetic srflx candidate, followed (for the
    /// initial push) by the sibling's registered candidates. Rebuilt from
    /// live state at every send, retransmissions included.
    fn build_info(&self, handle: PairHandle, base_index: u8) -> Option<(SocketAddr, Vec<u8>)> {
        let pair = self.registry.get(handle)?;
        let sibling = match pair.peer_ref {
            PeerRef::Linked(sib) => self.registry.get(sib)?,
            _ => return None,
        };

        let srflx = Candidate::server_reflexive(&sibling.addr).ok()?;
        let mut candidates = vec![srflx];
        if base_index == 0 {
            candidates.extend_from_slice(&sibling.candidates);
        }

        let info = PeerInfo {
            session_id: pair.session_id,
            base_index,
            candidates,
        };
        Some((pair.addr, info.encode(0, FLAG_FINAL_FRAGMENT)))
    }

    fn on_peer_info_ack(
        &mut self,
        now: Instant,
        src: SocketAddr,
        header: &Header,
        data: &[u8],
        body: &[u8],
    ) -> Vec<Outbound> {
        let ack = match PeerInfoAck::decode(body) {
            Ok(ack) => ack,
            Err(err) => {
                log::debug!("dropping malformed PEER_INFO_ACK from {src}: {err}");
                return vec![];
            }
        };

        if header.seq > MAX_ACK_SEQ {
            log::debug!("dropping PEER_INFO_ACK with absurd ack seq {} from {src}", header.seq);
            return vec![];
        }

        if header.seq > 0 {
            // End-to-end ack; the server only relays it.
            return self.forward_to_sibling(now, src, ack.session_id, data, PEER_INFO_ACK);
        }

        let Some(handle) = self.registry.find_by_session(ack.session_id) else {
            log::debug!(
                "PEER_INFO_ACK from {src} for unknown session {:x}",
                ack.session_id
            );
            return vec![];
        };

        if let Some(pair) = self.registry.get_mut(handle) {
            pair.last_active = now;
            match pair.pending.take() {
                Some(p) => {
                    if p.base_index == 0 {
                        pair.info_ack = InfoAckState::Confirmed;
                    }
                    log::debug!("seq0 ack from {src} (base {})", p.base_index);
                }
                None => log::trace!("duplicate seq0 ack from {src}"),
            }
        }
        self.pending.remove(handle);

        vec![]
    }

    fn on_relay(
        &mut self,
        now: Instant,
        src: SocketAddr,
        header: &Header,
        data: &[u8],
        body: &[u8],
    ) -> Vec<Outbound> {
        if header.typ == PEER_INFO && header.seq == 0 {
            // seq=0 is the server's direction only.
            log::debug!("dropping client-originated seq0 PEER_INFO from {src}");
            return vec![];
        }

        let session_id = match peek_session_id(body) {
            Ok(sid) => sid,
            Err(err) => {
                log::debug!("dropping malformed {} from {src}: {err}", header.typ);
                return vec![];
            }
        };

        self.forward_to_sibling(now, src, session_id, data, header.typ)
    }

    /// Relays a datagram unchanged to the sibling of the session's owner.
    fn forward_to_sibling(
        &mut self,
        now: Instant,
        src: SocketAddr,
        session_id: u64,
        data: &[u8],
        typ: PacketType,
    ) -> Vec<Outbound> {
        let Some(handle) = self.registry.find_by_session(session_id) else {
            log::debug!("dropping {typ} from {src}: unknown session {session_id:x}");
            return vec![];
        };

        let sibling = match self.registry.get_mut(handle) {
            Some(pair) => {
                pair.last_active = now;
                match pair.peer_ref {
                    PeerRef::Linked(sib) => sib,
                    _ => {
                        log::debug!("dropping {typ} from {src}: sibling is gone");
                        return vec![];
                    }
                }
            }
            None => return vec![],
        };

        match self.registry.get(sibling) {
            Some(sib) => vec![(sib.addr, data.to_vec())],
            None => {
                log::debug!("dropping {typ} from {src}: sibling is gone");
                vec![]
            }
        }
    }

    fn on_alive(
        &mut self,
        now: Instant,
        src: SocketAddr,
        header: &Header,
        body: &[u8],
    ) -> Vec<Outbound> {
        let ids = match PairIds::decode(body) {
            Ok(ids) => ids,
            Err(err) => {
                log::debug!("dropping malformed ALIVE from {src}: {err}");
                return vec![];
            }
        };

        if let Some(handle) = self.registry.find_by_composite(&ids.local_id, &ids.remote_id) {
            if let Some(pair) = self.registry.get_mut(handle) {
                pair.last_active = now;
            }
        }

        vec![(src, Header::new(ALIVE_ACK, 0, header.seq).with_body(&[]))]
    }

    fn on_unregister(&mut self, src: SocketAddr, body: &[u8]) -> Vec<Outbound> {
        let ids = match PairIds::decode(body) {
            Ok(ids) => ids,
            Err(err) => {
                log::debug!("dropping malformed UNREGISTER from {src}: {err}");
                return vec![];
            }
        };

        let mut out = vec![];
        if let Some(handle) = self.registry.find_by_composite(&ids.local_id, &ids.remote_id) {
            self.notify_peer_off(handle, &mut out);
            self.pending.remove(handle);
            self.registry.release(handle);
            log::debug!("unregistered pair {}->{} from {src}", ids.local_id, ids.remote_id);
        }
        out
    }

    /// Queues a PEER_OFF (carrying the sibling's own session id) for the
    /// live sibling of a pair about to be released.
    fn notify_peer_off(&self, handle: PairHandle, out: &mut Vec<Outbound>) {
        let Some(pair) = self.registry.get(handle) else {
            return;
        };
        if let PeerRef::Linked(sib) = pair.peer_ref {
            if let Some(sibling) = self.registry.get(sib) {
                let off = PeerOff {
                    session_id: sibling.session_id,
                };
                out.push((sibling.addr, off.encode()));
            }
        }
    }

    /// The 1 s pass over the retransmit FIFO: resend whatever is due,
    /// oldest first, and give up after the retry budget.
    pub fn retransmit_pass(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = vec![];

        while let Some(handle) = self.pending.front() {
            let Some(p) = self.registry.get(handle).and_then(|pair| pair.pending) else {
                // Queue entry without pending state; drop it.
                self.pending.pop_front();
                continue;
            };

            if now.duration_since(p.sent_at) < RETRY_INTERVAL {
                break;
            }
            self.pending.pop_front();

            if p.retry >= MAX_RETRIES {
                if let Some(pair) = self.registry.get_mut(handle) {
                    if p.base_index == 0 {
                        pair.info_ack = InfoAckState::GivenUp;
                    }
                    pair.pending = None;
                    log::debug!(
                        "giving up on seq0 delivery to {} (base {})",
                        pair.addr,
                        p.base_index
                    );
                }
                continue;
            }

            match self.build_info(handle, p.base_index) {
                Some((dest, packet)) => {
                    out.push((dest, packet));
                    if let Some(pair) = self.registry.get_mut(handle) {
                        pair.pending = Some(PendingInfo {
                            base_index: p.base_index,
                            retry: p.retry + 1,
                            sent_at: now,
                        });
                    }
                    self.pending.enqueue(handle);
                }
                None => {
                    // Sibling vanished under the outstanding packet.
                    if let Some(pair) = self.registry.get_mut(handle) {
                        pair.pending = None;
                    }
                    log::debug!("abandoning seq0 delivery: sibling is gone");
                }
            }
        }

        out
    }

    /// The 10 s pass over the pair table: reclaim idle pairs, notifying
    /// live siblings.
    pub fn cleanup(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = vec![];

        for handle in self.registry.expired(now, PAIR_TTL) {
            if let Some(pair) = self.registry.get(handle) {
                log::debug!(
                    "expiring idle pair {}->{} at {}",
                    pair.local_id,
                    pair.remote_id,
                    pair.addr
                );
            }
            self.notify_peer_off(handle, &mut out);
            self.pending.remove(handle);
            self.registry.release(handle);
        }

        out
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
