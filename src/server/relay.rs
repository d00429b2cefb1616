
use tokio::time::Instant;

use super::config::ServerConfig;
use crate::error::*;
use crate::presence::client_table::ClientTable;
use crate::presence::*;
use crate::proto::relay::{self, *};
use crate::proto::PeerId;

/// What the event loop should do with a relay-mode client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    Send(ClientHandle, Vec<u8>),
    Close(ClientHandle),
}

/// `RelayHandler` runs the relay-mode state machine over framed TCP: one
/// call per decoded frame. It owns the client table; the event loop owns
/// the sockets and maps handles to write halves.
pub struct RelayHandler {
    table: ClientTable,
}

impl RelayHandler {
    pub fn new(config: &ServerConfig) -> Self {
        RelayHandler {
            table: ClientTable::new(config.max_clients),
        }
    }

    /// Admits a freshly accepted connection. On a full table the caller
    /// just closes the socket.
    pub fn on_accept(&mut self, now: Instant) -> Result<ClientHandle> {
        let handle = self.table.accept(now)?;
        log::debug!("accepted relay client {handle}");
        Ok(handle)
    }

    /// The connection is gone (EOF, framing error, oversized frame).
    pub fn on_disconnect(&mut self, handle: ClientHandle) {
        if let Some(client) = self.table.release(handle) {
            log::debug!("relay client {handle} ({}) disconnected", client.name);
        }
    }

    pub fn on_frame(&mut self, now: Instant, handle: ClientHandle, frame: &Frame) -> Vec<RelayAction> {
        if let Some(client) = self.table.get_mut(handle) {
            client.last_active = now;
        } else {
            return vec![];
        }

        match frame.opcode {
            LOGIN => self.on_login(now, handle, &frame.body),
            LIST => self.on_list(handle),
            CONNECT => self.on_connect(now, handle, &frame.body),
            ANSWER => self.on_answer(handle, &frame.body),
            HEARTBEAT => vec![],
            opcode => {
                log::debug!("dropping unhandled relay frame {opcode} from {handle}");
                vec![]
            }
        }
    }

    /// LOGIN names the slot, acks, merges any offline placeholder for the
    /// same name and replays whatever it cached.
    fn on_login(&mut self, now: Instant, handle: ClientHandle, body: &[u8]) -> Vec<RelayAction> {
        let login = match Login::decode(body) {
            Ok(login) => login,
            Err(err) => {
                log::debug!("closing {handle}: malformed LOGIN: {err}");
                return vec![RelayAction::Close(handle)];
            }
        };

        if let Some(client) = self.table.get_mut(handle) {
            client.name = login.name;
        }
        log::debug!("relay client {handle} logged in as {}", login.name);

        let mut actions = vec![RelayAction::Send(
            handle,
            Frame::new(LOGIN_ACK, vec![]).encode(),
        )];

        // Merge the placeholder another client may have filled while this
        // name was offline.
        if let Some(ph) = self.table.find_placeholder(&login.name) {
            let cached = self
                .table
                .get(ph)
                .map(|c| !c.pending.is_empty())
                .unwrap_or(false);
            if cached {
                if let Some(placeholder) = self.table.release(ph) {
                    if let Some(client) = self.table.get_mut(handle) {
                        client.pending = placeholder.pending;
                        client.pending_sender = placeholder.pending_sender;
                    }
                }
            }
        }

        actions.extend(self.flush_pending(handle));
        actions
    }

    /// Delivers cached candidates to a freshly logged-in client. A cache
    /// filled to the cap is replayed as an empty OFFER: the signal that
    /// storage overflowed and the client should connect back instead.
    fn flush_pending(&mut self, handle: ClientHandle) -> Vec<RelayAction> {
        let Some(client) = self.table.get_mut(handle) else {
            return vec![];
        };
        if client.pending.is_empty() {
            return vec![];
        }

        let name = client.name;
        let sender = client.pending_sender.take().unwrap_or_default();
        let pending = std::mem::take(&mut client.pending);
        let full = pending.len() >= MAX_PENDING_CANDIDATES;

        let count = if full { 0 } else { pending.len() };
        let mut payload = vec![];
        SignalHeader {
            sender,
            target: name,
            timestamp: 0,
            delay_trigger: 0,
            count: count as u32,
        }
        .encode(&mut payload);
        if !full {
            for blob in &pending {
                payload.extend_from_slice(blob);
            }
        }

        log::debug!(
            "replaying {} cached candidates from {sender} to {name}",
            count
        );
        vec![RelayAction::Send(
            handle,
            relay::forwarded_frame(OFFER, &sender, &payload),
        )]
    }

    /// CONNECT: forward to an online target (OFFER on first contact,
    /// FORWARD afterwards), or cache for an offline one. Always acked.
    fn on_connect(&mut self, now: Instant, handle: ClientHandle, body: &[u8]) -> Vec<RelayAction> {
        let sig = match Signal::decode(body) {
            Ok(sig) => sig,
            Err(err) => {
                log::debug!("closing {handle}: malformed CONNECT: {err}");
                return vec![RelayAction::Close(handle)];
            }
        };
        let sender = sig.header.sender;

        if let Some(th) = self.table.find_online(&sig.target) {
            let opcode = match self.table.get_mut(th) {
                Some(target) => {
                    if target.current_peer.as_ref() != Some(&sender) {
                        target.current_peer = Some(sender);
                        OFFER
                    } else {
                        FORWARD
                    }
                }
                None => return vec![],
            };

            log::debug!("forwarding {opcode} {sender} -> {} ({th})", sig.target);
            return vec![
                RelayAction::Send(
                    th,
                    relay::forwarded_frame(opcode, &sender, Signal::payload(body)),
                ),
                RelayAction::Send(
                    handle,
                    ConnectAck {
                        status: CONNECT_FORWARDED,
                        candidates_acked: sig.candidates.len() as u8,
                    }
                    .encode(),
                ),
            ];
        }

        // Offline path: find or create the placeholder and cache what fits.
        let ph = match self.table.find_placeholder(&sig.target) {
            Some(ph) => ph,
            None => match self.table.placeholder(sig.target, now) {
                Ok(ph) => ph,
                Err(err) => {
                    log::warn!("cannot cache candidates for {}: {err}", sig.target);
                    return vec![RelayAction::Send(
                        handle,
                        ConnectAck {
                            status: CONNECT_CACHE_FULL,
                            candidates_acked: 0,
                        }
                        .encode(),
                    )];
                }
            },
        };

        let Some(target) = self.table.get_mut(ph) else {
            return vec![];
        };
        target.last_active = now;

        // A different depositor claims the cache outright.
        if target.pending.is_empty() || target.pending_sender != Some(sender) {
            if !target.pending.is_empty() {
                log::debug!(
                    "discarding {} candidates cached by {:?} for {}",
                    target.pending.len(),
                    target.pending_sender,
                    sig.target
                );
            }
            target.pending.clear();
            target.pending_sender = Some(sender);
        }

        let mut acked = 0u8;
        for blob in &sig.candidates {
            if target.pending.len() >= MAX_PENDING_CANDIDATES {
                log::debug!(
                    "candidate cache for {} is full, dropping {} entries",
                    sig.target,
                    sig.candidates.len() - acked as usize
                );
                break;
            }
            target.pending.push(*blob);
            acked += 1;
        }

        let status = if target.pending.len() < MAX_PENDING_CANDIDATES {
            CONNECT_CACHED
        } else {
            CONNECT_CACHE_FULL
        };

        log::debug!(
            "cached {acked} candidates from {sender} for offline {}",
            sig.target
        );
        vec![RelayAction::Send(
            handle,
            ConnectAck {
                status,
                candidates_acked: acked,
            }
            .encode(),
        )]
    }

    /// ANSWER: forward-only and unacked; an offline target is a protocol
    /// violation worth logging, nothing more.
    fn on_answer(&mut self, handle: ClientHandle, body: &[u8]) -> Vec<RelayAction> {
        let sig = match Signal::decode(body) {
            Ok(sig) => sig,
            Err(err) => {
                log::debug!("closing {handle}: malformed ANSWER: {err}");
                return vec![RelayAction::Close(handle)];
            }
        };
        let sender = sig.header.sender;

        match self.table.find_online(&sig.target) {
            Some(th) => {
                log::debug!("forwarding ANSWER {sender} -> {} ({th})", sig.target);
                vec![RelayAction::Send(
                    th,
                    relay::forwarded_frame(FORWARD, &sender, Signal::payload(body)),
                )]
            }
            None => {
                log::debug!("dropping ANSWER from {sender}: {} is offline", sig.target);
                vec![]
            }
        }
    }

    /// LIST: every named slot except the caller, comma separated, cut at
    /// the reply bound on a whole-name boundary.
    fn on_list(&mut self, handle: ClientHandle) -> Vec<RelayAction> {
        let mut body: Vec<u8> = vec![];

        for other in self.table.handles() {
            if other == handle {
                continue;
            }
            let Some(client) = self.table.get(other) else {
                continue;
            };
            if client.name.is_empty() {
                continue;
            }

            let name = client.name.to_string();
            let extra = name.len() + usize::from(!body.is_empty());
            if body.len() + extra > LIST_REPLY_MAX {
                log::debug!("LIST reply truncated at {} octets", body.len());
                break;
            }
            if !body.is_empty() {
                body.push(b',');
            }
            body.extend_from_slice(name.as_bytes());
        }

        vec![RelayAction::Send(
            handle,
            Frame::new(LIST_RES, body).encode(),
        )]
    }

    /// The 10 s pass over the client table; returns the slots that were
    /// reclaimed so the loop can close any live sockets.
    pub fn cleanup(&mut self, now: Instant) -> Vec<ClientHandle> {
        let expired = self.table.expired(now, CLIENT_TTL);
        for &handle in &expired {
            if let Some(client) = self.table.release(handle) {
                log::debug!(
                    "expiring idle relay client {handle} ({}, online={})",
                    client.name,
                    client.online
                );
            }
        }
        expired
    }
}
