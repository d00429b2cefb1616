use std::net::SocketAddr;

use tokio::time::Duration;

use super::*;
use crate::error::Result;
use crate::proto::candidate::CandidateKind;

fn handler() -> CompactHandler {
    CompactHandler::new(&ServerConfig::default())
}

fn sa(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn host(ip: &str, port: u16) -> Candidate {
    Candidate {
        kind: CandidateKind::Host,
        addr: WireAddr {
            ip: ip.parse().unwrap(),
            port,
        },
    }
}

fn srflx(ip: &str, port: u16) -> Candidate {
    Candidate {
        kind: CandidateKind::ServerReflexive,
        addr: WireAddr {
            ip: ip.parse().unwrap(),
            port,
        },
    }
}

fn register(local: &str, remote: &str, candidates: Vec<Candidate>) -> Vec<u8> {
    Register {
        local_id: PeerId::from(local),
        remote_id: PeerId::from(remote),
        candidates,
    }
    .encode(1)
}

fn decode_ack(raw: &[u8]) -> (Header, RegisterAck) {
    let (header, body) = compact::split(raw).unwrap();
    assert_eq!(header.typ, REGISTER_ACK);
    (header, RegisterAck::decode(body).unwrap())
}

fn decode_info(raw: &[u8]) -> (Header, PeerInfo) {
    let (header, body) = compact::split(raw).unwrap();
    assert_eq!(header.typ, PEER_INFO);
    (header, PeerInfo::decode(body).unwrap())
}

/// Drives the two REGISTERs of the symmetric-match scenario and returns
/// (alice session, bob session).
fn link(h: &mut CompactHandler, now: Instant) -> (u64, u64) {
    let out = h.handle_packet(
        now,
        sa("1.1.1.1:1000"),
        &register("alice", "bob", vec![host("10.0.0.1", 1000)]),
    );
    assert_eq!(out.len(), 1);

    let out = h.handle_packet(
        now,
        sa("2.2.2.2:2000"),
        &register("bob", "alice", vec![host("10.0.0.2", 2000)]),
    );
    assert_eq!(out.len(), 3);

    let alice = h
        .registry
        .find_by_composite(&PeerId::from("alice"), &PeerId::from("bob"))
        .unwrap();
    let bob = h
        .registry
        .find_by_composite(&PeerId::from("bob"), &PeerId::from("alice"))
        .unwrap();
    (
        h.registry.get(alice).unwrap().session_id,
        h.registry.get(bob).unwrap().session_id,
    )
}

#[test]
fn test_symmetric_bilateral_match() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();

    // First direction: peer is still offline.
    let out = h.handle_packet(
        t0,
        sa("1.1.1.1:1000"),
        &register("alice", "bob", vec![host("10.0.0.1", 1000)]),
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, sa("1.1.1.1:1000"));
    let (header, ack) = decode_ack(&out[0].1);
    assert_eq!(header.seq, 1, "ack echoes the request seq");
    assert_eq!(ack.status, STATUS_PEER_OFFLINE);
    assert_eq!(ack.max_candidates, MAX_CANDIDATES as u8);
    assert_eq!(ack.public.to_string(), "1.1.1.1:1000");
    assert_eq!(ack.probe_port, 0);

    // Reverse direction: ack plus one seq0 PEER_INFO to each side.
    let t1 = t0 + Duration::from_secs(1);
    let out = h.handle_packet(
        t1,
        sa("2.2.2.2:2000"),
        &register("bob", "alice", vec![host("10.0.0.2", 2000)]),
    );
    assert_eq!(out.len(), 3);

    let (_, ack) = decode_ack(&out[0].1);
    assert_eq!(ack.status, STATUS_PEER_ONLINE);
    assert_eq!(ack.public.to_string(), "2.2.2.2:2000");

    let to_alice = out.iter().find(|(d, _)| *d == sa("1.1.1.1:1000")).unwrap();
    let (header, info) = decode_info(&to_alice.1);
    assert_eq!(header.seq, 0);
    assert_eq!(info.base_index, 0);
    assert_eq!(
        info.candidates,
        vec![srflx("2.2.2.2", 2000), host("10.0.0.2", 2000)]
    );

    let to_bob = out
        .iter()
        .filter(|(d, _)| *d == sa("2.2.2.2:2000"))
        .nth(1)
        .unwrap();
    let (_, info_bob) = decode_info(&to_bob.1);
    assert_eq!(
        info_bob.candidates,
        vec![srflx("1.1.1.1", 1000), host("10.0.0.1", 1000)]
    );

    assert_eq!(h.pending.len(), 2, "both sides await a seq0 ack");

    // Alice acknowledges: her entry leaves the FIFO, confirmed.
    let alice_sid = info.session_id;
    assert_ne!(alice_sid, 0);
    let out = h.handle_packet(
        t1,
        sa("1.1.1.1:1000"),
        &PeerInfoAck {
            session_id: alice_sid,
        }
        .encode(0),
    );
    assert!(out.is_empty());
    assert_eq!(h.pending.len(), 1);

    let alice = h.registry.find_by_session(alice_sid).unwrap();
    let pair = h.registry.get(alice).unwrap();
    assert_eq!(pair.info_ack, InfoAckState::Confirmed);
    assert!(pair.pending.is_none());

    Ok(())
}

#[test]
fn test_retransmit_until_give_up() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    link(&mut h, t0);

    // No acks ever arrive. Each pass at a 2 s boundary resends both
    // packets until the retry budget is spent.
    let mut resends = 0;
    for i in 1..=7u64 {
        let now = t0 + Duration::from_secs(2 * i);
        resends += h.retransmit_pass(now).len();
    }
    assert_eq!(resends, 2 * MAX_RETRIES as usize);
    assert!(h.pending.is_empty());

    for handle in h.registry.handles() {
        let pair = h.registry.get(handle).unwrap();
        assert_eq!(pair.info_ack, InfoAckState::GivenUp);
        assert!(pair.pending.is_none());
    }

    // Given up means silent; nothing further goes out.
    let out = h.retransmit_pass(t0 + Duration::from_secs(60));
    assert!(out.is_empty());

    Ok(())
}

#[test]
fn test_retransmit_rebuilds_from_current_state() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    link(&mut h, t0);

    // Bob re-registers with a different candidate list before any
    // retransmission; the resent packet to alice must reflect it.
    let out = h.handle_packet(
        t0 + Duration::from_secs(1),
        sa("2.2.2.2:2000"),
        &register("bob", "alice", vec![host("172.16.0.2", 9)]),
    );
    // Linked and address unchanged: just the ack.
    assert_eq!(out.len(), 1);

    let out = h.retransmit_pass(t0 + Duration::from_secs(2));
    let to_alice = out.iter().find(|(d, _)| *d == sa("1.1.1.1:1000")).unwrap();
    let (_, info) = decode_info(&to_alice.1);
    assert_eq!(
        info.candidates,
        vec![srflx("2.2.2.2", 2000), host("172.16.0.2", 9)]
    );

    Ok(())
}

#[test]
fn test_fifo_order_is_preserved_across_resends() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    link(&mut h, t0);

    let first = h.pending.front().unwrap();
    h.retransmit_pass(t0 + Duration::from_secs(2));
    // Both were due; both moved to the tail in order.
    assert_eq!(h.pending.front(), Some(first));
    assert_eq!(h.pending.len(), 2);

    Ok(())
}

#[test]
fn test_register_idempotence() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();

    let packet = register("alice", "bob", vec![host("10.0.0.1", 1000)]);
    let first = h.handle_packet(t0, sa("1.1.1.1:1000"), &packet);
    let second = h.handle_packet(t0 + Duration::from_secs(1), sa("1.1.1.1:1000"), &packet);

    assert_eq!(first, second, "identical REGISTERs produce identical acks");
    assert_eq!(h.registry.len(), 1);

    Ok(())
}

#[test]
fn test_unregister_notifies_sibling_and_relinks_fresh() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    let (alice_sid, bob_sid) = link(&mut h, t0);

    let out = h.handle_packet(
        t0 + Duration::from_secs(2),
        sa("1.1.1.1:1000"),
        &PairIds {
            local_id: PeerId::from("alice"),
            remote_id: PeerId::from("bob"),
        }
        .encode(UNREGISTER, 2),
    );

    // Bob gets a PEER_OFF carrying bob's own session id.
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, sa("2.2.2.2:2000"));
    let (header, body) = compact::split(&out[0].1)?;
    assert_eq!(header.typ, PEER_OFF);
    assert_eq!(PeerOff::decode(body)?.session_id, bob_sid);

    assert_eq!(h.registry.len(), 1);
    let bob = h.registry.find_by_session(bob_sid).unwrap();
    assert_eq!(h.registry.get(bob).unwrap().peer_ref, PeerRef::Broken);

    // A matching re-REGISTER relinks with a fresh session id for the
    // rebuilt direction.
    let out = h.handle_packet(
        t0 + Duration::from_secs(3),
        sa("1.1.1.1:1000"),
        &register("alice", "bob", vec![host("10.0.0.1", 1000)]),
    );
    assert_eq!(out.len(), 3);

    let alice = h
        .registry
        .find_by_composite(&PeerId::from("alice"), &PeerId::from("bob"))
        .unwrap();
    let new_sid = h.registry.get(alice).unwrap().session_id;
    assert_ne!(new_sid, 0);
    assert_ne!(new_sid, alice_sid);
    assert_eq!(h.registry.get(bob).unwrap().session_id, bob_sid);
    assert_eq!(h.registry.get(bob).unwrap().peer_ref, PeerRef::Linked(alice));

    Ok(())
}

#[test]
fn test_pair_table_full() -> Result<()> {
    let mut h = CompactHandler::new(&ServerConfig {
        max_pairs: 1,
        ..Default::default()
    });
    let t0 = Instant::now();

    h.handle_packet(t0, sa("1.1.1.1:1"), &register("a", "b", vec![]));
    let out = h.handle_packet(t0, sa("1.1.1.2:2"), &register("c", "d", vec![]));

    assert_eq!(out.len(), 1);
    let (_, ack) = decode_ack(&out[0].1);
    assert_eq!(ack.status, STATUS_TABLE_FULL);
    assert_eq!(h.registry.len(), 1, "a full table changes no state");

    Ok(())
}

#[test]
fn test_register_truncates_excess_candidates() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();

    let candidates: Vec<Candidate> = (0..40).map(|i| host("10.0.0.1", 1000 + i)).collect();
    h.handle_packet(t0, sa("1.1.1.1:1000"), &register("alice", "bob", candidates));

    let alice = h
        .registry
        .find_by_composite(&PeerId::from("alice"), &PeerId::from("bob"))
        .unwrap();
    assert_eq!(h.registry.get(alice).unwrap().candidates.len(), MAX_CANDIDATES);

    Ok(())
}

#[test]
fn test_zero_candidate_register_still_links() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();

    h.handle_packet(t0, sa("1.1.1.1:1000"), &register("alice", "bob", vec![]));
    let out = h.handle_packet(t0, sa("2.2.2.2:2000"), &register("bob", "alice", vec![]));

    let to_bob = out
        .iter()
        .filter(|(d, _)| *d == sa("2.2.2.2:2000"))
        .nth(1)
        .unwrap();
    let (_, info) = decode_info(&to_bob.1);
    assert_eq!(
        info.candidates,
        vec![srflx("1.1.1.1", 1000)],
        "body lists only the synthetic srflx candidate"
    );

    Ok(())
}

#[test]
fn test_forwarding_by_session() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    let (alice_sid, _) = link(&mut h, t0);

    // Alice's relayed data reaches bob unchanged.
    let mut packet = Header::new(RELAY_DATA, 0, 3).with_body(&alice_sid.to_be_bytes());
    packet.extend_from_slice(b"payload");
    let out = h.handle_packet(t0, sa("1.1.1.1:1000"), &packet);
    assert_eq!(out, vec![(sa("2.2.2.2:2000"), packet.clone())]);

    // Same for end-to-end PEER_INFO with seq > 0 and PEER_INFO_ACK.
    let info = PeerInfo {
        session_id: alice_sid,
        base_index: 0,
        candidates: vec![],
    }
    .encode(2, 0);
    let out = h.handle_packet(t0, sa("1.1.1.1:1000"), &info);
    assert_eq!(out, vec![(sa("2.2.2.2:2000"), info.clone())]);

    let ack = PeerInfoAck {
        session_id: alice_sid,
    }
    .encode(2);
    let out = h.handle_packet(t0, sa("1.1.1.1:1000"), &ack);
    assert_eq!(out, vec![(sa("2.2.2.2:2000"), ack.clone())]);

    // Unknown sessions go nowhere.
    let bogus = Header::new(RELAY_DATA, 0, 3).with_body(&0xABADC0DEu64.to_be_bytes());
    assert!(h.handle_packet(t0, sa("9.9.9.9:9"), &bogus).is_empty());

    // seq=0 PEER_INFO is the server's direction only.
    let forged = PeerInfo {
        session_id: alice_sid,
        base_index: 0,
        candidates: vec![],
    }
    .encode(0, 0);
    assert!(h.handle_packet(t0, sa("1.1.1.1:1000"), &forged).is_empty());

    // Absurd ack numbers are dropped, not relayed.
    let absurd = PeerInfoAck {
        session_id: alice_sid,
    }
    .encode(MAX_ACK_SEQ + 1);
    assert!(h.handle_packet(t0, sa("1.1.1.1:1000"), &absurd).is_empty());

    Ok(())
}

#[test]
fn test_alive_always_acked_and_refreshes_ttl() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    link(&mut h, t0);

    let alive = PairIds {
        local_id: PeerId::from("alice"),
        remote_id: PeerId::from("bob"),
    }
    .encode(ALIVE, 6);

    let t60 = t0 + Duration::from_secs(60);
    let out = h.handle_packet(t60, sa("1.1.1.1:1000"), &alive);
    assert_eq!(out.len(), 1);
    let (header, body) = compact::split(&out[0].1)?;
    assert_eq!(header.typ, ALIVE_ACK);
    assert_eq!(header.seq, 6);
    assert!(body.is_empty());

    // Alice was refreshed at t60; only bob expires at t95.
    let out = h.cleanup(t0 + Duration::from_secs(95));
    assert_eq!(out.len(), 1, "alice hears that bob went away");
    assert_eq!(out[0].0, sa("1.1.1.1:1000"));
    assert_eq!(h.registry.len(), 1);

    // An ALIVE for a pair the server no longer knows is still acked.
    let out = h.handle_packet(
        t60,
        sa("8.8.8.8:8"),
        &PairIds {
            local_id: PeerId::from("nobody"),
            remote_id: PeerId::from("noone"),
        }
        .encode(ALIVE, 7),
    );
    assert_eq!(out.len(), 1);

    Ok(())
}

#[test]
fn test_pair_ttl_expiry() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    let (_, bob_sid) = link(&mut h, t0);

    assert!(h.cleanup(t0 + Duration::from_secs(90)).is_empty());

    let out = h.cleanup(t0 + Duration::from_secs(91));
    // The first reclaimed side notifies its then-still-alive sibling.
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, sa("2.2.2.2:2000"));
    let (header, body) = compact::split(&out[0].1)?;
    assert_eq!(header.typ, PEER_OFF);
    assert_eq!(PeerOff::decode(body)?.session_id, bob_sid);

    assert!(h.registry.is_empty());
    assert!(h.pending.is_empty());

    Ok(())
}

#[test]
fn test_address_change_after_ack() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    let (alice_sid, bob_sid) = link(&mut h, t0);

    // Both sides ack their initial push.
    for sid in [alice_sid, bob_sid] {
        let from = if sid == alice_sid {
            sa("1.1.1.1:1000")
        } else {
            sa("2.2.2.2:2000")
        };
        h.handle_packet(t0, from, &PeerInfoAck { session_id: sid }.encode(0));
    }
    assert!(h.pending.is_empty());

    // Alice re-registers from a new endpoint.
    let out = h.handle_packet(
        t0 + Duration::from_secs(5),
        sa("1.1.1.9:9000"),
        &register("alice", "bob", vec![host("10.0.0.1", 1000)]),
    );
    assert_eq!(out.len(), 2);

    let to_bob = out.iter().find(|(d, _)| *d == sa("2.2.2.2:2000")).unwrap();
    let (header, info) = decode_info(&to_bob.1);
    assert_eq!(header.seq, 0);
    assert_eq!(info.base_index, 1, "first notification after linkage");
    assert_eq!(info.session_id, bob_sid);
    assert_eq!(info.candidates, vec![srflx("1.1.1.9", 9000)]);

    let bob = h.registry.find_by_session(bob_sid).unwrap();
    let pair = h.registry.get(bob).unwrap();
    assert_eq!(pair.pending.map(|p| p.base_index), Some(1));
    assert!(h.pending.contains(bob));
    assert_eq!(
        pair.info_ack,
        InfoAckState::Confirmed,
        "the notification does not disturb the initial-push state"
    );

    Ok(())
}

#[test]
fn test_address_change_waits_for_initial_ack() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    link(&mut h, t0);

    // Nobody has acked yet; a new address emits no separate notification.
    let out = h.handle_packet(
        t0 + Duration::from_secs(1),
        sa("1.1.1.9:9000"),
        &register("alice", "bob", vec![host("10.0.0.1", 1000)]),
    );
    assert_eq!(out.len(), 1, "just the ack");

    // The outstanding initial push picks up the new address on resend.
    let out = h.retransmit_pass(t0 + Duration::from_secs(2));
    let to_bob = out.iter().find(|(d, _)| *d == sa("2.2.2.2:2000")).unwrap();
    let (_, info) = decode_info(&to_bob.1);
    assert_eq!(info.candidates[0], srflx("1.1.1.9", 9000));

    Ok(())
}

#[test]
fn test_notify_seq_wraps_skipping_zero() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    let (alice_sid, bob_sid) = link(&mut h, t0);

    for sid in [alice_sid, bob_sid] {
        let from = if sid == alice_sid {
            sa("1.1.1.1:1000")
        } else {
            sa("2.2.2.2:2000")
        };
        h.handle_packet(t0, from, &PeerInfoAck { session_id: sid }.encode(0));
    }

    let bob = h.registry.find_by_session(bob_sid).unwrap();
    h.registry.get_mut(bob).unwrap().addr_notify_seq = 255;

    let out = h.handle_packet(
        t0 + Duration::from_secs(5),
        sa("1.1.1.7:7000"),
        &register("alice", "bob", vec![]),
    );
    let to_bob = out.iter().find(|(d, _)| *d == sa("2.2.2.2:2000")).unwrap();
    let (_, info) = decode_info(&to_bob.1);
    assert_eq!(info.base_index, 1, "255 wraps to 1, never 0");

    Ok(())
}

#[test]
fn test_registry_indices_stay_consistent() -> Result<()> {
    let mut h = handler();
    let t0 = Instant::now();
    link(&mut h, t0);

    for handle in h.registry.handles() {
        let pair = h.registry.get(handle).unwrap();
        assert_eq!(
            h.registry
                .find_by_composite(&pair.local_id, &pair.remote_id),
            Some(handle)
        );
        if pair.session_id != 0 {
            assert_eq!(h.registry.find_by_session(pair.session_id), Some(handle));
        }
    }

    Ok(())
}
