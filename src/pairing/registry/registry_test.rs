use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::*;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, last)), port)
}

#[test]
fn test_insert_and_dual_lookup() -> Result<()> {
    let mut reg = PairRegistry::new(4);
    let now = Instant::now();

    let alice = PeerId::from("alice");
    let bob = PeerId::from("bob");

    let h = reg.insert(alice, bob, addr(1, 1000), now)?;
    assert_eq!(reg.find_by_composite(&alice, &bob), Some(h));
    assert_eq!(reg.find_by_composite(&bob, &alice), None);

    // No session id yet, so the session index knows nothing.
    assert_eq!(reg.get(h).unwrap().session_id, 0);
    assert_eq!(reg.find_by_session(0), None);

    let sid = reg.assign_session(h).unwrap();
    assert_ne!(sid, 0);
    assert_eq!(reg.get(h).unwrap().session_id, sid);
    assert_eq!(reg.find_by_session(sid), Some(h));

    Ok(())
}

#[test]
fn test_duplicate_key_rejected() -> Result<()> {
    let mut reg = PairRegistry::new(4);
    let now = Instant::now();

    reg.insert(PeerId::from("a"), PeerId::from("b"), addr(1, 1), now)?;
    assert_eq!(
        reg.insert(PeerId::from("a"), PeerId::from("b"), addr(2, 2), now),
        Err(Error::ErrDuplicatePairKey)
    );

    Ok(())
}

#[test]
fn test_capacity_exhaustion() -> Result<()> {
    let mut reg = PairRegistry::new(2);
    let now = Instant::now();

    reg.insert(PeerId::from("a"), PeerId::from("b"), addr(1, 1), now)?;
    reg.insert(PeerId::from("c"), PeerId::from("d"), addr(2, 2), now)?;
    assert_eq!(
        reg.insert(PeerId::from("e"), PeerId::from("f"), addr(3, 3), now),
        Err(Error::ErrPairTableFull)
    );

    Ok(())
}

#[test]
fn test_release_clears_both_indices_and_reuses_slot() -> Result<()> {
    let mut reg = PairRegistry::new(1);
    let now = Instant::now();

    let a = PeerId::from("a");
    let b = PeerId::from("b");
    let h = reg.insert(a, b, addr(1, 1), now)?;
    let sid = reg.assign_session(h).unwrap();

    assert!(reg.release(h).is_some());
    assert_eq!(reg.find_by_composite(&a, &b), None);
    assert_eq!(reg.find_by_session(sid), None);
    assert!(reg.get(h).is_none(), "stale handle must not resolve");
    assert!(reg.release(h).is_none(), "double release is a no-op");

    // The slot is free again and the recycled handle carries a new
    // generation.
    let h2 = reg.insert(a, b, addr(2, 2), now)?;
    assert_ne!(h, h2);
    assert!(reg.get(h).is_none());
    assert!(reg.get(h2).is_some());

    Ok(())
}

#[test]
fn test_release_breaks_sibling_link() -> Result<()> {
    let mut reg = PairRegistry::new(4);
    let now = Instant::now();

    let a = PeerId::from("a");
    let b = PeerId::from("b");
    let ha = reg.insert(a, b, addr(1, 1), now)?;
    let hb = reg.insert(b, a, addr(2, 2), now)?;

    reg.get_mut(ha).unwrap().peer_ref = PeerRef::Linked(hb);
    reg.get_mut(hb).unwrap().peer_ref = PeerRef::Linked(ha);

    reg.release(ha);
    assert_eq!(reg.get(hb).unwrap().peer_ref, PeerRef::Broken);

    Ok(())
}

#[test]
fn test_session_ids_unique_and_nonzero() -> Result<()> {
    let mut reg = PairRegistry::new(16);
    let now = Instant::now();

    let mut seen = std::collections::HashSet::new();
    for i in 0..16u8 {
        let local = PeerId::new(&[i + 1]);
        let remote = PeerId::new(&[i + 1, 1]);
        let h = reg.insert(local, remote, addr(i, 100), now)?;
        let sid = reg.assign_session(h).unwrap();
        assert_ne!(sid, 0);
        assert!(seen.insert(sid), "session id {sid} repeated");
    }

    Ok(())
}

#[test]
fn test_expired_selects_only_idle_pairs() -> Result<()> {
    let mut reg = PairRegistry::new(4);
    let now = Instant::now();

    let h1 = reg.insert(PeerId::from("a"), PeerId::from("b"), addr(1, 1), now)?;
    let h2 = reg.insert(PeerId::from("c"), PeerId::from("d"), addr(2, 2), now)?;

    let later = now + Duration::from_secs(91);
    reg.get_mut(h2).unwrap().last_active = later;

    let expired = reg.expired(later, PAIR_TTL);
    assert_eq!(expired, vec![h1]);

    Ok(())
}
