use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::*;

#[test]
fn test_wire_addr_round_trip() -> Result<()> {
    let a = WireAddr {
        ip: Ipv4Addr::new(203, 0, 113, 7),
        port: 40444,
    };

    let mut buf = [0u8; ADDR_WIRE_LEN];
    a.encode(&mut buf)?;
    assert_eq!(buf, [203, 0, 113, 7, 0x9C, 0xFC]);

    let got = WireAddr::decode(&buf)?;
    assert_eq!(got, a, "decode(encode(a)) != a");
    assert_eq!(got.to_string(), "203.0.113.7:40444");

    Ok(())
}

#[test]
fn test_wire_addr_short_buffer() {
    let a = WireAddr::default();
    let mut buf = [0u8; ADDR_WIRE_LEN - 1];
    assert_eq!(a.encode(&mut buf), Err(Error::ErrUnexpectedEof));
    assert_eq!(WireAddr::decode(&buf), Err(Error::ErrUnexpectedEof));
}

#[test]
fn test_wire_addr_from_socket_addr() -> Result<()> {
    let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 9000);
    let a = WireAddr::from_socket_addr(&v4)?;
    assert_eq!(a.socket_addr(), v4);

    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000);
    assert_eq!(
        WireAddr::from_socket_addr(&v6),
        Err(Error::ErrIpv6NotSupported)
    );

    Ok(())
}
