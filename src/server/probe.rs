
use std::net::SocketAddr;

use crate::proto::addr::WireAddr;
use crate::proto::compact::{self, NatProbeAck};
use crate::proto::NAT_PROBE;

/// Answers a datagram on the probe port: a NAT_PROBE gets back the source
/// endpoint the server saw, under the request's sequence number. Anything
/// else is ignored. No state is kept; the client compares the mapping
/// reported here with the one on the main port to classify its NAT.
pub fn handle_probe(src: SocketAddr, data: &[u8]) -> Option<Vec<u8>> {
    let (header, _) = compact::split(data).ok()?;
    if header.typ != NAT_PROBE {
        log::debug!("ignoring {} on the probe port from {src}", header.typ);
        return None;
    }

    let public = match WireAddr::from_socket_addr(&src) {
        Ok(a) => a,
        Err(err) => {
            log::debug!("ignoring probe from {src}: {err}");
            return None;
        }
    };

    log::debug!("probe from {src}");
    Some(NatProbeAck { public }.encode(header.seq))
}
