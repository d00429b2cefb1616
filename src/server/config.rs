use crate::error::*;
use crate::pairing::MAX_PAIRS;
use crate::presence::MAX_CLIENTS;

/// `ServerConfig` configures a rendezvous server before any socket work.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Main port, bound as TCP (relay signaling) and UDP (compact
    /// signaling) simultaneously. 0 asks the OS for ephemeral ports,
    /// which only makes sense in tests.
    pub port: u16,
    /// Secondary UDP port for NAT behavior probing; 0 disables it.
    pub probe_port: u16,
    /// When set, REGISTER_ACK advertises that this server relays data
    /// packets for pairs whose direct paths fail.
    pub relay_available: bool,
    /// Pair table capacity.
    pub max_pairs: usize,
    /// Client table capacity.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8888,
            probe_port: 0,
            relay_available: false,
            max_pairs: MAX_PAIRS,
            max_clients: MAX_CLIENTS,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.probe_port != 0 && self.probe_port == self.port {
            return Err(Error::ErrProbePortConflict);
        }
        Ok(())
    }
}
