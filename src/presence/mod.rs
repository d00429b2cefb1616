pub mod client_table;

use std::fmt;

use tokio::time::{Duration, Instant};

use crate::proto::relay::RelayCandidate;
use crate::proto::PeerId;

// Default client table capacity; a full table refuses new connections.
pub const MAX_CLIENTS: usize = 128;

// A client silent for this long is closed by the cleanup pass.
pub const CLIENT_TTL: Duration = Duration::from_secs(60);

// Offline candidate cache cap per client.
pub const MAX_PENDING_CANDIDATES: usize = 32;

/// `ClientHandle` is a generation-tagged index into the client table. The
/// event loop uses it to route frames and map write halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}.{}", self.index, self.generation)
    }
}

/// `Client` is one relay-mode slot: either a live TCP connection, or an
/// offline placeholder holding candidates deposited for a name that has
/// not logged in yet.
#[derive(Debug, Clone)]
pub struct Client {
    /// Empty until LOGIN for live connections; always set on placeholders.
    pub name: PeerId,
    pub online: bool,
    pub last_active: Instant,
    /// The peer this client is currently being forwarded through; decides
    /// OFFER versus FORWARD for the next CONNECT.
    pub current_peer: Option<PeerId>,
    /// Who deposited the pending candidates below.
    pub pending_sender: Option<PeerId>,
    pub pending: Vec<RelayCandidate>,
}

impl Client {
    pub(crate) fn new(online: bool, name: PeerId, now: Instant) -> Self {
        Client {
            name,
            online,
            last_active: now,
            current_peer: None,
            pending_sender: None,
            pending: vec![],
        }
    }

    pub fn is_placeholder(&self) -> bool {
        !self.online
    }
}
