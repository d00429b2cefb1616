
use std::collections::VecDeque;

use tokio::time::Duration;

use super::PairHandle;

// Interval between deliveries of the same seq=0 packet.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

// Deliveries after the first before the server gives up on an ACK.
pub const MAX_RETRIES: u8 = 5;

/// `RetransmitQueue` is the FIFO of pairs awaiting an ACK for their one
/// outstanding seq=0 PEER_INFO. Each pair appears at most once; since every
/// (re-)enqueue stamps the current time on the pair, the queue is ordered
/// by send time, oldest at the front.
#[derive(Default)]
pub struct RetransmitQueue {
    queue: VecDeque<PairHandle>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        RetransmitQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, handle: PairHandle) -> bool {
        self.queue.contains(&handle)
    }

    /// Appends `handle` at the tail, displacing any earlier entry for the
    /// same pair: one outstanding seq=0 packet per pair.
    pub fn enqueue(&mut self, handle: PairHandle) {
        self.remove(handle);
        self.queue.push_back(handle);
    }

    /// Drops the pair's entry, if any. Called on ACK and on release.
    pub fn remove(&mut self, handle: PairHandle) {
        self.queue.retain(|&h| h != handle);
    }

    pub fn front(&self) -> Option<PairHandle> {
        self.queue.front().copied()
    }

    pub fn pop_front(&mut self) -> Option<PairHandle> {
        self.queue.pop_front()
    }
}
