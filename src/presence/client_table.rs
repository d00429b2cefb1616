
use tokio::time::{Duration, Instant};

use super::*;
use crate::error::*;

struct Slot {
    generation: u32,
    client: Option<Client>,
}

/// `ClientTable` holds relay-mode clients in a fixed slot arena. Lookups
/// scan the arena; the table is small and bounded. At most one online slot
/// exists per name, plus at most one offline placeholder for the same name
/// in the window between a CONNECT to an absent target and that target's
/// LOGIN.
pub struct ClientTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ClientTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                generation: 0,
                client: None,
            });
            free.push(i as u32);
        }
        free.reverse();

        ClientTable { slots, free }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: ClientHandle) -> Option<&Client> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.client.as_ref()
    }

    pub fn get_mut(&mut self, handle: ClientHandle) -> Option<&mut Client> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.client.as_mut()
    }

    /// Allocates a slot for a freshly accepted connection. The name stays
    /// empty until LOGIN.
    pub fn accept(&mut self, now: Instant) -> Result<ClientHandle> {
        self.allocate(Client::new(true, PeerId::default(), now))
    }

    /// Allocates an offline placeholder awaiting `name`'s login.
    pub fn placeholder(&mut self, name: PeerId, now: Instant) -> Result<ClientHandle> {
        self.allocate(Client::new(false, name, now))
    }

    fn allocate(&mut self, client: Client) -> Result<ClientHandle> {
        let index = self.free.pop().ok_or(Error::ErrClientTableFull)?;
        let slot = &mut self.slots[index as usize];
        slot.client = Some(client);
        Ok(ClientHandle {
            index,
            generation: slot.generation,
        })
    }

    pub fn release(&mut self, handle: ClientHandle) -> Option<Client> {
        self.get(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        let client = slot.client.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(client)
    }

    pub fn find_online(&self, name: &PeerId) -> Option<ClientHandle> {
        self.find(|c| c.online && c.name == *name)
    }

    pub fn find_placeholder(&self, name: &PeerId) -> Option<ClientHandle> {
        self.find(|c| !c.online && c.name == *name)
    }

    fn find(&self, pred: impl Fn(&Client) -> bool) -> Option<ClientHandle> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            s.client.as_ref().filter(|c| pred(c)).map(|_| ClientHandle {
                index: i as u32,
                generation: s.generation,
            })
        })
    }

    /// All live handles, in slot order.
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.client.is_some())
            .map(|(i, s)| ClientHandle {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Handles of clients idle past `ttl` at `now`.
    pub fn expired(&self, now: Instant, ttl: Duration) -> Vec<ClientHandle> {
        self.handles()
            .into_iter()
            .filter(|&h| {
                self.get(h)
                    .map(|c| now.duration_since(c.last_active) > ttl)
                    .unwrap_or(false)
            })
            .collect()
    }
}
