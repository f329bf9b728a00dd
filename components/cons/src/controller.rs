//! Client collection
//!
//! The controller owns every live client. Iteration is in creation order,
//! which the lookups rely on: the first match wins, and index assignment
//! looks at the most recent client sharing a tag.

use std::collections::BTreeMap;

use crate::client::{Client, ClientId, Key};

/// Owner of all clients
#[derive(Debug, Default)]
pub struct Controller {
    clients: BTreeMap<ClientId, Client>,
    next_id: u64,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the id of the next client
    pub fn allocate_id(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, client: Client) {
        self.clients.insert(client.id(), client);
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn find_by_key(&self, key: Key) -> Option<&Client> {
        self.iter().find(|c| c.matches_key(key))
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<&Client> {
        self.iter().find(|c| c.matches_tag(tag))
    }

    /// Most recently created client tagged `tag`
    pub fn last_with_tag(&self, tag: &str) -> Option<&Client> {
        self.clients.values().rev().find(|c| c.matches_tag(tag))
    }

    /// Resolve `tag` or `tag:N`
    pub fn find_by_name(&self, name: &str) -> Option<&Client> {
        self.iter().find(|c| c.matches_name(name))
    }

    /// Index a new client tagged `tag` gets
    pub fn next_idx(&self, tag: &str) -> u32 {
        self.last_with_tag(tag).map_or(0, |c| c.idx() + 1)
    }
}
