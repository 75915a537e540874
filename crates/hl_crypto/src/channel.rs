//! Per-peer symmetric key table.
//!
//! Entries are `Arc<ChannelKey>` so an encryption that already captured a
//! key keeps using that snapshot even if the entry is overwritten or torn
//! down mid-call. The key bytes are zeroized when the last snapshot drops.

use std::collections::HashMap;
use std::sync::Arc;

use crate::kdf::ChannelKey;

#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<String, Arc<ChannelKey>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins. Returns true if an existing entry was replaced.
    pub fn insert(&mut self, peer_id: &str, key: ChannelKey) -> bool {
        self.channels.insert(peer_id.to_string(), Arc::new(key)).is_some()
    }

    pub fn snapshot(&self, peer_id: &str) -> Option<Arc<ChannelKey>> {
        self.channels.get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.channels.contains_key(peer_id)
    }

    pub fn remove(&mut self, peer_id: &str) -> bool {
        self.channels.remove(peer_id).is_some()
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.channels.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every entry. Returns how many channels were torn down.
    pub fn clear(&mut self) -> usize {
        let n = self.channels.len();
        self.channels.clear();
        n
    }
}
