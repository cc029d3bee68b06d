//! Presence state shared by the clients of one document
//!
//! Each client owns one entry, identified by a numeric client id and
//! versioned by a clock that only moves forward. An update carries
//! `(client_id, clock, state)` triples; a `null` state removes the entry.
//! An incoming entry wins when its clock is newer, or when it is a removal at
//! the same clock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::SyncResult;

pub type ClientId = u64;

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    client_id: ClientId,
    clock: u32,
    /// JSON text, `"null"` for a removal
    state: String,
}

/// Client ids touched by one update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched client, for re-broadcast
    pub fn all(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Presence states of every client known to a session
#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<ClientId, Json>,
    /// Last clock seen per client; outlives removal so stale entries lose
    clocks: HashMap<ClientId, u32>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> &HashMap<ClientId, Json> {
        &self.states
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.states.keys().copied().collect()
    }

    pub fn state(&self, client: ClientId) -> Option<&Json> {
        self.states.get(&client)
    }

    /// Merge an encoded update
    pub fn apply_update(&mut self, bytes: &[u8]) -> SyncResult<AwarenessChanges> {
        let entries: Vec<WireEntry> = postcard::from_bytes(bytes)?;
        let mut changes = AwarenessChanges::default();

        for entry in entries {
            let state: Json = serde_json::from_str(&entry.state)?;
            let current_clock = self.clocks.get(&entry.client_id).copied().unwrap_or(0);
            let known = self.states.contains_key(&entry.client_id);
            let newer = current_clock < entry.clock;
            let same_clock_removal = current_clock == entry.clock && state.is_null() && known;
            if !(newer || same_clock_removal) {
                continue;
            }

            self.clocks.insert(entry.client_id, entry.clock);
            if state.is_null() {
                if self.states.remove(&entry.client_id).is_some() {
                    changes.removed.push(entry.client_id);
                }
            } else if self.states.insert(entry.client_id, state).is_some() {
                changes.updated.push(entry.client_id);
            } else {
                changes.added.push(entry.client_id);
            }
        }
        Ok(changes)
    }

    /// Encode the current entries of `clients`
    ///
    /// Clients never seen are skipped; removed clients encode as removals.
    pub fn encode_update(&self, clients: &[ClientId]) -> SyncResult<Vec<u8>> {
        let mut entries = Vec::with_capacity(clients.len());
        for client in clients {
            let Some(clock) = self.clocks.get(client) else {
                continue;
            };
            let state = match self.states.get(client) {
                Some(state) => serde_json::to_string(state)?,
                None => "null".to_string(),
            };
            entries.push(WireEntry {
                client_id: *client,
                clock: *clock,
                state,
            });
        }
        Ok(postcard::to_allocvec(&entries)?)
    }

    /// Drop the entries of `clients`, bumping their clocks
    ///
    /// Returns the clients that were actually present.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        let mut removed = Vec::new();
        for client in clients {
            if self.states.remove(client).is_some() {
                *self.clocks.entry(*client).or_default() += 1;
                removed.push(*client);
            }
        }
        removed
    }

    /// Encode a fresh local state for `client`, as a client would send it
    pub fn encode_state(client: ClientId, clock: u32, state: &Json) -> SyncResult<Vec<u8>> {
        let entries = vec![WireEntry {
            client_id: client,
            clock,
            state: serde_json::to_string(state)?,
        }];
        Ok(postcard::to_allocvec(&entries)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_update_remove() {
        let mut awareness = Awareness::new();

        let add = Awareness::encode_state(1, 1, &json!({"user": "ada"})).unwrap();
        let changes = awareness.apply_update(&add).unwrap();
        assert_eq!(changes.added, vec![1]);

        let update = Awareness::encode_state(1, 2, &json!({"user": "ada", "cursor": 4})).unwrap();
        let changes = awareness.apply_update(&update).unwrap();
        assert_eq!(changes.updated, vec![1]);

        let remove = Awareness::encode_state(1, 2, &Json::Null).unwrap();
        let changes = awareness.apply_update(&remove).unwrap();
        assert_eq!(changes.removed, vec![1]);
        assert!(awareness.states().is_empty());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut awareness = Awareness::new();
        awareness
            .apply_update(&Awareness::encode_state(7, 5, &json!({"v": 5})).unwrap())
            .unwrap();
        let changes = awareness
            .apply_update(&Awareness::encode_state(7, 4, &json!({"v": 4})).unwrap())
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(awareness.state(7), Some(&json!({"v": 5})));
    }

    #[test]
    fn test_remove_states_encodes_removal() {
        let mut awareness = Awareness::new();
        awareness
            .apply_update(&Awareness::encode_state(3, 1, &json!({"name": "x"})).unwrap())
            .unwrap();

        let removed = awareness.remove_states(&[3, 99]);
        assert_eq!(removed, vec![3]);

        let bytes = awareness.encode_update(&removed).unwrap();
        let mut peer = Awareness::new();
        peer.apply_update(&Awareness::encode_state(3, 1, &json!({"name": "x"})).unwrap())
            .unwrap();
        let changes = peer.apply_update(&bytes).unwrap();
        assert_eq!(changes.removed, vec![3]);
    }

    #[test]
    fn test_encode_skips_unknown_clients() {
        let awareness = Awareness::new();
        let bytes = awareness.encode_update(&[1, 2]).unwrap();
        let mut peer = Awareness::new();
        assert!(peer.apply_update(&bytes).unwrap().is_empty());
    }
}
