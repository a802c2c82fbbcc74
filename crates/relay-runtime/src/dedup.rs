use std::collections::HashMap;

use relay_protocol::StorageKey;
use tracing::{debug, warn};

use crate::action::Action;

#[derive(Debug)]
struct DedupEntry {
    primary: Action,
    duplicates: Vec<Action>,
}

/// In-flight storable actions by storage key, with the identical actions
/// waiting on each.
#[derive(Debug, Default)]
pub struct DedupStore {
    entries: HashMap<StorageKey, DedupEntry>,
}

impl DedupStore {
    /// Returns true when `action` was folded into a live request for the same
    /// key. With `sending` set, an action that is not a duplicate becomes the
    /// primary for its key; lookup-only calls never register a primary.
    pub fn dedupe(&mut self, action: &Action, sending: bool) -> bool {
        if !action.is_storable() {
            return false;
        }
        let key = action.storage_key();
        let mut carried = Vec::new();

        if let Some(entry) = self.entries.get_mut(key) {
            if entry.primary.id() == action.id() {
                return false;
            }
            if entry.primary.state().is_live() {
                entry.duplicates.push(action.clone());
                debug!(
                    action_id = %action.id(),
                    primary = %entry.primary.id(),
                    key = %key,
                    "action folded into in-flight request"
                );
                return true;
            }
            if !sending {
                return false;
            }
            warn!(
                key = %key,
                primary = %entry.primary.id(),
                state = entry.primary.state().as_str(),
                "dedup entry outlived its primary; discarding"
            );
            if let Some(stale) = self.entries.remove(key) {
                carried = stale.duplicates;
            }
        }

        if sending {
            self.entries.insert(
                key.clone(),
                DedupEntry {
                    primary: action.clone(),
                    duplicates: carried,
                },
            );
        }
        false
    }

    /// Detach and return the duplicates of `action` if it is a primary.
    pub fn take_duplicates(&mut self, action: &Action) -> Vec<Action> {
        let key = action.storage_key();
        match self.entries.get(key) {
            Some(entry) if entry.primary.id() == action.id() => self
                .entries
                .remove(key)
                .map(|entry| entry.duplicates)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
