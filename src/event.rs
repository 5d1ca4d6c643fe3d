/// Keyed Events
///
/// The unit of change flowing from a topic source to the grid. Every event
/// carries a key (typically a topic path) used both for coalescing and for
/// targeting a display row.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// Why a source ended a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeReason {
    /// The subscriber asked to stop
    Requested,
    /// A control client unsubscribed us
    Control,
    /// The topic was removed
    Removal,
    /// Permission to read the topic was withdrawn
    Authorization,
    Unknown,
}

/// A keyed change event
#[derive(Debug, Clone, PartialEq)]
pub enum KeyedEvent<K, V> {
    /// A new value for the key
    Update { key: K, value: V },

    /// The key is no longer being delivered
    Removed { key: K, reason: UnsubscribeReason },
}

impl<K, V> KeyedEvent<K, V> {
    pub fn update(key: K, value: V) -> Self {
        KeyedEvent::Update { key, value }
    }

    pub fn removed(key: K, reason: UnsubscribeReason) -> Self {
        KeyedEvent::Removed { key, reason }
    }

    /// Returns the key shared by all variants
    pub fn key(&self) -> &K {
        match self {
            KeyedEvent::Update { key, .. } => key,
            KeyedEvent::Removed { key, .. } => key,
        }
    }

    pub fn is_update(&self) -> bool {
        matches!(self, KeyedEvent::Update { .. })
    }
}

/// Last-value-wins collection of keyed entries.
///
/// Entries keep the position of their key's first insertion; a later insert
/// for the same key replaces the value in place. Used by `EventBatch` for
/// live events and by the replay feed when folding forwarded rows.
#[derive(Debug, Clone)]
pub struct Coalesced<K: Hash + Eq, T> {
    entries: IndexMap<K, T>,
}

impl<K: Hash + Eq, T> Coalesced<K, T> {
    pub fn new() -> Self {
        Coalesced {
            entries: IndexMap::new(),
        }
    }

    /// Insert or overwrite; returns the replaced entry if any
    pub fn insert(&mut self, key: K, entry: T) -> Option<T> {
        self.entries.insert(key, entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.values()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (K, T)> {
        self.entries.into_iter()
    }

    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.entries.into_values()
    }
}

impl<K: Hash + Eq, T> Default for Coalesced<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, T> FromIterator<(K, T)> for Coalesced<K, T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut result = Coalesced::new();
        for (key, entry) in iter {
            result.insert(key, entry);
        }
        result
    }
}
