//! Connection registries
//!
//! Concurrent maps from a connection identity to its adapter. Values are
//! cloned out on lookup (adapters are `Arc`s), so a shard lock is never held
//! while an adapter runs.

use std::fmt::Display;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ConnError;

/// Identity → adapter map
#[derive(Debug)]
pub struct ConnectionRegistry<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> ConnectionRegistry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Look up an adapter
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Register an adapter under a new identity
    ///
    /// # Errors
    ///
    /// Returns `ConnError::DuplicateIdentity` if the identity is already
    /// registered; the existing entry is left untouched.
    pub fn insert(&self, key: K, value: V) -> Result<(), ConnError> {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => Err(ConnError::DuplicateIdentity(entry.key().to_string())),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Remove an identity, returning the adapter if it was present
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Remove an identity only if its adapter satisfies `pred`
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, value| pred(value))
            .map(|(_, value)| value)
    }

    /// True if the identity is registered
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of registered identities
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every adapter
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<K, V> Default for ConnectionRegistry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
