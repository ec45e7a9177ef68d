//! Versioned key/value store
//!
//! Gossip messages carry only `(key, version)` pairs; full values travel
//! only when the receiver declares interest. That bounds per-round
//! bandwidth to one version per key, so the store's job is to answer
//! "would I benefit from receiving this version?" cheaply.

use grapevine_core::{Version, VersionedValue};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

/// In-memory versioned store.
pub struct Store {
    entries: RwLock<HashMap<String, VersionedValue>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Local write: bump the version and overwrite the entry.
    pub fn set(&self, key: &str, bytes: Vec<u8>) -> Version {
        let mut entries = self.entries.write();
        let version = match entries.get(key) {
            Some(existing) => existing.version.next(&bytes),
            None => Version::first(&bytes),
        };
        entries.insert(key.to_string(), VersionedValue { bytes, version });
        version
    }

    /// Remote write: accept only if the incoming version is strictly newer
    /// than what is stored. Returns whether the entry was taken.
    pub fn set_unique(&self, key: &str, incoming: VersionedValue) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) if incoming.version <= existing.version => false,
            _ => {
                entries.insert(key.to_string(), incoming);
                true
            }
        }
    }

    /// Current value, or absence.
    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.entries.read().get(key).cloned()
    }

    /// Would this store benefit from receiving `(key, incoming)`?
    ///
    /// True when the key is absent (a key we lack is always of interest) or
    /// the stored version is older.
    pub fn interest(&self, key: &str, incoming: &Version) -> bool {
        match self.entries.read().get(key) {
            Some(existing) => existing.version < *incoming,
            None => true,
        }
    }

    /// A `(key, version)` pair chosen uniformly from the keyset.
    pub fn random_pair(&self) -> Option<(String, Version)> {
        let entries = self.entries.read();
        if entries.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..entries.len());
        entries
            .iter()
            .nth(index)
            .map(|(key, value)| (key.clone(), value.version))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
