//! In-memory element map with last-write-wins merge.
//!
//! This is the only structure written by more than one task: callers via
//! `QSet::set` and the replication listener. Reads share the lock, merges
//! take it exclusively.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::timestamp::Timestamp;

/// Marshaled member -> highest timestamp observed for it.
///
/// `BTreeMap` keeps `keys()` deterministic for a fixed set of operations.
#[derive(Debug, Default)]
pub struct ElementMap {
    entries: RwLock<BTreeMap<String, Timestamp>>,
}

impl ElementMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Timestamp>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Timestamp>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every entry.
    pub fn init(&self) {
        self.write().clear();
    }

    /// Merges `ts` for `key`. Returns `true` if the map changed.
    ///
    /// An existing entry is only replaced by a strictly newer timestamp, so
    /// replays and out-of-order deliveries are no-ops.
    pub fn set(&self, key: &str, ts: Timestamp) -> bool {
        let mut entries = self.write();
        match entries.get_mut(key) {
            Some(current) if *current >= ts => false,
            Some(current) => {
                *current = ts;
                true
            }
            None => {
                entries.insert(key.to_string(), ts);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Timestamp> {
        self.read().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}
