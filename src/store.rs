//! Timestamped key-value store with last-write-wins semantics.
//!
//! Every accepted mutation rebuilds the attached Merkle index from a snapshot
//! taken under the store lock, so by the time a writer returns, the root
//! reflects the write. The index never calls back into the store; the store
//! hands it the snapshot, which keeps the locking one-directional.

use crate::merkle::MerkleIndex;
use crate::types::{SnapshotEntry, Timestamp, ValueRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

struct StoreState {
    records: BTreeMap<String, ValueRecord>,
    index: Option<Arc<MerkleIndex>>,
}

impl StoreState {
    fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.records
            .iter()
            .map(|(key, rec)| (key.clone(), rec.value.clone(), rec.timestamp))
            .collect()
    }

    fn rebuild_index(&self) {
        if let Some(index) = &self.index {
            index.rebuild(&self.snapshot());
        }
    }
}

/// In-memory LWW map. All operations serialize on a single lock; writes hold
/// it across the index rebuild so no reader can observe a root that lags the
/// latest accepted write.
pub struct KvStore {
    state: RwLock<StoreState>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                records: BTreeMap::new(),
                index: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().expect("Failed to lock store state")
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().expect("Failed to lock store state")
    }

    /// Stored value, or the empty string when absent.
    pub fn get(&self, key: &str) -> String {
        self.read()
            .records
            .get(key)
            .map(|rec| rec.value.clone())
            .unwrap_or_default()
    }

    /// Value and timestamp; `("", 0)` when absent.
    pub fn get_with_ts(&self, key: &str) -> (String, Timestamp) {
        self.read()
            .records
            .get(key)
            .map(|rec| (rec.value.clone(), rec.timestamp))
            .unwrap_or_default()
    }

    /// LWW write. Accepted iff the key is absent or `timestamp` is at least
    /// the stored one; equal timestamps accept so a replayed write is not
    /// rejected. Returns whether the write was applied.
    pub fn set(&self, key: &str, value: &str, timestamp: Timestamp) -> bool {
        let mut state = self.write();
        if let Some(current) = state.records.get(key) {
            if timestamp < current.timestamp {
                debug!(key, timestamp, current = current.timestamp, "stale set rejected");
                return false;
            }
        }
        state
            .records
            .insert(key.to_string(), ValueRecord::new(value, timestamp));
        state.rebuild_index();
        true
    }

    /// LWW delete. Accepted iff the key is present and `timestamp` is at
    /// least the stored one.
    pub fn delete(&self, key: &str, timestamp: Timestamp) -> bool {
        let mut state = self.write();
        let accepted = match state.records.get(key) {
            Some(current) => timestamp >= current.timestamp,
            None => return false,
        };
        if !accepted {
            debug!(key, timestamp, "stale delete rejected");
            return false;
        }
        state.records.remove(key);
        state.rebuild_index();
        true
    }

    /// Consistent view of every record. Order is the map's key order, which
    /// is stable across the life of a single rebuild.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.read().snapshot()
    }

    /// Key-to-timestamp map, as served by `GET_ALL` and consumed by the
    /// full-state exchange.
    pub fn key_timestamps(&self) -> HashMap<String, Timestamp> {
        self.read()
            .records
            .iter()
            .map(|(key, rec)| (key.clone(), rec.timestamp))
            .collect()
    }

    /// Registers the Merkle index and rebuilds it from the current state.
    pub fn attach_index(&self, index: Arc<MerkleIndex>) {
        let mut state = self.write();
        state.index = Some(index);
        state.rebuild_index();
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }
}
