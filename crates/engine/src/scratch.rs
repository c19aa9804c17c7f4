// SPDX-License-Identifier: Apache-2.0

//! Scratch storage.
//!
//! A process-wide key–value map guests use to pass state between requests.
//! Keys hash to one of a fixed set of buckets, each behind its own lock, so
//! concurrent sandboxes on different keys rarely contend.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const BUCKET_COUNT: usize = 256;

/// The process-wide scratch store.
pub struct ScratchStorage {
    buckets: Vec<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Default for ScratchStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn bucket(&self, key: &[u8]) -> &RwLock<HashMap<Vec<u8>, Vec<u8>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % BUCKET_COUNT]
    }

    /// Copies out the value under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.bucket(key).read().get(key).cloned()
    }

    /// Inserts `value` only when `key` is vacant. Returns false when the key
    /// already existed.
    pub fn set(&self, key: &[u8], value: &[u8]) -> bool {
        let mut bucket = self.bucket(key).write();
        if bucket.contains_key(key) {
            return false;
        }
        let _ = bucket.insert(key.to_vec(), value.to_vec());
        true
    }

    /// Inserts or replaces the value under `key`.
    pub fn upsert(&self, key: &[u8], value: &[u8]) {
        let _ = self.bucket(key).write().insert(key.to_vec(), value.to_vec());
    }

    /// Removes `key`. Returns false when it was absent.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.bucket(key).write().remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_insert_only_and_upsert_replaces() {
        let store = ScratchStorage::new();
        assert!(store.set(b"k", b"v1"));
        assert!(!store.set(b"k", b"v2"));
        assert_eq!(store.get(b"k").as_deref(), Some(&b"v1"[..]));
        store.upsert(b"k", b"v2");
        assert_eq!(store.get(b"k").as_deref(), Some(&b"v2"[..]));
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn keys_spread_across_buckets_independently() {
        let store = ScratchStorage::new();
        for i in 0..1000u32 {
            store.upsert(&i.to_le_bytes(), &i.to_be_bytes());
        }
        for i in 0..1000u32 {
            assert_eq!(
                store.get(&i.to_le_bytes()).as_deref(),
                Some(&i.to_be_bytes()[..])
            );
        }
    }
}
