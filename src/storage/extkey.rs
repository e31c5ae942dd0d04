//! Extended-key cache
//!
//! Cache of key bytes resolved from the overflow store, keyed by the blob id
//! that backs the slot. The tree core does not populate it, but it must
//! invalidate entries whenever a slot's backing blob is freed or overwritten,
//! so stale key bytes can never be served after the blob is gone.

use std::collections::HashMap;

use crate::types::BlobId;

#[derive(Default)]
pub struct ExtKeyCache {
    entries: HashMap<BlobId, Vec<u8>>,
}

impl ExtKeyCache {
    pub fn new() -> Self {
        ExtKeyCache {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, blob_id: BlobId, key: Vec<u8>) {
        self.entries.insert(blob_id, key);
    }

    pub fn get(&self, blob_id: BlobId) -> Option<&[u8]> {
        self.entries.get(&blob_id).map(|k| k.as_slice())
    }

    /// Invalidate the entry for a blob that was freed or overwritten.
    pub fn remove(&mut self, blob_id: BlobId) {
        self.entries.remove(&blob_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_invalidates() {
        let mut cache = ExtKeyCache::new();
        cache.insert(4096, b"a long key".to_vec());
        assert_eq!(cache.get(4096), Some(&b"a long key"[..]));
        cache.remove(4096);
        assert!(cache.get(4096).is_none());
        // removing an id that was never cached is fine
        cache.remove(8192);
        assert!(cache.is_empty());
    }
}
