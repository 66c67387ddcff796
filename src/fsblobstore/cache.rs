//! Small LRU of recently released fs blobs. Keeps their parsed state (most
//! importantly directory entry lists) around so a stat-readdir-stat sequence
//! doesn't re-read and re-parse the same blob over and over.

use super::FsBlob;
use crate::blobstore::BlobId;
use crate::blockstore::BlockStore;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const CAPACITY: usize = 50;

pub struct BlobCache<B: BlockStore> {
    cache: Mutex<LruCache<BlobId, FsBlob<B>>>,
}

impl<B: BlockStore> BlobCache<B> {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CAPACITY).unwrap())),
        }
    }

    /// Takes the blob out of the cache if present.
    pub fn pop(&self, id: &BlobId) -> Option<FsBlob<B>> {
        self.cache.lock().unwrap().pop(id)
    }

    /// Stores a released blob. An evicted victim is dropped here, which
    /// writes back its pending changes.
    pub fn push(&self, id: BlobId, blob: FsBlob<B>) {
        self.cache.lock().unwrap().push(id, blob);
    }

    /// Drops everything in the cache, flushing pending changes.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl<B: BlockStore> Default for BlobCache<B> {
    fn default() -> Self {
        Self::new()
    }
}
