//! Per-blob-id exclusivity, mirroring the block-level parallel access layer:
//! at most one live [`FsBlobRef`] per blob id across the process, loads of an
//! open id block until release, removes park until the last reference is
//! gone. Released blobs land in the [`BlobCache`] instead of being dropped.

use super::cache::BlobCache;
use super::{FsBlob, FsBlobStore, Metadata};
use crate::blobstore::BlobId;
use crate::blockstore::parallel::ParallelAccessBlockStore;
use crate::blockstore::BlockStore;
use crate::error::Result;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct Registry {
    open: HashSet<BlobId>,
    removing: HashSet<BlobId>,
}

pub struct ParallelAccessFsBlobStore<B: BlockStore> {
    base: FsBlobStore<B>,
    cache: BlobCache<B>,
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl<B: BlockStore> ParallelAccessFsBlobStore<B> {
    pub fn new(
        store: Arc<ParallelAccessBlockStore<B>>,
        physical_block_size_bytes: u64,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            base: FsBlobStore::new(store, physical_block_size_bytes)?,
            cache: BlobCache::new(),
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
        }))
    }

    fn acquire(&self, id: &BlobId) {
        let mut registry = self.registry.lock().unwrap();
        while registry.open.contains(id) || registry.removing.contains(id) {
            registry = self.changed.wait(registry).unwrap();
        }
        registry.open.insert(*id);
    }

    fn release(&self, id: &BlobId) {
        let mut registry = self.registry.lock().unwrap();
        let was_open = registry.open.remove(id);
        assert!(was_open, "released blob {id} that wasn't open");
        self.changed.notify_all();
    }

    fn make_ref(self: &Arc<Self>, blob: FsBlob<B>) -> FsBlobRef<B> {
        FsBlobRef {
            store: Arc::clone(self),
            id: blob.blob_id(),
            blob: Some(blob),
        }
    }

    pub fn load(self: &Arc<Self>, id: &BlobId) -> Result<Option<FsBlobRef<B>>> {
        self.acquire(id);
        if let Some(blob) = self.cache.pop(id) {
            return Ok(Some(self.make_ref(blob)));
        }
        match self.base.load(id) {
            Ok(Some(blob)) => Ok(Some(self.make_ref(blob))),
            Ok(None) => {
                self.release(id);
                Ok(None)
            }
            Err(err) => {
                self.release(id);
                Err(err)
            }
        }
    }

    pub fn create_file_blob(
        self: &Arc<Self>,
        parent: &BlobId,
        metadata: Metadata,
    ) -> Result<FsBlobRef<B>> {
        let blob = self.base.create_file_blob(parent, metadata)?;
        self.register_created(blob.blob_id());
        Ok(self.make_ref(FsBlob::File(blob)))
    }

    pub fn create_dir_blob(
        self: &Arc<Self>,
        parent: &BlobId,
        metadata: Metadata,
    ) -> Result<FsBlobRef<B>> {
        let blob = self.base.create_dir_blob(parent, metadata)?;
        self.register_created(blob.blob_id());
        Ok(self.make_ref(FsBlob::Dir(blob)))
    }

    pub fn create_symlink_blob(
        self: &Arc<Self>,
        target: &str,
        parent: &BlobId,
        metadata: Metadata,
    ) -> Result<FsBlobRef<B>> {
        let blob = self.base.create_symlink_blob(target, parent, metadata)?;
        self.register_created(blob.blob_id());
        Ok(self.make_ref(FsBlob::Symlink(blob)))
    }

    fn register_created(&self, id: BlobId) {
        let mut registry = self.registry.lock().unwrap();
        let inserted = registry.open.insert(id);
        assert!(inserted, "freshly created blob id {id} was already open");
    }

    /// Removes the blob the caller holds. Consumes the reference; pending
    /// directory-entry changes are discarded, not written back.
    pub fn remove(&self, mut blob_ref: FsBlobRef<B>) -> Result<()> {
        let id = blob_ref.id;
        {
            let mut registry = self.registry.lock().unwrap();
            registry.removing.insert(id);
        }
        let mut blob = blob_ref.take_inner();
        blob.discard_changes();
        drop(blob);
        drop(blob_ref); // releases the open entry
        let result = self.base.remove_by_id(&id);
        let mut registry = self.registry.lock().unwrap();
        registry.removing.remove(&id);
        self.changed.notify_all();
        result
    }

    /// Removes by id, waiting for a live reference to be released first.
    pub fn remove_by_id(&self, id: &BlobId) -> Result<()> {
        {
            let mut registry = self.registry.lock().unwrap();
            while registry.removing.contains(id) {
                registry = self.changed.wait(registry).unwrap();
            }
            registry.removing.insert(*id);
            while registry.open.contains(id) {
                registry = self.changed.wait(registry).unwrap();
            }
        }
        if let Some(mut cached) = self.cache.pop(id) {
            cached.discard_changes();
        }
        let result = self.base.remove_by_id(id);
        let mut registry = self.registry.lock().unwrap();
        registry.removing.remove(id);
        self.changed.notify_all();
        result
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.base.estimate_space_for_num_blocks_left()
    }

    pub fn virtual_block_size_bytes(&self) -> u64 {
        self.base.virtual_block_size_bytes()
    }

    /// Writes back everything buffered above the block store, then flushes
    /// the block store stack itself.
    pub fn flush(&self) -> Result<()> {
        self.cache.clear();
        self.base.flush()
    }
}

/// Exclusive reference to an open fs blob. Dereferences to [`FsBlob`];
/// dropping it parks the blob in the cache and wakes waiting loaders.
pub struct FsBlobRef<B: BlockStore> {
    store: Arc<ParallelAccessFsBlobStore<B>>,
    id: BlobId,
    blob: Option<FsBlob<B>>,
}

impl<B: BlockStore> FsBlobRef<B> {
    pub fn blob_id(&self) -> BlobId {
        self.id
    }

    fn take_inner(&mut self) -> FsBlob<B> {
        self.blob.take().expect("blob already taken")
    }
}

impl<B: BlockStore> Deref for FsBlobRef<B> {
    type Target = FsBlob<B>;

    fn deref(&self) -> &FsBlob<B> {
        self.blob.as_ref().expect("blob already taken")
    }
}

impl<B: BlockStore> DerefMut for FsBlobRef<B> {
    fn deref_mut(&mut self) -> &mut FsBlob<B> {
        self.blob.as_mut().expect("blob already taken")
    }
}

impl<B: BlockStore> Drop for FsBlobRef<B> {
    fn drop(&mut self) {
        if let Some(blob) = self.blob.take() {
            self.store.cache.push(self.id, blob);
        }
        self.store.release(&self.id);
    }
}
