//! Top of the store stack. Hands out exclusive in-memory handles and
//! guarantees that at most one live handle exists per block id across the
//! whole process: loading an id that is already open blocks until the open
//! handle is dropped, and removing an open id parks the remover until then.
//! Work on distinct ids proceeds concurrently.

use super::{BlockId, BlockStore, RemoveResult, TryCreateResult};
use crate::error::Result;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct Registry {
    /// Ids with a live handle.
    open: HashSet<BlockId>,
    /// Ids with a removal in progress; loads of these wait until the removal
    /// finished (and then see the block as gone).
    removing: HashSet<BlockId>,
}

pub struct ParallelAccessBlockStore<B: BlockStore> {
    base: B,
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl<B: BlockStore> ParallelAccessBlockStore<B> {
    pub fn new(base: B) -> Arc<Self> {
        Arc::new(Self {
            base,
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
        })
    }

    /// Blocks until `id` is neither open nor being removed, then marks it
    /// open for the calling thread.
    fn acquire(&self, id: &BlockId) {
        let mut registry = self.registry.lock().unwrap();
        while registry.open.contains(id) || registry.removing.contains(id) {
            registry = self.changed.wait(registry).unwrap();
        }
        registry.open.insert(*id);
    }

    fn release(&self, id: &BlockId) {
        let mut registry = self.registry.lock().unwrap();
        let was_open = registry.open.remove(id);
        assert!(was_open, "released block {id} that wasn't open");
        self.changed.notify_all();
    }

    pub fn load(self: &Arc<Self>, id: &BlockId) -> Result<Option<BlockHandle<B>>> {
        self.acquire(id);
        match self.base.load(id) {
            Ok(Some(data)) => Ok(Some(BlockHandle {
                store: Arc::clone(self),
                id: *id,
                data,
                dirty: false,
                discard: false,
            })),
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

    pub fn try_create(self: &Arc<Self>, id: &BlockId, data: &[u8]) -> Result<Option<BlockHandle<B>>> {
        self.acquire(id);
        match self.base.try_create(id, data) {
            Ok(TryCreateResult::Created) => Ok(Some(BlockHandle {
                store: Arc::clone(self),
                id: *id,
                data: data.to_vec(),
                dirty: false,
                discard: false,
            })),
            Ok(TryCreateResult::AlreadyExists) => {
                self.release(id);
                Ok(None)
            }
            Err(err) => {
                self.release(id);
                Err(err)
            }
        }
    }

    pub fn create(self: &Arc<Self>, data: &[u8]) -> Result<BlockHandle<B>> {
        loop {
            let id = BlockId::random();
            if let Some(handle) = self.try_create(&id, data)? {
                return Ok(handle);
            }
        }
    }

    /// Replaces the block's content, creating it if needed, and returns the
    /// handle to the new state.
    pub fn overwrite(self: &Arc<Self>, id: &BlockId, data: &[u8]) -> Result<BlockHandle<B>> {
        self.acquire(id);
        match self.base.store(id, data) {
            Ok(()) => Ok(BlockHandle {
                store: Arc::clone(self),
                id: *id,
                data: data.to_vec(),
                dirty: false,
                discard: false,
            }),
            Err(err) => {
                self.release(id);
                Err(err)
            }
        }
    }

    /// Removes by id. If a handle to the block is currently live, this
    /// blocks until it is dropped (its final flush completes first), and no
    /// new load can slip in between.
    pub fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        {
            let mut registry = self.registry.lock().unwrap();
            while registry.removing.contains(id) {
                registry = self.changed.wait(registry).unwrap();
            }
            registry.removing.insert(*id);
            while registry.open.contains(id) {
                debug!("remove of block {id} waits for its handle to be released");
                registry = self.changed.wait(registry).unwrap();
            }
        }
        let result = self.base.remove(id);
        let mut registry = self.registry.lock().unwrap();
        registry.removing.remove(id);
        self.changed.notify_all();
        result
    }

    /// Removes the block the caller holds a handle to, consuming the handle
    /// without flushing it.
    pub fn remove_handle(&self, mut handle: BlockHandle<B>) -> Result<()> {
        let id = handle.id;
        {
            let mut registry = self.registry.lock().unwrap();
            registry.removing.insert(id);
        }
        handle.discard = true;
        drop(handle);
        let result = self.base.remove(&id);
        let mut registry = self.registry.lock().unwrap();
        registry.removing.remove(&id);
        self.changed.notify_all();
        result.map(|_| ())
    }

    pub fn exists(&self, id: &BlockId) -> Result<bool> {
        self.base.exists(id)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    pub fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    pub fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        self.base.block_size_from_physical_block_size(physical)
    }

    pub fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        self.base.all_block_ids()
    }

    pub fn flush(&self) -> Result<()> {
        self.base.flush()
    }
}

/// Exclusive handle to one block's bytes. Mutations stay in the handle until
/// `flush` or drop writes them back through the cache; dropping the handle
/// releases the id for other threads.
pub struct BlockHandle<B: BlockStore> {
    store: Arc<ParallelAccessBlockStore<B>>,
    id: BlockId,
    data: Vec<u8>,
    dirty: bool,
    discard: bool,
}

impl<B: BlockStore> BlockHandle<B> {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn write(&mut self, source: &[u8], offset: usize) {
        let end = offset
            .checked_add(source.len())
            .expect("write range overflows");
        assert!(
            end <= self.data.len(),
            "write outside of block bounds: {}..{} in a block of {} bytes",
            offset,
            end,
            self.data.len()
        );
        self.data[offset..end].copy_from_slice(source);
        self.dirty = true;
    }

    /// Grows (zero-filling) or shrinks the block in place.
    pub fn resize(&mut self, new_size: usize) {
        self.data.resize(new_size, 0);
        self.dirty = true;
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.store.base.store(&self.id, &self.data)?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl<B: BlockStore> Drop for BlockHandle<B> {
    fn drop(&mut self) {
        if self.dirty && !self.discard {
            if let Err(err) = self.store.base.store(&self.id, &self.data) {
                warn!("failed to write back block {} on release: {err}", self.id);
            }
        }
        self.store.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::inmemory::InMemoryBlockStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn store() -> Arc<ParallelAccessBlockStore<InMemoryBlockStore>> {
        ParallelAccessBlockStore::new(InMemoryBlockStore::new())
    }

    #[test]
    fn create_load_roundtrip() {
        let store = store();
        let id = {
            let handle = store.create(b"data").unwrap();
            handle.id()
        };
        let handle = store.load(&id).unwrap().unwrap();
        assert_eq!(handle.data(), b"data");
    }

    #[test]
    fn load_of_absent_block_is_none_and_releases() {
        let store = store();
        let id = BlockId::random();
        assert!(store.load(&id).unwrap().is_none());
        // The id must not stay reserved.
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn writes_persist_on_drop() {
        let store = store();
        let id = {
            let mut handle = store.create(vec![0u8; 16].as_slice()).unwrap();
            handle.write(b"abcd", 4);
            handle.id()
        };
        let handle = store.load(&id).unwrap().unwrap();
        assert_eq!(&handle.data()[4..8], b"abcd");
    }

    #[test]
    fn resize_zero_fills() {
        let store = store();
        let id = {
            let mut handle = store.create(b"abc").unwrap();
            handle.resize(8);
            handle.id()
        };
        let handle = store.load(&id).unwrap().unwrap();
        assert_eq!(handle.data(), b"abc\0\0\0\0\0");
    }

    #[test]
    fn flush_establishes_visibility() {
        let store = store();
        let mut handle = store.create(b"old").unwrap();
        handle.resize(3);
        handle.write(b"new", 0);
        handle.flush().unwrap();
        let id = handle.id();
        drop(handle);
        assert_eq!(store.load(&id).unwrap().unwrap().data(), b"new");
    }

    #[test]
    fn second_load_waits_for_first_handle() {
        let store = store();
        let id = store.create(b"data").unwrap().id();

        let handle = store.load(&id).unwrap().unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let loader = {
            let store = Arc::clone(&store);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let _second = store.load(&id).unwrap().unwrap();
                assert!(
                    released.load(Ordering::SeqCst),
                    "second handle existed while the first was still live"
                );
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(handle);
        loader.join().unwrap();
    }

    #[test]
    fn distinct_ids_are_concurrent() {
        let store = store();
        let id_a = store.create(b"a").unwrap().id();
        let id_b = store.create(b"b").unwrap().id();

        let _handle_a = store.load(&id_a).unwrap().unwrap();
        // Must not block even though another handle is live.
        let handle_b = store.load(&id_b).unwrap().unwrap();
        assert_eq!(handle_b.data(), b"b");
    }

    #[test]
    fn remove_waits_for_live_handle() {
        let store = store();
        let id = store.create(b"data").unwrap().id();
        let handle = store.load(&id).unwrap().unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let remover = {
            let store = Arc::clone(&store);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                assert_eq!(store.remove(&id).unwrap(), RemoveResult::Removed);
                assert!(released.load(Ordering::SeqCst));
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(handle);
        remover.join().unwrap();
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn remove_by_handle() {
        let store = store();
        let handle = store.create(b"data").unwrap();
        let id = handle.id();
        store.remove_handle(handle).unwrap();
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn try_create_collision_releases() {
        let store = store();
        let id = store.create(b"data").unwrap().id();
        assert!(store.try_create(&id, b"other").unwrap().is_none());
        // Block is loadable again (id not stuck open).
        let handle = store.load(&id).unwrap().unwrap();
        assert_eq!(handle.data(), b"data");
    }
}
