//! Bounded write-back cache. Keeps the 1000 most recently used blocks in
//! memory, buffers writes, and retires dirty entries either on eviction, on
//! explicit flush, or via a background thread once they have been dirty for
//! longer than a second.

use super::{BlockId, BlockStore, RemoveResult, TryCreateResult};
use crate::error::Result;
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const CAPACITY: usize = 1000;
const MAX_DIRTY_LIFETIME: Duration = Duration::from_secs(1);
const FLUSH_TICK: Duration = Duration::from_millis(500);

struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
    dirty_since: Option<Instant>,
    last_use: u64,
    /// False while the block only exists in the cache (created but never
    /// flushed). Needed to keep `num_blocks` and enumeration exact.
    exists_in_base: bool,
    /// Bumped on every write; lets the background flusher detect that an
    /// entry changed again while it was being written out.
    generation: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<BlockId, CacheEntry>,
    use_counter: u64,
}

impl CacheState {
    fn touch(&mut self, id: &BlockId) {
        self.use_counter += 1;
        let counter = self.use_counter;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_use = counter;
        }
    }
}

struct Inner<B> {
    base: B,
    cache: Mutex<CacheState>,
    stopped: Mutex<bool>,
    stop_condition: Condvar,
}

impl<B: BlockStore> Inner<B> {
    fn insert(&self, state: &mut CacheState, id: BlockId, entry: CacheEntry) -> Result<()> {
        state.entries.insert(id, entry);
        self.evict_lru(state)
    }

    fn evict_lru(&self, state: &mut CacheState) -> Result<()> {
        while state.entries.len() > CAPACITY {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_use)
                .map(|(id, _)| *id)
                .expect("cache over capacity but empty");
            let entry = state.entries.remove(&victim).unwrap();
            if entry.dirty {
                self.base.store(&victim, &entry.data)?;
            }
        }
        Ok(())
    }

    /// Writes out all entries that have been dirty for longer than
    /// `MAX_DIRTY_LIFETIME`. Failed writes stay dirty and are retried on the
    /// next tick.
    fn flush_old_entries(&self) {
        let now = Instant::now();
        let expired: Vec<(BlockId, Vec<u8>, u64)> = {
            let state = self.cache.lock().unwrap();
            state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .dirty_since
                        .is_some_and(|since| now.duration_since(since) >= MAX_DIRTY_LIFETIME)
                })
                .map(|(id, entry)| (*id, entry.data.clone(), entry.generation))
                .collect()
        };
        for (id, data, generation) in expired {
            match self.base.store(&id, &data) {
                Ok(()) => {
                    let mut state = self.cache.lock().unwrap();
                    if let Some(entry) = state.entries.get_mut(&id) {
                        if entry.generation == generation {
                            entry.dirty = false;
                            entry.dirty_since = None;
                        }
                        entry.exists_in_base = true;
                    }
                }
                Err(err) => warn!("background flush of block {id} failed, will retry: {err}"),
            }
        }
    }

    fn flush_all(&self) -> Result<()> {
        let mut state = self.cache.lock().unwrap();
        let dirty: Vec<BlockId> = state
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            let entry = state.entries.get_mut(&id).unwrap();
            self.base.store(&id, &entry.data)?;
            entry.dirty = false;
            entry.dirty_since = None;
            entry.exists_in_base = true;
        }
        Ok(())
    }
}

pub struct CachingBlockStore<B: BlockStore + 'static> {
    inner: Arc<Inner<B>>,
    flusher: Option<JoinHandle<()>>,
}

impl<B: BlockStore + 'static> CachingBlockStore<B> {
    pub fn new(base: B) -> Self {
        let inner = Arc::new(Inner {
            base,
            cache: Mutex::new(CacheState::default()),
            stopped: Mutex::new(false),
            stop_condition: Condvar::new(),
        });
        let flusher = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("veilfs-cache-flush".to_string())
                .spawn(move || {
                    let mut stopped = inner.stopped.lock().unwrap();
                    while !*stopped {
                        let (guard, _) = inner
                            .stop_condition
                            .wait_timeout(stopped, FLUSH_TICK)
                            .unwrap();
                        stopped = guard;
                        if *stopped {
                            break;
                        }
                        drop(stopped);
                        inner.flush_old_entries();
                        stopped = inner.stopped.lock().unwrap();
                    }
                })
                .expect("failed to spawn cache flush thread")
        };
        Self {
            inner,
            flusher: Some(flusher),
        }
    }
}

impl<B: BlockStore + 'static> BlockStore for CachingBlockStore<B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        let mut state = self.inner.cache.lock().unwrap();
        if state.entries.contains_key(id) || self.inner.base.exists(id)? {
            return Ok(TryCreateResult::AlreadyExists);
        }
        state.use_counter += 1;
        let entry = CacheEntry {
            data: data.to_vec(),
            dirty: true,
            dirty_since: Some(Instant::now()),
            last_use: state.use_counter,
            exists_in_base: false,
            generation: 0,
        };
        self.inner.insert(&mut state, *id, entry)?;
        Ok(TryCreateResult::Created)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        {
            let mut state = self.inner.cache.lock().unwrap();
            if let Some(entry) = state.entries.get(id) {
                let data = entry.data.clone();
                state.touch(id);
                return Ok(Some(data));
            }
        }
        // Miss. Read below without holding the cache lock.
        let Some(data) = self.inner.base.load(id)? else {
            return Ok(None);
        };
        let mut state = self.inner.cache.lock().unwrap();
        state.use_counter += 1;
        let entry = CacheEntry {
            data: data.clone(),
            dirty: false,
            dirty_since: None,
            last_use: state.use_counter,
            exists_in_base: true,
            generation: 0,
        };
        self.inner.insert(&mut state, *id, entry)?;
        Ok(Some(data))
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        {
            let mut state = self.inner.cache.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(id) {
                entry.data = data.to_vec();
                entry.dirty = true;
                entry.generation += 1;
                if entry.dirty_since.is_none() {
                    entry.dirty_since = Some(Instant::now());
                }
                state.touch(id);
                return Ok(());
            }
        }
        // Not cached: write through, then keep a clean copy so the next
        // write to this block becomes a cheap cache update.
        self.inner.base.store(id, data)?;
        let mut state = self.inner.cache.lock().unwrap();
        state.use_counter += 1;
        let entry = CacheEntry {
            data: data.to_vec(),
            dirty: false,
            dirty_since: None,
            last_use: state.use_counter,
            exists_in_base: true,
            generation: 0,
        };
        self.inner.insert(&mut state, *id, entry)?;
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        let cached = self.inner.cache.lock().unwrap().entries.remove(id);
        match cached {
            Some(entry) if !entry.exists_in_base => Ok(RemoveResult::Removed),
            Some(_) => self.inner.base.remove(id),
            None => self.inner.base.remove(id),
        }
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        if self.inner.cache.lock().unwrap().entries.contains_key(id) {
            return Ok(true);
        }
        self.inner.base.exists(id)
    }

    fn num_blocks(&self) -> Result<u64> {
        let cache_only = self
            .inner
            .cache
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| !e.exists_in_base)
            .count() as u64;
        Ok(self.inner.base.num_blocks()? + cache_only)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.inner.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        self.inner.base.block_size_from_physical_block_size(physical)
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        let mut ids = self.inner.base.all_block_ids()?;
        let state = self.inner.cache.lock().unwrap();
        ids.extend(
            state
                .entries
                .iter()
                .filter(|(_, e)| !e.exists_in_base)
                .map(|(id, _)| *id),
        );
        Ok(ids)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush_all()?;
        self.inner.base.flush()
    }
}

impl<B: BlockStore + 'static> Drop for CachingBlockStore<B> {
    fn drop(&mut self) {
        *self.inner.stopped.lock().unwrap() = true;
        self.inner.stop_condition.notify_all();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
        if let Err(err) = self.inner.flush_all() {
            warn!("failed to flush cache on shutdown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::inmemory::InMemoryBlockStore;

    fn store() -> CachingBlockStore<Arc<InMemoryBlockStore>> {
        CachingBlockStore::new(Arc::new(InMemoryBlockStore::new()))
    }

    #[test]
    fn roundtrip() {
        let store = store();
        let id = store.create(b"data").unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn created_blocks_are_buffered_until_flush() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = CachingBlockStore::new(base.clone());
        let id = store.create(b"data").unwrap();
        assert!(!base.exists(&id).unwrap());
        assert!(store.exists(&id).unwrap());
        assert_eq!(store.num_blocks().unwrap(), 1);
        assert_eq!(store.all_block_ids().unwrap(), vec![id]);

        store.flush().unwrap();
        assert!(base.exists(&id).unwrap());
        assert_eq!(store.num_blocks().unwrap(), 1);
    }

    #[test]
    fn writes_are_coherent_before_flush() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = CachingBlockStore::new(base.clone());
        let id = store.create(b"old").unwrap();
        store.flush().unwrap();
        store.store(&id, b"new").unwrap();
        // The base still has the old bytes, but readers see the new ones.
        assert_eq!(base.load(&id).unwrap(), Some(b"old".to_vec()));
        assert_eq!(store.load(&id).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn eviction_flushes_dirty_entries() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = CachingBlockStore::new(base.clone());
        let first = store.create(b"first").unwrap();
        for _ in 0..CAPACITY {
            store.create(b"filler").unwrap();
        }
        // `first` was the least recently used entry and got evicted.
        assert!(base.exists(&first).unwrap());
        assert_eq!(store.load(&first).unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn background_flush_retires_old_dirty_entries() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = CachingBlockStore::new(base.clone());
        let id = store.create(b"data").unwrap();
        assert!(!base.exists(&id).unwrap());
        std::thread::sleep(MAX_DIRTY_LIFETIME + 2 * FLUSH_TICK);
        assert!(base.exists(&id).unwrap());
        assert_eq!(base.load(&id).unwrap().unwrap()[..], b"data"[..]);
    }

    #[test]
    fn drop_flushes_everything() {
        let base = Arc::new(InMemoryBlockStore::new());
        let id;
        {
            let store = CachingBlockStore::new(base.clone());
            id = store.create(b"data").unwrap();
        }
        assert_eq!(base.load(&id).unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn remove_of_cached_created_block_never_reaches_base() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = CachingBlockStore::new(base.clone());
        let id = store.create(b"data").unwrap();
        assert_eq!(store.remove(&id).unwrap(), RemoveResult::Removed);
        assert_eq!(store.load(&id).unwrap(), None);
        assert_eq!(store.num_blocks().unwrap(), 0);
    }

    #[test]
    fn remove_of_flushed_block_reaches_base() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = CachingBlockStore::new(base.clone());
        let id = store.create(b"data").unwrap();
        store.flush().unwrap();
        assert_eq!(store.remove(&id).unwrap(), RemoveResult::Removed);
        assert!(!base.exists(&id).unwrap());
        assert_eq!(
            store.remove(&id).unwrap(),
            RemoveResult::NotRemovedBecauseItDoesntExist
        );
    }

    #[test]
    fn try_create_sees_uncached_base_blocks() {
        let base = Arc::new(InMemoryBlockStore::new());
        let id = base.create(b"preexisting").unwrap();
        let store = CachingBlockStore::new(base);
        assert_eq!(
            store.try_create(&id, b"other").unwrap(),
            TryCreateResult::AlreadyExists
        );
    }
}
