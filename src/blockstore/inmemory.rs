//! Block store keeping everything in a process-local map. Used as the bottom
//! layer in tests and anywhere disk behavior is not the point.

use super::{BlockId, BlockStore, RemoveResult, TryCreateResult};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryBlockStore {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        let mut blocks = self.blocks.lock().unwrap();
        if blocks.contains_key(id) {
            return Ok(TryCreateResult::AlreadyExists);
        }
        blocks.insert(*id, data.to_vec());
        Ok(TryCreateResult::Created)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.lock().unwrap().get(id).cloned())
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        self.blocks.lock().unwrap().insert(*id, data.to_vec());
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        match self.blocks.lock().unwrap().remove(id) {
            Some(_) => Ok(RemoveResult::Removed),
            None => Ok(RemoveResult::NotRemovedBecauseItDoesntExist),
        }
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        Ok(self.blocks.lock().unwrap().contains_key(id))
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks.lock().unwrap().len() as u64)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        Ok(u64::MAX)
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        Ok(physical)
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        Ok(self.blocks.lock().unwrap().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let store = InMemoryBlockStore::new();
        let id = store.create(b"hello").unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn overwrite() {
        let store = InMemoryBlockStore::new();
        let id = store.create(b"one").unwrap();
        store.store(&id, b"two").unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn try_create_detects_collision() {
        let store = InMemoryBlockStore::new();
        let id = store.create(b"data").unwrap();
        assert_eq!(
            store.try_create(&id, b"other").unwrap(),
            TryCreateResult::AlreadyExists
        );
        assert_eq!(store.load(&id).unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn remove() {
        let store = InMemoryBlockStore::new();
        let id = store.create(b"data").unwrap();
        assert_eq!(store.remove(&id).unwrap(), RemoveResult::Removed);
        assert_eq!(store.load(&id).unwrap(), None);
        assert_eq!(
            store.remove(&id).unwrap(),
            RemoveResult::NotRemovedBecauseItDoesntExist
        );
    }

    #[test]
    fn num_blocks_and_enumeration() {
        let store = InMemoryBlockStore::new();
        let a = store.create(b"a").unwrap();
        let b = store.create(b"b").unwrap();
        assert_eq!(store.num_blocks().unwrap(), 2);
        let mut ids = store.all_block_ids().unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
