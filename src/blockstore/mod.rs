//! The layered block store stack. Every layer implements [`BlockStore`] and
//! wraps the layer below, adding exactly one concern:
//!
//! on-disk -> encryption -> integrity -> caching -> parallel access
//!
//! Layers below the cache are value-oriented (load and store whole block
//! contents); exclusive in-memory block handles exist only at the
//! [`parallel`] layer on top.

mod block_id;
pub mod caching;
pub mod encrypted;
pub mod inmemory;
pub mod integrity;
pub mod ondisk;
pub mod parallel;

pub use block_id::BlockId;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryCreateResult {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveResult {
    Removed,
    NotRemovedBecauseItDoesntExist,
}

/// Contract shared by all store layers.
///
/// Guarantees: after `store(id, data)` returns, `load(id)` yields exactly
/// `data` until the next `store` or `remove` of that id. Writes to distinct
/// ids are unordered with respect to each other.
pub trait BlockStore: Send + Sync {
    /// Creates the block if no block with this id exists yet.
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult>;

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>>;

    /// Overwrites the block, creating it if it doesn't exist.
    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()>;

    fn remove(&self, id: &BlockId) -> Result<RemoveResult>;

    fn exists(&self, id: &BlockId) -> Result<bool>;

    fn num_blocks(&self) -> Result<u64>;

    fn estimate_num_free_bytes(&self) -> Result<u64>;

    /// Usable payload bytes of a block whose physical representation (at the
    /// bottom of the stack) takes `physical` bytes.
    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64>;

    fn all_block_ids(&self) -> Result<Vec<BlockId>>;

    /// Pushes buffered state down the stack. No-op for unbuffered layers.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Creates a block under a fresh random id, retrying on the (practically
    /// impossible) id collision.
    fn create(&self, data: &[u8]) -> Result<BlockId> {
        loop {
            let id = BlockId::random();
            if let TryCreateResult::Created = self.try_create(&id, data)? {
                return Ok(id);
            }
        }
    }
}

impl<B: BlockStore + ?Sized> BlockStore for std::sync::Arc<B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        (**self).try_create(id, data)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        (**self).load(id)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        (**self).store(id, data)
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        (**self).remove(id)
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        (**self).exists(id)
    }

    fn num_blocks(&self) -> Result<u64> {
        (**self).num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        (**self).estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        (**self).block_size_from_physical_block_size(physical)
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        (**self).all_block_ids()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

impl<B: BlockStore + ?Sized> BlockStore for &B {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        (**self).try_create(id, data)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        (**self).load(id)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        (**self).store(id, data)
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        (**self).remove(id)
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        (**self).exists(id)
    }

    fn num_blocks(&self) -> Result<u64> {
        (**self).num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        (**self).estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        (**self).block_size_from_physical_block_size(physical)
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        (**self).all_block_ids()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

impl<B: BlockStore + ?Sized> BlockStore for Box<B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        (**self).try_create(id, data)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        (**self).load(id)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        (**self).store(id, data)
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        (**self).remove(id)
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        (**self).exists(id)
    }

    fn num_blocks(&self) -> Result<u64> {
        (**self).num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        (**self).estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        (**self).block_size_from_physical_block_size(physical)
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        (**self).all_block_ids()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}
