//! Variable-size byte streams stored as balanced trees of fixed-size blocks.
//!
//! A blob is identified by its root block's id, and that id never changes:
//! growing past the root's capacity copies the root's content into a fresh
//! child block and rewrites the root in place as an inner node above it;
//! shrinking folds a lone child's content back into the root block. The tree
//! is left-max-data: at every inner node, all children but the rightmost are
//! completely full subtrees, which makes byte-offset addressing pure
//! arithmetic.

pub mod node;

use crate::blockstore::parallel::{BlockHandle, ParallelAccessBlockStore};
use crate::blockstore::{BlockId, BlockStore};
use crate::error::{Error, FsError, Result};
use node::{DataNode, InnerNode, LeafNode, NodeLayout};
use std::sync::Arc;

/// Every blob is identified by the id of its root block.
pub type BlobId = BlockId;

pub struct BlobStore<B: BlockStore> {
    store: Arc<ParallelAccessBlockStore<B>>,
    layout: NodeLayout,
}

impl<B: BlockStore> BlobStore<B> {
    pub fn new(store: Arc<ParallelAccessBlockStore<B>>, physical_block_size_bytes: u64) -> Result<Self> {
        let usable = store.block_size_from_physical_block_size(physical_block_size_bytes)?;
        Ok(Self {
            store,
            layout: NodeLayout::new(usable as usize),
        })
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Creates an empty blob (a single zero-size leaf).
    pub fn create(&self) -> Result<Blob<B>> {
        let handle = self.store.create(&node::serialize_leaf(self.layout, &[]))?;
        let id = handle.id();
        drop(handle);
        Ok(Blob {
            store: Arc::clone(&self.store),
            layout: self.layout,
            id,
        })
    }

    pub fn load(&self, id: &BlobId) -> Result<Option<Blob<B>>> {
        match self.store.load(id)? {
            Some(handle) => {
                // Validate that the root parses as a tree node before
                // handing out the blob.
                DataNode::parse(handle, self.layout)?;
                Ok(Some(Blob {
                    store: Arc::clone(&self.store),
                    layout: self.layout,
                    id: *id,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, blob: Blob<B>) -> Result<()> {
        self.remove_by_id(&blob.id)
    }

    /// Removes the blob and every block of its tree.
    pub fn remove_by_id(&self, id: &BlobId) -> Result<()> {
        let Some(blob) = self.load(id)? else {
            return Err(FsError::NotFound.into());
        };
        let root = blob.load_root()?;
        blob.remove_subtree_node(root)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.store.num_blocks()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.store.estimate_num_free_bytes()
    }

    /// Payload bytes a single leaf can hold; reported as the filesystem's
    /// block size in statfs.
    pub fn virtual_block_size_bytes(&self) -> u64 {
        self.layout.max_bytes_per_leaf()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

/// Handle to one blob. Not `Clone`: per-blob exclusivity is enforced by the
/// layer above (the fs-blob parallel access store).
pub struct Blob<B: BlockStore> {
    store: Arc<ParallelAccessBlockStore<B>>,
    layout: NodeLayout,
    id: BlobId,
}

impl<B: BlockStore> Blob<B> {
    pub fn id(&self) -> BlobId {
        self.id
    }

    fn load_node(&self, id: &BlockId) -> Result<DataNode<B>> {
        let Some(handle) = self.store.load(id)? else {
            return Err(Error::Corruption(format!(
                "tree node {id} is referenced but missing"
            )));
        };
        DataNode::parse(handle, self.layout)
    }

    fn load_root(&self) -> Result<DataNode<B>> {
        self.load_node(&self.id)
    }

    /// Total bytes represented by this blob.
    pub fn size(&self) -> Result<u64> {
        let max_leaf = self.layout.max_bytes_per_leaf();
        let mut leaves_before: u64 = 0;
        let mut node = self.load_root()?;
        loop {
            match node {
                DataNode::Leaf(leaf) => {
                    return Ok(leaves_before * max_leaf + leaf.num_bytes());
                }
                DataNode::Inner(inner) => {
                    let per_child = self.layout.num_leaves_per_full_subtree(inner.depth() - 1);
                    leaves_before += (inner.num_children() - 1) * per_child;
                    let next = inner.last_child_id();
                    drop(inner);
                    node = self.load_node(&next)?;
                }
            }
        }
    }

    fn num_leaves(&self) -> Result<u64> {
        let mut leaves_before: u64 = 0;
        let mut node = self.load_root()?;
        loop {
            match node {
                DataNode::Leaf(_) => return Ok(leaves_before + 1),
                DataNode::Inner(inner) => {
                    let per_child = self.layout.num_leaves_per_full_subtree(inner.depth() - 1);
                    leaves_before += (inner.num_children() - 1) * per_child;
                    let next = inner.last_child_id();
                    drop(inner);
                    node = self.load_node(&next)?;
                }
            }
        }
    }

    fn root_depth(&self) -> Result<u8> {
        Ok(self.load_root()?.depth())
    }

    /// Resolves a leaf index to its block id by arithmetic descent.
    fn leaf_block_id(&self, leaf_index: u64) -> Result<BlockId> {
        let mut id = self.id;
        let mut index = leaf_index;
        loop {
            let node = self.load_node(&id)?;
            match node {
                DataNode::Leaf(_) => {
                    assert_eq!(0, index, "leaf index points past the tree");
                    return Ok(id);
                }
                DataNode::Inner(inner) => {
                    let per_child = self.layout.num_leaves_per_full_subtree(inner.depth() - 1);
                    let child_index = index / per_child;
                    assert!(
                        child_index < inner.num_children(),
                        "leaf index points past the tree"
                    );
                    id = inner.child_id(child_index);
                    index %= per_child;
                }
            }
        }
    }

    fn with_leaf<T>(&self, leaf_index: u64, f: impl FnOnce(&mut LeafNode<B>) -> T) -> Result<T> {
        let id = self.leaf_block_id(leaf_index)?;
        match self.load_node(&id)? {
            DataNode::Leaf(mut leaf) => Ok(f(&mut leaf)),
            DataNode::Inner(_) => Err(Error::Corruption(format!(
                "expected leaf at {id}, found inner node"
            ))),
        }
    }

    fn load_inner(&self, id: &BlockId) -> Result<InnerNode<B>> {
        match self.load_node(id)? {
            DataNode::Inner(inner) => Ok(inner),
            DataNode::Leaf(_) => Err(Error::Corruption(format!(
                "expected inner node at {id}, found leaf"
            ))),
        }
    }

    /// Reads exactly `target.len()` bytes at `offset`; fails if the range
    /// reaches past the end of the blob.
    pub fn read(&self, target: &mut [u8], offset: u64) -> Result<()> {
        let size = self.size()?;
        let end = offset
            .checked_add(target.len() as u64)
            .ok_or(FsError::InvalidOperation)?;
        if end > size {
            return Err(FsError::InvalidOperation.into());
        }
        self.read_leaves(target, offset)
    }

    /// Reads up to `target.len()` bytes at `offset`, clamped to the blob
    /// size. Returns the number of bytes read.
    pub fn try_read(&self, target: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size()?;
        if offset >= size {
            return Ok(0);
        }
        let n = u64::min(target.len() as u64, size - offset) as usize;
        self.read_leaves(&mut target[..n], offset)?;
        Ok(n)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let size = self.size()?;
        let mut data = vec![0; size as usize];
        self.read_leaves(&mut data, 0)?;
        Ok(data)
    }

    fn read_leaves(&self, target: &mut [u8], offset: u64) -> Result<()> {
        let max_leaf = self.layout.max_bytes_per_leaf();
        let mut written = 0usize;
        while written < target.len() {
            let pos = offset + written as u64;
            let leaf_index = pos / max_leaf;
            let leaf_offset = pos % max_leaf;
            let chunk = u64::min(max_leaf - leaf_offset, (target.len() - written) as u64) as usize;
            self.with_leaf(leaf_index, |leaf| {
                let begin = leaf_offset as usize;
                target[written..written + chunk].copy_from_slice(&leaf.data()[begin..begin + chunk]);
            })?;
            written += chunk;
        }
        Ok(())
    }

    /// Writes `source` at `offset`, growing the blob (zero-filling any gap)
    /// as needed.
    pub fn write(&self, source: &[u8], offset: u64) -> Result<()> {
        let end = offset
            .checked_add(source.len() as u64)
            .ok_or(FsError::InvalidOperation)?;
        if end > self.size()? {
            self.resize(end)?;
        }
        let max_leaf = self.layout.max_bytes_per_leaf();
        let mut read = 0usize;
        while read < source.len() {
            let pos = offset + read as u64;
            let leaf_index = pos / max_leaf;
            let leaf_offset = pos % max_leaf;
            let chunk = u64::min(max_leaf - leaf_offset, (source.len() - read) as u64) as usize;
            self.with_leaf(leaf_index, |leaf| {
                leaf.write(&source[read..read + chunk], leaf_offset);
            })?;
            read += chunk;
        }
        Ok(())
    }

    /// Grows (zero-filling the new tail) or shrinks (freeing now-unneeded
    /// subtrees) the blob to exactly `new_size` bytes.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let max_leaf = self.layout.max_bytes_per_leaf();
        let new_num_leaves = u64::max(1, new_size.div_ceil(max_leaf));
        let current_num_leaves = self.num_leaves()?;

        match new_num_leaves.cmp(&current_num_leaves) {
            std::cmp::Ordering::Greater => {
                // The current last leaf becomes an interior leaf and must be
                // full for the left-max-data invariant to hold.
                self.with_leaf(current_num_leaves - 1, |leaf| leaf.resize(max_leaf))?;
                self.grow_to_num_leaves(current_num_leaves, new_num_leaves)?;
            }
            std::cmp::Ordering::Less => {
                self.shrink_to_num_leaves(new_num_leaves)?;
            }
            std::cmp::Ordering::Equal => {}
        }

        let last_leaf_size = new_size - (new_num_leaves - 1) * max_leaf;
        self.with_leaf(new_num_leaves - 1, |leaf| leaf.resize(last_leaf_size))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    fn grow_to_num_leaves(&self, current: u64, target: u64) -> Result<()> {
        // Wrap the root until the tree is deep enough for the target.
        loop {
            let depth = self.root_depth()?;
            if self.layout.num_leaves_per_full_subtree(depth) >= target {
                break;
            }
            self.grow_depth()?;
        }
        let depth = self.root_depth()?;
        self.fill_subtree(&self.id, depth, current, target)
    }

    /// Raises the tree by one level while keeping the root's block id: the
    /// root's bytes move into a fresh child block and the root block is
    /// rewritten in place as an inner node over it.
    fn grow_depth(&self) -> Result<()> {
        let mut root = self.load_root_handle()?;
        let old_depth = node::parse_depth(root.data())?;
        let copied_child = self.store.create(root.data())?;
        let child_id = copied_child.id();
        drop(copied_child);
        let new_root = node::serialize_inner(self.layout, old_depth + 1, &[child_id]);
        root.write(&new_root, 0);
        Ok(())
    }

    fn load_root_handle(&self) -> Result<BlockHandle<B>> {
        self.store.load(&self.id)?.ok_or_else(|| {
            Error::Corruption(format!("blob root block {} is missing", self.id))
        })
    }

    /// Grows the subtree rooted at `id` (at `depth`) from `current` to
    /// `target` leaves. All leaves it creates are full-size and zeroed; the
    /// caller fixes up the final leaf's size afterwards.
    fn fill_subtree(&self, id: &BlockId, depth: u8, current: u64, target: u64) -> Result<()> {
        debug_assert!(current <= target);
        debug_assert!(target <= self.layout.num_leaves_per_full_subtree(depth));
        if depth == 0 || current == target {
            return Ok(());
        }
        let per_child = self.layout.num_leaves_per_full_subtree(depth - 1);
        let current_children = current.div_ceil(per_child);
        let target_children = target.div_ceil(per_child);

        let inner = self.load_inner(id)?;
        assert_eq!(current_children, inner.num_children(), "tree shape mismatch");
        let last_index = current_children - 1;
        let last_child = inner.child_id(last_index);
        drop(inner);

        let leaves_in_last = current - last_index * per_child;
        if target_children == current_children {
            return self.fill_subtree(&last_child, depth - 1, leaves_in_last, target - last_index * per_child);
        }

        // Fill the current rightmost child completely, then append new
        // children, all full except possibly the final one.
        self.fill_subtree(&last_child, depth - 1, leaves_in_last, per_child)?;
        for i in current_children..target_children {
            let child_leaves = if i == target_children - 1 {
                target - i * per_child
            } else {
                per_child
            };
            let child_id = self.create_subtree(depth - 1, child_leaves)?;
            let mut inner = self.load_inner(id)?;
            inner.add_child(child_id);
        }
        Ok(())
    }

    /// Creates a fresh subtree of the given depth holding `leaves` zeroed
    /// full-size leaves, and returns its root id.
    fn create_subtree(&self, depth: u8, leaves: u64) -> Result<BlockId> {
        debug_assert!(leaves >= 1 && leaves <= self.layout.num_leaves_per_full_subtree(depth));
        if depth == 0 {
            let handle = self.store.create(&node::serialize_full_leaf(self.layout))?;
            return Ok(handle.id());
        }
        let per_child = self.layout.num_leaves_per_full_subtree(depth - 1);
        let num_children = leaves.div_ceil(per_child);
        let mut children = Vec::with_capacity(num_children as usize);
        for i in 0..num_children {
            let child_leaves = if i == num_children - 1 {
                leaves - i * per_child
            } else {
                per_child
            };
            children.push(self.create_subtree(depth - 1, child_leaves)?);
        }
        let handle = self
            .store
            .create(&node::serialize_inner(self.layout, depth, &children))?;
        Ok(handle.id())
    }

    fn shrink_to_num_leaves(&self, target: u64) -> Result<()> {
        let depth = self.root_depth()?;
        self.shrink_subtree(&self.id, depth, target)?;

        // A root with a single child wastes a level: fold the child's
        // content into the root block so the blob keeps its id.
        loop {
            let root = self.load_root()?;
            let DataNode::Inner(inner) = root else {
                break;
            };
            if inner.num_children() > 1 {
                break;
            }
            let child_id = inner.child_id(0);
            drop(inner);

            let child = self.load_node(&child_id)?;
            let child_bytes = child.into_handle();
            let bytes = child_bytes.data().to_vec();
            self.store.remove_handle(child_bytes)?;

            let mut root_handle = self.load_root_handle()?;
            root_handle.write(&bytes, 0);
        }
        Ok(())
    }

    /// Cuts the subtree rooted at `id` (at `depth`) down to `keep` leaves,
    /// deleting the subtrees that fall off the right edge.
    fn shrink_subtree(&self, id: &BlockId, depth: u8, keep: u64) -> Result<()> {
        debug_assert!(keep >= 1);
        if depth == 0 {
            return Ok(());
        }
        let per_child = self.layout.num_leaves_per_full_subtree(depth - 1);
        let keep_children = keep.div_ceil(per_child);

        let inner = self.load_inner(id)?;
        let children = inner.child_ids();
        drop(inner);

        if keep_children < children.len() as u64 {
            for child in &children[keep_children as usize..] {
                let node = self.load_node(child)?;
                self.remove_subtree_node(node)?;
            }
            let mut inner = self.load_inner(id)?;
            inner.truncate_children(keep_children);
        }

        let last_index = keep_children - 1;
        self.shrink_subtree(
            &children[last_index as usize],
            depth - 1,
            keep - last_index * per_child,
        )
    }

    fn remove_subtree_node(&self, node: DataNode<B>) -> Result<()> {
        match node {
            DataNode::Leaf(leaf) => self.store.remove_handle(leaf.into_handle()),
            DataNode::Inner(inner) => {
                let children = inner.child_ids();
                self.store.remove_handle(inner.into_handle())?;
                for child in children {
                    let node = self.load_node(&child)?;
                    self.remove_subtree_node(node)?;
                }
                Ok(())
            }
        }
    }

    /// Checks the left-max-data invariant over the whole tree. Test helper;
    /// walks every node.
    #[cfg(test)]
    pub fn check_tree_invariants(&self) -> Result<()> {
        self.check_subtree(&self.id, None)?;
        Ok(())
    }

    #[cfg(test)]
    fn check_subtree(&self, id: &BlockId, expected_depth: Option<u8>) -> Result<bool> {
        let node = self.load_node(id)?;
        if let Some(expected) = expected_depth {
            assert_eq!(expected, node.depth(), "depth mismatch in tree");
        }
        match node {
            DataNode::Leaf(leaf) => Ok(leaf.num_bytes() == self.layout.max_bytes_per_leaf()),
            DataNode::Inner(inner) => {
                let depth = inner.depth();
                let children = inner.child_ids();
                drop(inner);
                let mut full = true;
                for (i, child) in children.iter().enumerate() {
                    let child_full = self.check_subtree(child, Some(depth - 1))?;
                    if i < children.len() - 1 {
                        assert!(child_full, "non-rightmost child is not a full subtree");
                    }
                    full = child_full && full;
                }
                let max = self.layout.max_children_per_inner_node();
                Ok(full && children.len() as u64 == max)
            }
        }
    }
}

#[cfg(test)]
mod tests;
