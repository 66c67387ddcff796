use super::dir_entries::{DirEntry, DirEntryList};
use super::{write_parent, AtimeUpdateBehavior, BlobType, HEADER_SIZE};
use crate::blobstore::{Blob, BlobId};
use crate::blockstore::{BlockId, BlockStore};
use crate::error::Result;
use crate::utils::Timespec;
use log::error;

/// A directory: its child list is kept deserialized in memory and written
/// back on flush (or on drop). While a `DirBlob` is alive it is the only
/// view of that directory; the parallel-access layer above guarantees this.
pub struct DirBlob<B: BlockStore> {
    blob: Blob<B>,
    parent: BlobId,
    entries: DirEntryList,
    dirty: bool,
}

impl<B: BlockStore> DirBlob<B> {
    pub(super) fn new_empty(blob: Blob<B>, parent: BlobId) -> Self {
        Self {
            blob,
            parent,
            entries: DirEntryList::new(),
            dirty: false,
        }
    }

    pub(super) fn new(blob: Blob<B>, parent: BlobId, entries: DirEntryList) -> Self {
        Self {
            blob,
            parent,
            entries,
            dirty: false,
        }
    }

    pub fn blob_id(&self) -> BlobId {
        self.blob.id()
    }

    pub fn parent(&self) -> BlobId {
        self.parent
    }

    pub fn set_parent(&mut self, parent: &BlobId) -> Result<()> {
        write_parent(&self.blob, parent)?;
        self.parent = *parent;
        Ok(())
    }

    pub fn num_children(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_child(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get_by_name(name)
    }

    pub fn get_child_by_id(&self, id: &BlockId) -> Option<&DirEntry> {
        self.entries.get_by_id(id)
    }

    pub fn append_children_to(&self, out: &mut Vec<DirEntry>) {
        out.extend(self.entries.iter().cloned());
    }

    pub fn add_child(
        &mut self,
        name: &str,
        id: BlockId,
        entry_type: BlobType,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        self.entries.add(name, id, entry_type, mode, uid, gid)?;
        self.dirty = true;
        Ok(())
    }

    pub fn add_or_overwrite_child(
        &mut self,
        name: &str,
        id: BlockId,
        entry_type: BlobType,
        mode: u32,
        uid: u32,
        gid: u32,
        on_overwrite: impl FnOnce(&BlockId) -> Result<()>,
    ) -> Result<()> {
        self.entries
            .add_or_overwrite(name, id, entry_type, mode, uid, gid, on_overwrite)?;
        self.dirty = true;
        Ok(())
    }

    pub fn add_or_overwrite_entry(
        &mut self,
        entry: DirEntry,
        on_overwrite: impl FnOnce(&BlockId) -> Result<()>,
    ) -> Result<()> {
        self.entries.add_or_overwrite_entry(entry, on_overwrite)?;
        self.dirty = true;
        Ok(())
    }

    pub fn rename_child(
        &mut self,
        id: &BlockId,
        new_name: &str,
        on_overwrite: impl FnOnce(&BlockId) -> Result<()>,
    ) -> Result<()> {
        self.entries.rename(id, new_name, on_overwrite)?;
        self.dirty = true;
        Ok(())
    }

    pub fn remove_child_by_name(&mut self, name: &str) -> Result<DirEntry> {
        let entry = self.entries.remove_by_name(name)?;
        self.dirty = true;
        Ok(entry)
    }

    pub fn remove_child_by_id(&mut self, id: &BlockId) -> Result<DirEntry> {
        let entry = self.entries.remove_by_id(id)?;
        self.dirty = true;
        Ok(entry)
    }

    pub fn set_mode_of_child(&mut self, id: &BlockId, mode: u32) -> Result<()> {
        self.entries.set_mode(id, mode)?;
        self.dirty = true;
        Ok(())
    }

    pub fn set_uid_gid_of_child(&mut self, id: &BlockId, uid: u32, gid: u32) -> Result<()> {
        if self.entries.set_uid_gid(id, uid, gid)? {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_access_times_of_child(
        &mut self,
        id: &BlockId,
        atime: Timespec,
        mtime: Timespec,
    ) -> Result<()> {
        self.entries.set_access_times(id, atime, mtime)?;
        self.dirty = true;
        Ok(())
    }

    pub fn update_access_timestamp_of_child(
        &mut self,
        id: &BlockId,
        behavior: AtimeUpdateBehavior,
    ) -> Result<()> {
        self.entries.update_access_timestamp(id, behavior)?;
        self.dirty = true;
        Ok(())
    }

    pub fn update_modification_timestamp_of_child(&mut self, id: &BlockId) -> Result<()> {
        self.entries.update_modification_timestamp(id)?;
        self.dirty = true;
        Ok(())
    }

    /// Writes the entry list back into the blob if it changed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let serialized = self.entries.serialize();
        self.blob.resize(HEADER_SIZE + serialized.len() as u64)?;
        self.blob.write(&serialized, HEADER_SIZE)?;
        self.dirty = false;
        self.blob.flush()
    }

    /// Forgets unwritten entry changes (used right before destroying the
    /// directory blob).
    pub fn discard_changes(&mut self) {
        self.dirty = false;
    }
}

impl<B: BlockStore> Drop for DirBlob<B> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(
                "failed to write back directory blob {}: {err}",
                self.blob.id()
            );
        }
    }
}
