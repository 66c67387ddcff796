use super::open_file_list::{OpenFile, OpenFileList};
use crate::blobstore::BlobId;
use crate::blockstore::{BlockId, BlockStore};
use crate::error::{Error, FsError, Result};
use crate::fsblobstore::parallel::{FsBlobRef, ParallelAccessFsBlobStore};
use crate::fsblobstore::{AtimeUpdateBehavior, BlobType, DirEntry, Metadata};
use crate::utils::Timespec;
use log::debug;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// stat-like attributes of one node.
#[derive(Debug, Clone)]
pub struct NodeAttrs {
    pub blob_id: BlobId,
    pub node_type: BlobType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub last_access_time: Timespec,
    pub last_modification_time: Timespec,
    pub last_metadata_change_time: Timespec,
}

/// Raw numbers a statfs implementation needs.
#[derive(Debug, Clone, Copy)]
pub struct FsStatistics {
    /// Usable bytes per filesystem block (leaf payload capacity).
    pub block_size: u64,
    pub num_used_blocks: u64,
    pub num_free_blocks: u64,
    pub max_filename_length: u32,
}

/// Maps POSIX operations onto the blob layer. One instance per mounted
/// filesystem; safe to call from many kernel threads at once.
pub struct Device<B: BlockStore> {
    fsblobstore: Arc<ParallelAccessFsBlobStore<B>>,
    root_blob_id: BlobId,
    physical_block_size_bytes: u64,
    atime_behavior: AtimeUpdateBehavior,
    mount_uid: u32,
    mount_gid: u32,
    open_files: Mutex<OpenFileList>,
}

impl<B: BlockStore> Device<B> {
    /// Opens the device over an existing root blob, or creates the root
    /// directory when `root_blob_id` is `None` (fresh filesystem). The root
    /// directory's parent pointer is its own id.
    pub fn new(
        fsblobstore: Arc<ParallelAccessFsBlobStore<B>>,
        root_blob_id: Option<BlobId>,
        physical_block_size_bytes: u64,
        atime_behavior: AtimeUpdateBehavior,
        mount_uid: u32,
        mount_gid: u32,
    ) -> Result<Self> {
        let root_blob_id = match root_blob_id {
            Some(id) => {
                let mut root = fsblobstore
                    .load(&id)?
                    .ok_or_else(|| Error::Corruption(format!("root blob {id} is missing")))?;
                root.as_dir()?;
                id
            }
            None => {
                let mut root = fsblobstore.create_dir_blob(
                    &BlobId::from_bytes([0; 16]),
                    Metadata::new(libc::S_IFDIR as u32 | 0o755, mount_uid, mount_gid),
                )?;
                let id = root.blob_id();
                root.set_parent(&id)?;
                debug!("created root directory blob {id}");
                id
            }
        };
        Ok(Self {
            fsblobstore,
            root_blob_id,
            physical_block_size_bytes,
            atime_behavior,
            mount_uid,
            mount_gid,
            open_files: Mutex::new(OpenFileList::default()),
        })
    }

    pub fn root_blob_id(&self) -> BlobId {
        self.root_blob_id
    }

    fn load_blob(&self, id: &BlobId) -> Result<FsBlobRef<B>> {
        self.fsblobstore
            .load(id)?
            .ok_or_else(|| Error::Corruption(format!("blob {id} is referenced but missing")))
    }

    fn path_components(path: &Path) -> Result<Vec<String>> {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::RootDir => {}
                std::path::Component::Normal(name) => {
                    let name = name
                        .to_str()
                        .ok_or(FsError::InvalidOperation)?
                        .to_string();
                    components.push(name);
                }
                _ => return Err(FsError::InvalidOperation.into()),
            }
        }
        Ok(components)
    }

    fn blob_id_for_path(&self, path: &Path) -> Result<BlobId> {
        let mut current = self.root_blob_id;
        for name in Self::path_components(path)? {
            let mut blob = self.load_blob(&current)?;
            let dir = blob.as_dir()?;
            current = dir.get_child(&name).ok_or(FsError::NotFound)?.id;
        }
        Ok(current)
    }

    /// Splits a path into (parent directory blob id, final component).
    fn parent_and_name(&self, path: &Path) -> Result<(BlobId, String)> {
        let mut components = Self::path_components(path)?;
        let name = components.pop().ok_or(FsError::InvalidOperation)?;
        let mut current = self.root_blob_id;
        for component in components {
            let mut blob = self.load_blob(&current)?;
            let dir = blob.as_dir()?;
            current = dir.get_child(&component).ok_or(FsError::NotFound)?.id;
        }
        Ok((current, name))
    }

    fn is_root(path: &Path) -> Result<bool> {
        Ok(Self::path_components(path)?.is_empty())
    }

    fn synthesized_root_attrs(&self) -> NodeAttrs {
        let now = Timespec::now();
        NodeAttrs {
            blob_id: self.root_blob_id,
            node_type: BlobType::Dir,
            mode: libc::S_IFDIR as u32 | 0o755,
            uid: self.mount_uid,
            gid: self.mount_gid,
            size: DIR_STAT_SIZE,
            nlink: 2,
            last_access_time: now,
            last_modification_time: now,
            last_metadata_change_time: now,
        }
    }

    fn size_of(&self, entry: &DirEntry) -> Result<u64> {
        match entry.entry_type {
            BlobType::Dir => Ok(DIR_STAT_SIZE),
            BlobType::File => {
                let mut blob = self.load_blob(&entry.id)?;
                blob.as_file()?.num_bytes()
            }
            BlobType::Symlink => {
                let mut blob = self.load_blob(&entry.id)?;
                Ok(blob.as_symlink()?.target().len() as u64)
            }
        }
    }

    fn attrs_from_entry(&self, entry: &DirEntry) -> Result<NodeAttrs> {
        Ok(NodeAttrs {
            blob_id: entry.id,
            node_type: entry.entry_type,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            size: self.size_of(entry)?,
            nlink: if entry.entry_type == BlobType::Dir { 2 } else { 1 },
            last_access_time: entry.last_access_time,
            last_modification_time: entry.last_modification_time,
            last_metadata_change_time: entry.last_metadata_change_time,
        })
    }

    pub fn getattr(&self, path: &Path) -> Result<NodeAttrs> {
        debug!("getattr: path = {}", path.display());
        if Self::is_root(path)? {
            return Ok(self.synthesized_root_attrs());
        }
        let (parent_id, name) = self.parent_and_name(path)?;
        let mut parent = self.load_blob(&parent_id)?;
        let entry = parent
            .as_dir()?
            .get_child(&name)
            .ok_or(FsError::NotFound)?
            .clone();
        drop(parent);
        self.attrs_from_entry(&entry)
    }

    pub fn mkdir(&self, path: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
        debug!("mkdir: path = {}, mode = {mode:o}", path.display());
        let mode = mode | libc::S_IFDIR as u32;
        let (parent_id, name) = self.parent_and_name(path)?;
        let blob = self
            .fsblobstore
            .create_dir_blob(&parent_id, Metadata::new(mode, uid, gid))?;
        let child_id = blob.blob_id();
        drop(blob);
        self.add_child_entry(&parent_id, &name, child_id, BlobType::Dir, mode, uid, gid)
    }

    /// Creates a regular file and opens it; returns the descriptor.
    pub fn create_and_open_file(&self, path: &Path, mode: u32, uid: u32, gid: u32) -> Result<u64> {
        debug!("create: path = {}, mode = {mode:o}", path.display());
        let mode = mode | libc::S_IFREG as u32;
        let (parent_id, name) = self.parent_and_name(path)?;
        let blob = self
            .fsblobstore
            .create_file_blob(&parent_id, Metadata::new(mode, uid, gid))?;
        let child_id = blob.blob_id();
        drop(blob);
        self.add_child_entry(&parent_id, &name, child_id, BlobType::File, mode, uid, gid)?;
        Ok(self.open_files.lock().unwrap().open(OpenFile {
            blob_id: child_id,
            parent_id,
        }))
    }

    pub fn create_symlink(&self, target: &str, path: &Path, uid: u32, gid: u32) -> Result<()> {
        debug!("symlink: target = {target}, path = {}", path.display());
        let mode = libc::S_IFLNK as u32 | 0o777;
        let (parent_id, name) = self.parent_and_name(path)?;
        let blob =
            self.fsblobstore
                .create_symlink_blob(target, &parent_id, Metadata::new(mode, uid, gid))?;
        let child_id = blob.blob_id();
        drop(blob);
        self.add_child_entry(&parent_id, &name, child_id, BlobType::Symlink, mode, uid, gid)
    }

    fn add_child_entry(
        &self,
        parent_id: &BlobId,
        name: &str,
        child_id: BlobId,
        entry_type: BlobType,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let mut parent = self.load_blob(parent_id)?;
        let dir = parent.as_dir()?;
        if let Err(err) = dir.add_child(name, child_id, entry_type, mode, uid, gid) {
            drop(parent);
            // Roll the orphaned blob back out.
            let _ = self.fsblobstore.remove_by_id(&child_id);
            return Err(err);
        }
        Ok(())
    }

    pub fn readlink(&self, path: &Path) -> Result<String> {
        debug!("readlink: path = {}", path.display());
        let id = self.blob_id_for_path(path)?;
        let mut blob = self.load_blob(&id)?;
        let target = blob.as_symlink()?.target().to_string();
        Ok(target)
    }

    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        debug!("readdir: path = {}", path.display());
        let id = self.blob_id_for_path(path)?;
        let mut entries = Vec::new();
        {
            let mut blob = self.load_blob(&id)?;
            blob.as_dir()?.append_children_to(&mut entries);
        }
        // A readdir is an access of the directory itself.
        if !Self::is_root(path)? {
            self.update_access_timestamp_in_parent(path, &id);
        }
        Ok(entries)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        debug!("unlink: path = {}", path.display());
        let (parent_id, name) = self.parent_and_name(path)?;
        let child_id = {
            let mut parent = self.load_blob(&parent_id)?;
            let dir = parent.as_dir()?;
            let entry = dir.get_child(&name).ok_or(FsError::NotFound)?;
            if entry.entry_type == BlobType::Dir {
                return Err(FsError::IsADirectory.into());
            }
            let id = entry.id;
            dir.remove_child_by_name(&name)?;
            id
        };
        self.fsblobstore.remove_by_id(&child_id)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        debug!("rmdir: path = {}", path.display());
        if Self::is_root(path)? {
            return Err(FsError::InvalidOperation.into());
        }
        let (parent_id, name) = self.parent_and_name(path)?;
        let child_id = {
            let mut parent = self.load_blob(&parent_id)?;
            let dir = parent.as_dir()?;
            let entry = dir.get_child(&name).ok_or(FsError::NotFound)?;
            if entry.entry_type != BlobType::Dir {
                return Err(FsError::NotADirectory.into());
            }
            entry.id
        };
        {
            let mut child = self.load_blob(&child_id)?;
            if !child.as_dir()?.is_empty() {
                return Err(FsError::NotEmpty.into());
            }
        }
        {
            let mut parent = self.load_blob(&parent_id)?;
            parent.as_dir()?.remove_child_by_id(&child_id)?;
        }
        self.fsblobstore.remove_by_id(&child_id)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("rename: from = {}, to = {}", from.display(), to.display());
        if Self::is_root(from)? || Self::is_root(to)? {
            return Err(FsError::InvalidOperation.into());
        }
        if from == to {
            return Ok(());
        }
        // Moving a directory into its own subtree would detach it from the
        // tree.
        if to.starts_with(from) {
            return Err(FsError::InvalidOperation.into());
        }
        let (from_parent, from_name) = self.parent_and_name(from)?;
        let (to_parent, to_name) = self.parent_and_name(to)?;

        if from_parent == to_parent {
            self.rename_within_dir(&from_parent, &from_name, &to_name)
        } else {
            self.rename_across_dirs(&from_parent, &from_name, &to_parent, &to_name)
        }
    }

    /// Fails with `NotEmpty` if `entry` is a non-empty directory (renaming
    /// over a non-empty directory is rejected client-side).
    fn check_overwrite_target_empty(&self, entry: &DirEntry) -> Result<()> {
        if entry.entry_type != BlobType::Dir {
            return Ok(());
        }
        let mut blob = self.load_blob(&entry.id)?;
        if !blob.as_dir()?.is_empty() {
            return Err(FsError::NotEmpty.into());
        }
        Ok(())
    }

    fn rename_within_dir(&self, parent_id: &BlobId, from_name: &str, to_name: &str) -> Result<()> {
        let mut parent = self.load_blob(parent_id)?;
        let dir = parent.as_dir()?;
        let moved_id = dir.get_child(from_name).ok_or(FsError::NotFound)?.id;
        if let Some(target) = dir.get_child(to_name) {
            if target.id != moved_id {
                let target = target.clone();
                self.check_overwrite_target_empty(&target)?;
            }
        }
        let mut overwritten = None;
        dir.rename_child(&moved_id, to_name, |old_id| {
            overwritten = Some(*old_id);
            Ok(())
        })?;
        drop(parent);
        if let Some(old_id) = overwritten {
            self.fsblobstore.remove_by_id(&old_id)?;
        }
        Ok(())
    }

    fn rename_across_dirs(
        &self,
        from_parent: &BlobId,
        from_name: &str,
        to_parent: &BlobId,
        to_name: &str,
    ) -> Result<()> {
        // Take both directory blobs in id order so two concurrent renames in
        // opposite directions cannot deadlock.
        let (mut first, mut second) = if from_parent < to_parent {
            let first = self.load_blob(from_parent)?;
            let second = self.load_blob(to_parent)?;
            (first, second)
        } else {
            let second = self.load_blob(to_parent)?;
            let first = self.load_blob(from_parent)?;
            (first, second)
        };
        // `first` is always the source directory, `second` the target; only
        // the acquisition order above depends on the ids.
        let source = first.as_dir()?;
        let target = second.as_dir()?;

        let mut entry = source
            .get_child(from_name)
            .ok_or(FsError::NotFound)?
            .clone();
        if let Some(existing) = target.get_child(to_name) {
            let existing = existing.clone();
            self.check_overwrite_target_empty(&existing)?;
        }

        source.remove_child_by_id(&entry.id)?;
        let moved_id = entry.id;
        entry.name = to_name.to_string();
        entry.last_metadata_change_time = Timespec::now();
        let mut overwritten = None;
        target.add_or_overwrite_entry(entry, |old_id| {
            overwritten = Some(*old_id);
            Ok(())
        })?;
        drop(first);
        drop(second);

        if let Some(old_id) = overwritten {
            self.fsblobstore.remove_by_id(&old_id)?;
        }

        // The moved blob must point at its new parent.
        let mut moved = self.load_blob(&moved_id)?;
        moved.set_parent(to_parent)?;
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        debug!("chmod: path = {}, mode = {mode:o}", path.display());
        self.with_entry_in_parent(path, |dir, entry_id, entry_type| {
            let mode = mode | file_type_bits(entry_type);
            dir.set_mode_of_child(entry_id, mode)
        })
    }

    pub fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        debug!("chown: path = {}, uid = {uid}, gid = {gid}", path.display());
        self.with_entry_in_parent(path, |dir, entry_id, _| {
            dir.set_uid_gid_of_child(entry_id, uid, gid)
        })
    }

    pub fn utimens(&self, path: &Path, atime: Timespec, mtime: Timespec) -> Result<()> {
        debug!("utimens: path = {}", path.display());
        self.with_entry_in_parent(path, |dir, entry_id, _| {
            dir.set_access_times_of_child(entry_id, atime, mtime)
        })
    }

    fn with_entry_in_parent<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut crate::fsblobstore::DirBlob<B>, &BlockId, BlobType) -> Result<T>,
    ) -> Result<T> {
        if Self::is_root(path)? {
            // The root has no parent entry to update.
            return Err(FsError::InvalidOperation.into());
        }
        let (parent_id, name) = self.parent_and_name(path)?;
        let mut parent = self.load_blob(&parent_id)?;
        let dir = parent.as_dir()?;
        let entry = dir.get_child(&name).ok_or(FsError::NotFound)?;
        let (entry_id, entry_type) = (entry.id, entry.entry_type);
        f(dir, &entry_id, entry_type)
    }

    pub fn open(&self, path: &Path) -> Result<u64> {
        debug!("open: path = {}", path.display());
        let (parent_id, name) = self.parent_and_name(path)?;
        let child_id = {
            let mut parent = self.load_blob(&parent_id)?;
            let dir = parent.as_dir()?;
            let entry = dir.get_child(&name).ok_or(FsError::NotFound)?;
            if entry.entry_type == BlobType::Dir {
                return Err(FsError::IsADirectory.into());
            }
            entry.id
        };
        Ok(self.open_files.lock().unwrap().open(OpenFile {
            blob_id: child_id,
            parent_id,
        }))
    }

    pub fn release(&self, descriptor: u64) -> Result<()> {
        debug!("release: fd = {descriptor}");
        self.open_files.lock().unwrap().close(descriptor)
    }

    pub fn read(&self, descriptor: u64, target: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.open_files.lock().unwrap().get(descriptor)?;
        debug!("read: fd = {descriptor}, offset = {offset}, size = {}", target.len());
        let read = {
            let mut blob = self.load_blob(&file.blob_id)?;
            blob.as_file()?.read(target, offset)?
        };
        self.update_access_timestamp_of(&file.parent_id, &file.blob_id);
        Ok(read)
    }

    pub fn write(&self, descriptor: u64, source: &[u8], offset: u64) -> Result<usize> {
        let file = self.open_files.lock().unwrap().get(descriptor)?;
        debug!("write: fd = {descriptor}, offset = {offset}, size = {}", source.len());
        {
            let mut blob = self.load_blob(&file.blob_id)?;
            blob.as_file()?.write(source, offset)?;
        }
        self.update_modification_timestamp_of(&file.parent_id, &file.blob_id);
        Ok(source.len())
    }

    pub fn ftruncate(&self, descriptor: u64, new_size: u64) -> Result<()> {
        let file = self.open_files.lock().unwrap().get(descriptor)?;
        debug!("ftruncate: fd = {descriptor}, size = {new_size}");
        {
            let mut blob = self.load_blob(&file.blob_id)?;
            blob.as_file()?.resize(new_size)?;
        }
        self.update_modification_timestamp_of(&file.parent_id, &file.blob_id);
        Ok(())
    }

    pub fn truncate(&self, path: &Path, new_size: u64) -> Result<()> {
        debug!("truncate: path = {}, size = {new_size}", path.display());
        let (parent_id, name) = self.parent_and_name(path)?;
        let child_id = {
            let mut parent = self.load_blob(&parent_id)?;
            let entry = parent
                .as_dir()?
                .get_child(&name)
                .ok_or(FsError::NotFound)?;
            if entry.entry_type != BlobType::File {
                return Err(FsError::InvalidOperation.into());
            }
            entry.id
        };
        {
            let mut blob = self.load_blob(&child_id)?;
            blob.as_file()?.resize(new_size)?;
        }
        self.update_modification_timestamp_of(&parent_id, &child_id);
        Ok(())
    }

    pub fn fsync(&self, descriptor: u64) -> Result<()> {
        let file = self.open_files.lock().unwrap().get(descriptor)?;
        debug!("fsync: fd = {descriptor}");
        {
            let mut blob = self.load_blob(&file.blob_id)?;
            blob.flush()?;
        }
        self.fsblobstore.flush()
    }

    pub fn statfs(&self) -> Result<FsStatistics> {
        debug!("statfs");
        let num_used_blocks = self.fsblobstore.num_blocks()?;
        let free_bytes = self.fsblobstore.estimate_space_for_num_blocks_left()?;
        Ok(FsStatistics {
            block_size: self.fsblobstore.virtual_block_size_bytes(),
            num_used_blocks,
            num_free_blocks: free_bytes / self.physical_block_size_bytes,
            max_filename_length: 255,
        })
    }

    /// Pushes all buffered state down to the base directory.
    pub fn flush(&self) -> Result<()> {
        debug!("flush");
        self.fsblobstore.flush()
    }

    /// Best-effort timestamp maintenance. The entry may legitimately be gone
    /// (concurrent rename/unlink); that is not an error for the triggering
    /// operation.
    fn update_access_timestamp_of(&self, parent_id: &BlobId, child_id: &BlobId) {
        let _ = self.try_update_parent_entry(parent_id, |dir| {
            dir.update_access_timestamp_of_child(child_id, self.atime_behavior)
        });
    }

    fn update_modification_timestamp_of(&self, parent_id: &BlobId, child_id: &BlobId) {
        let _ = self.try_update_parent_entry(parent_id, |dir| {
            dir.update_modification_timestamp_of_child(child_id)
        });
    }

    fn update_access_timestamp_in_parent(&self, path: &Path, child_id: &BlobId) {
        if let Ok((parent_id, _)) = self.parent_and_name(path) {
            self.update_access_timestamp_of(&parent_id, child_id);
        }
    }

    fn try_update_parent_entry(
        &self,
        parent_id: &BlobId,
        f: impl FnOnce(&mut crate::fsblobstore::DirBlob<B>) -> Result<()>,
    ) -> Result<()> {
        let mut parent = self.load_blob(parent_id)?;
        f(parent.as_dir()?)
    }
}

/// Directories report a fixed nominal size.
const DIR_STAT_SIZE: u64 = 4096;

fn file_type_bits(entry_type: BlobType) -> u32 {
    match entry_type {
        BlobType::File => libc::S_IFREG as u32,
        BlobType::Dir => libc::S_IFDIR as u32,
        BlobType::Symlink => libc::S_IFLNK as u32,
    }
}

#[cfg(test)]
mod tests;
