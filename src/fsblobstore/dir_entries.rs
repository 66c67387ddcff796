//! Serialized child list of a directory blob.
//!
//! Entries are kept sorted by child blob id, which makes id lookups a binary
//! search and gives the serialized form a canonical order. Wire format per
//! entry: `[type u8 || mode u32 || uid u32 || gid u32 || atime (i64+u32) ||
//! mtime || ctime || name bytes || NUL || child id (16)]`, all little-endian.

use super::{AtimeUpdateBehavior, BlobType};
use crate::blockstore::BlockId;
use crate::error::{Error, FsError, Result};
use crate::utils::Timespec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub entry_type: BlobType,
    pub name: String,
    pub id: BlockId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub last_access_time: Timespec,
    pub last_modification_time: Timespec,
    pub last_metadata_change_time: Timespec,
}

impl DirEntry {
    fn serialized_size(&self) -> usize {
        1 + 4 + 4 + 4 + 3 * 12 + self.name.len() + 1 + BlockId::BINARY_LENGTH
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(self.entry_type as u8);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        for time in [
            self.last_access_time,
            self.last_modification_time,
            self.last_metadata_change_time,
        ] {
            out.extend_from_slice(&time.secs.to_le_bytes());
            out.extend_from_slice(&time.nanos.to_le_bytes());
        }
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.id.bytes());
    }

    fn deserialize_from(data: &[u8]) -> Result<(DirEntry, usize)> {
        let fixed_head = 1 + 4 + 4 + 4 + 3 * 12;
        if data.len() < fixed_head + 1 + BlockId::BINARY_LENGTH {
            return Err(corrupt("truncated directory entry"));
        }
        let entry_type = BlobType::from_byte(data[0])
            .ok_or_else(|| corrupt("directory entry has unknown type byte"))?;
        let mode = u32::from_le_bytes(data[1..5].try_into().unwrap());
        let uid = u32::from_le_bytes(data[5..9].try_into().unwrap());
        let gid = u32::from_le_bytes(data[9..13].try_into().unwrap());
        let mut times = [Timespec::ZERO; 3];
        for (i, time) in times.iter_mut().enumerate() {
            let at = 13 + i * 12;
            time.secs = i64::from_le_bytes(data[at..at + 8].try_into().unwrap());
            time.nanos = u32::from_le_bytes(data[at + 8..at + 12].try_into().unwrap());
        }
        let name_end = data[fixed_head..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("unterminated name in directory entry"))?;
        let name = std::str::from_utf8(&data[fixed_head..fixed_head + name_end])
            .map_err(|_| corrupt("directory entry name is not valid UTF-8"))?
            .to_string();
        let id_at = fixed_head + name_end + 1;
        if data.len() < id_at + BlockId::BINARY_LENGTH {
            return Err(corrupt("truncated directory entry id"));
        }
        let id = BlockId::from_slice(&data[id_at..id_at + BlockId::BINARY_LENGTH]).unwrap();

        if !entry_type.matches_mode(mode) {
            // A type byte disagreeing with the mode's file-type bits means
            // the list was not written by us.
            return Err(corrupt("directory entry type disagrees with its mode"));
        }

        let entry = DirEntry {
            entry_type,
            name,
            id,
            mode,
            uid,
            gid,
            last_access_time: times[0],
            last_modification_time: times[1],
            last_metadata_change_time: times[2],
        };
        let consumed = id_at + BlockId::BINARY_LENGTH;
        Ok((entry, consumed))
    }
}

fn corrupt(message: &str) -> Error {
    Error::Corruption(message.to_string())
}

/// In-memory form of a directory's children, maintained sorted by id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirEntryList {
    entries: Vec<DirEntry>,
}

impl DirEntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let size = self.entries.iter().map(DirEntry::serialized_size).sum();
        let mut out = Vec::with_capacity(size);
        for entry in &self.entries {
            entry.serialize_into(&mut out);
        }
        out
    }

    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        while !data.is_empty() {
            let (entry, consumed) = DirEntry::deserialize_from(data)?;
            entries.push(entry);
            data = &data[consumed..];
        }
        let list = DirEntryList { entries };
        if !list.entries.windows(2).all(|w| w[0].id < w[1].id) {
            return Err(corrupt("directory entries are not sorted by id"));
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn get_by_id(&self, id: &BlockId) -> Option<&DirEntry> {
        self.index_of(id).map(|i| &self.entries[i])
    }

    fn index_of(&self, id: &BlockId) -> Option<usize> {
        self.entries.binary_search_by(|e| e.id.cmp(id)).ok()
    }

    fn get_mut_by_id(&mut self, id: &BlockId) -> Result<&mut DirEntry> {
        let index = self.index_of(id).ok_or(FsError::NotFound)?;
        Ok(&mut self.entries[index])
    }

    /// Adds a new child. Fails with `AlreadyExists` if the name is taken.
    pub fn add(
        &mut self,
        name: &str,
        id: BlockId,
        entry_type: BlobType,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        if self.get_by_name(name).is_some() {
            return Err(FsError::AlreadyExists.into());
        }
        self.insert_sorted(new_entry(name, id, entry_type, mode, uid, gid));
        Ok(())
    }

    /// Adds a child, replacing any existing entry of the same name. The
    /// replaced child's id is passed to `on_overwrite` so the caller can
    /// destroy its blob. Directories may only overwrite directories, and
    /// non-directories only non-directories.
    pub fn add_or_overwrite(
        &mut self,
        name: &str,
        id: BlockId,
        entry_type: BlobType,
        mode: u32,
        uid: u32,
        gid: u32,
        on_overwrite: impl FnOnce(&BlockId) -> Result<()>,
    ) -> Result<()> {
        if let Some(existing) = self.get_by_name(name) {
            check_overwrite_compatibility(existing.entry_type, entry_type)?;
            let old_id = existing.id;
            on_overwrite(&old_id)?;
            self.remove_by_id(&old_id)?;
        }
        self.insert_sorted(new_entry(name, id, entry_type, mode, uid, gid));
        Ok(())
    }

    /// Inserts a fully formed entry (e.g. one moved from another directory),
    /// replacing any same-named child under the usual compatibility rules.
    pub fn add_or_overwrite_entry(
        &mut self,
        entry: DirEntry,
        on_overwrite: impl FnOnce(&BlockId) -> Result<()>,
    ) -> Result<()> {
        if let Some(existing) = self.get_by_name(&entry.name) {
            check_overwrite_compatibility(existing.entry_type, entry.entry_type)?;
            let old_id = existing.id;
            on_overwrite(&old_id)?;
            self.remove_by_id(&old_id)?;
        }
        self.insert_sorted(entry);
        Ok(())
    }

    /// Renames the child with the given id, replacing (with the same
    /// compatibility rules) any child already holding the new name.
    pub fn rename(
        &mut self,
        id: &BlockId,
        new_name: &str,
        on_overwrite: impl FnOnce(&BlockId) -> Result<()>,
    ) -> Result<()> {
        let renamed_type = self.get_by_id(id).ok_or(FsError::NotFound)?.entry_type;
        if let Some(existing) = self.get_by_name(new_name) {
            if existing.id != *id {
                check_overwrite_compatibility(existing.entry_type, renamed_type)?;
                let old_id = existing.id;
                on_overwrite(&old_id)?;
                self.remove_by_id(&old_id)?;
            }
        }
        let entry = self.get_mut_by_id(id)?;
        entry.name = new_name.to_string();
        entry.last_metadata_change_time = Timespec::now();
        Ok(())
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<DirEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or(FsError::NotFound)?;
        Ok(self.entries.remove(index))
    }

    pub fn remove_by_id(&mut self, id: &BlockId) -> Result<DirEntry> {
        let index = self.index_of(id).ok_or(FsError::NotFound)?;
        Ok(self.entries.remove(index))
    }

    pub fn set_mode(&mut self, id: &BlockId, mode: u32) -> Result<()> {
        let entry = self.get_mut_by_id(id)?;
        assert!(
            entry.entry_type.matches_mode(mode),
            "chmod must not change the file type"
        );
        entry.mode = mode;
        entry.last_metadata_change_time = Timespec::now();
        Ok(())
    }

    /// Returns whether anything changed. `u32::MAX` leaves a field as is,
    /// matching the chown convention.
    pub fn set_uid_gid(&mut self, id: &BlockId, uid: u32, gid: u32) -> Result<bool> {
        let entry = self.get_mut_by_id(id)?;
        let mut changed = false;
        if uid != u32::MAX {
            entry.uid = uid;
            changed = true;
        }
        if gid != u32::MAX {
            entry.gid = gid;
            changed = true;
        }
        if changed {
            entry.last_metadata_change_time = Timespec::now();
        }
        Ok(changed)
    }

    pub fn set_access_times(&mut self, id: &BlockId, atime: Timespec, mtime: Timespec) -> Result<()> {
        let entry = self.get_mut_by_id(id)?;
        entry.last_access_time = atime;
        entry.last_modification_time = mtime;
        entry.last_metadata_change_time = Timespec::now();
        Ok(())
    }

    /// Updates the access timestamp according to the mount's atime policy.
    pub fn update_access_timestamp(
        &mut self,
        id: &BlockId,
        behavior: AtimeUpdateBehavior,
    ) -> Result<()> {
        let entry = self.get_mut_by_id(id)?;
        if behavior.should_update(
            entry.last_access_time,
            entry.last_modification_time,
            entry.entry_type == BlobType::Dir,
        ) {
            entry.last_access_time = Timespec::now();
        }
        Ok(())
    }

    pub fn update_modification_timestamp(&mut self, id: &BlockId) -> Result<()> {
        let entry = self.get_mut_by_id(id)?;
        let now = Timespec::now();
        entry.last_modification_time = now;
        entry.last_metadata_change_time = now;
        Ok(())
    }

    fn insert_sorted(&mut self, entry: DirEntry) {
        let index = self
            .entries
            .binary_search_by(|e| e.id.cmp(&entry.id))
            .unwrap_err();
        self.entries.insert(index, entry);
    }
}

fn new_entry(
    name: &str,
    id: BlockId,
    entry_type: BlobType,
    mode: u32,
    uid: u32,
    gid: u32,
) -> DirEntry {
    assert!(
        entry_type.matches_mode(mode),
        "entry type and mode file-type bits disagree"
    );
    let now = Timespec::now();
    DirEntry {
        entry_type,
        name: name.to_string(),
        id,
        mode,
        uid,
        gid,
        last_access_time: now,
        last_modification_time: now,
        last_metadata_change_time: now,
    }
}

fn check_overwrite_compatibility(existing: BlobType, new: BlobType) -> Result<()> {
    match (existing == BlobType::Dir, new == BlobType::Dir) {
        (true, false) => Err(FsError::IsADirectory.into()),
        (false, true) => Err(FsError::NotADirectory.into()),
        _ => Ok(()),
    }
}
