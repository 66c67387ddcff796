//! Bottom of the stack: one file per block in the base directory, named by
//! the uppercase hex block id. Contents are a two-byte format header followed
//! by the raw block bytes; the block size is implicit in the file length.

use super::{BlockId, BlockStore, RemoveResult, TryCreateResult};
use crate::error::{Error, Result};
use log::warn;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

const FORMAT_VERSION: u16 = 0;
const HEADER_SIZE: usize = 2;

pub struct OnDiskBlockStore {
    basedir: PathBuf,
}

impl OnDiskBlockStore {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    fn block_path(&self, id: &BlockId) -> PathBuf {
        self.basedir.join(id.to_hex())
    }

    fn serialize(data: &[u8]) -> Vec<u8> {
        let mut file_content = Vec::with_capacity(HEADER_SIZE + data.len());
        file_content.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        file_content.extend_from_slice(data);
        file_content
    }

    fn deserialize(id: &BlockId, file_content: &[u8]) -> Result<Vec<u8>> {
        if file_content.len() < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "block file {id} is {} bytes, too short for the format header",
                file_content.len()
            )));
        }
        let version = u16::from_le_bytes([file_content[0], file_content[1]]);
        if version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "block file {id} has unsupported format version {version}"
            )));
        }
        Ok(file_content[HEADER_SIZE..].to_vec())
    }
}

impl BlockStore for OnDiskBlockStore {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        let path = self.block_path(id);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Ok(TryCreateResult::AlreadyExists)
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(&Self::serialize(data))?;
        Ok(TryCreateResult::Created)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.block_path(id)) {
            Ok(file_content) => Ok(Some(Self::deserialize(id, &file_content)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        // Full-file rewrite. Blocks are small and fixed-size, so this is a
        // single write syscall and never leaves a half-old half-new block.
        fs::write(self.block_path(id), Self::serialize(data))?;
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        match fs::remove_file(self.block_path(id)) {
            Ok(()) => Ok(RemoveResult::Removed),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok(RemoveResult::NotRemovedBecauseItDoesntExist)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        Ok(self.block_path(id).is_file())
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.all_block_ids()?.len() as u64)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        estimate_free_bytes(&self.basedir)
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        physical
            .checked_sub(HEADER_SIZE as u64)
            .ok_or_else(|| Error::Corruption(format!("physical block size {physical} too small")))
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.basedir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(BlockId::from_hex) {
                Some(id) => ids.push(id),
                // The config file and stray files live here too; skip them.
                None => continue,
            }
        }
        Ok(ids)
    }
}

#[cfg(unix)]
fn estimate_free_bytes(path: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Io(io::Error::from(ErrorKind::InvalidInput)))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        warn!("statvfs on {} failed: {err}", path.display());
        return Err(err.into());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn estimate_free_bytes(_path: &Path) -> Result<u64> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, OnDiskBlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn roundtrip() {
        let (_dir, store) = store();
        let id = store.create(b"block data").unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(b"block data".to_vec()));
    }

    #[test]
    fn file_is_named_by_uppercase_hex_id() {
        let (dir, store) = store();
        let id = store.create(b"x").unwrap();
        assert!(dir.path().join(id.to_hex()).is_file());
    }

    #[test]
    fn file_layout_is_header_plus_payload() {
        let (dir, store) = store();
        let id = store.create(b"payload").unwrap();
        let file_content = fs::read(dir.path().join(id.to_hex())).unwrap();
        assert_eq!(&file_content[..2], &0u16.to_le_bytes());
        assert_eq!(&file_content[2..], b"payload");
    }

    #[test]
    fn try_create_collision() {
        let (_dir, store) = store();
        let id = store.create(b"first").unwrap();
        assert_eq!(
            store.try_create(&id, b"second").unwrap(),
            TryCreateResult::AlreadyExists
        );
        assert_eq!(store.load(&id).unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn remove_deletes_the_file() {
        let (dir, store) = store();
        let id = store.create(b"data").unwrap();
        assert_eq!(store.remove(&id).unwrap(), RemoveResult::Removed);
        assert_eq!(store.load(&id).unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn enumeration_skips_non_block_files() {
        let (dir, store) = store();
        let id = store.create(b"data").unwrap();
        fs::write(dir.path().join("veilfs.config"), b"not a block").unwrap();
        assert_eq!(store.all_block_ids().unwrap(), vec![id]);
        assert_eq!(store.num_blocks().unwrap(), 1);
    }

    #[test]
    fn corrupt_header_is_an_error() {
        let (dir, store) = store();
        let id = store.create(b"data").unwrap();
        fs::write(dir.path().join(id.to_hex()), [0xFF]).unwrap();
        assert!(store.load(&id).is_err());
    }

    #[test]
    fn block_size_accounts_for_header() {
        let (_dir, store) = store();
        assert_eq!(store.block_size_from_physical_block_size(32832).unwrap(), 32830);
    }
}
