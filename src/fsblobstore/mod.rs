//! Filesystem-typed blobs on top of the blob store. Every blob starts with a
//! fixed header `[format version u16 || blob type u8 || parent blob id (16)
//! || mode u32 || uid u32 || gid u32 || atime || mtime || ctime]` (67 bytes);
//! the body depends on the type: raw bytes for files, the UTF-8 target path
//! for symlinks, a serialized [`dir_entries::DirEntryList`] for directories.
//!
//! The directory entry in the parent is the authoritative metadata record;
//! the header copy is written at creation and refreshed when the blob is
//! rewritten anyway.

pub mod cache;
mod dir_blob;
mod dir_entries;
mod file_blob;
pub mod parallel;
mod symlink_blob;

pub use dir_blob::DirBlob;
pub use dir_entries::{DirEntry, DirEntryList};
pub use file_blob::FileBlob;
pub use symlink_blob::SymlinkBlob;

use crate::blobstore::{Blob, BlobId, BlobStore};
use crate::blockstore::parallel::ParallelAccessBlockStore;
use crate::blockstore::{BlockId, BlockStore};
use crate::error::{Error, Result};
use crate::utils::Timespec;
use std::sync::Arc;

pub const HEADER_FORMAT_VERSION: u16 = 0;
pub const HEADER_SIZE: u64 = 67;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobType {
    File = 1,
    Dir = 2,
    Symlink = 3,
}

impl BlobType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(BlobType::File),
            2 => Some(BlobType::Dir),
            3 => Some(BlobType::Symlink),
            _ => None,
        }
    }

    /// Whether the file-type bits of `mode` agree with this type.
    pub fn matches_mode(self, mode: u32) -> bool {
        let file_type = mode & libc::S_IFMT as u32;
        match self {
            BlobType::File => file_type == libc::S_IFREG as u32,
            BlobType::Dir => file_type == libc::S_IFDIR as u32,
            BlobType::Symlink => file_type == libc::S_IFLNK as u32,
        }
    }
}

/// POSIX attributes stored in the blob header and in directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub last_access_time: Timespec,
    pub last_modification_time: Timespec,
    pub last_metadata_change_time: Timespec,
}

impl Metadata {
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = Timespec::now();
        Self {
            mode,
            uid,
            gid,
            last_access_time: now,
            last_modification_time: now,
            last_metadata_change_time: now,
        }
    }
}

/// How the access timestamp reacts to reads, chosen by mount options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtimeUpdateBehavior {
    Noatime,
    #[default]
    Relatime,
    Strictatime,
    Nodiratime,
}

impl AtimeUpdateBehavior {
    pub fn should_update(self, atime: Timespec, mtime: Timespec, is_dir: bool) -> bool {
        match self {
            AtimeUpdateBehavior::Noatime => false,
            AtimeUpdateBehavior::Strictatime => true,
            AtimeUpdateBehavior::Nodiratime => !is_dir,
            AtimeUpdateBehavior::Relatime => {
                // Update if the access time lags the modification time or is
                // older than a day.
                const ONE_DAY_SECS: i64 = 60 * 60 * 24;
                atime < mtime || atime.secs + ONE_DAY_SECS < Timespec::now().secs
            }
        }
    }
}

fn serialize_header(blob_type: BlobType, parent: &BlockId, metadata: &Metadata) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_SIZE as usize);
    header.extend_from_slice(&HEADER_FORMAT_VERSION.to_le_bytes());
    header.push(blob_type as u8);
    header.extend_from_slice(parent.bytes());
    header.extend_from_slice(&metadata.mode.to_le_bytes());
    header.extend_from_slice(&metadata.uid.to_le_bytes());
    header.extend_from_slice(&metadata.gid.to_le_bytes());
    for time in [
        metadata.last_access_time,
        metadata.last_modification_time,
        metadata.last_metadata_change_time,
    ] {
        header.extend_from_slice(&time.secs.to_le_bytes());
        header.extend_from_slice(&time.nanos.to_le_bytes());
    }
    debug_assert_eq!(HEADER_SIZE as usize, header.len());
    header
}

fn deserialize_header(data: &[u8]) -> Result<(BlobType, BlockId, Metadata)> {
    if data.len() < HEADER_SIZE as usize {
        return Err(Error::Corruption("blob too short for its header".to_string()));
    }
    let version = u16::from_le_bytes([data[0], data[1]]);
    if version != HEADER_FORMAT_VERSION {
        return Err(Error::Corruption(format!(
            "blob has unsupported header format version {version}"
        )));
    }
    let blob_type = BlobType::from_byte(data[2])
        .ok_or_else(|| Error::Corruption(format!("unknown blob type {}", data[2])))?;
    let parent = BlockId::from_slice(&data[3..19]).unwrap();
    let mode = u32::from_le_bytes(data[19..23].try_into().unwrap());
    let uid = u32::from_le_bytes(data[23..27].try_into().unwrap());
    let gid = u32::from_le_bytes(data[27..31].try_into().unwrap());
    let mut times = [Timespec::ZERO; 3];
    for (i, time) in times.iter_mut().enumerate() {
        let at = 31 + i * 12;
        time.secs = i64::from_le_bytes(data[at..at + 8].try_into().unwrap());
        time.nanos = u32::from_le_bytes(data[at + 8..at + 12].try_into().unwrap());
    }
    Ok((
        blob_type,
        parent,
        Metadata {
            mode,
            uid,
            gid,
            last_access_time: times[0],
            last_modification_time: times[1],
            last_metadata_change_time: times[2],
        },
    ))
}

/// Rewrites the parent pointer inside an existing blob header.
fn write_parent<B: BlockStore>(blob: &Blob<B>, parent: &BlockId) -> Result<()> {
    blob.write(parent.bytes(), 3)
}

pub enum FsBlob<B: BlockStore> {
    File(FileBlob<B>),
    Dir(DirBlob<B>),
    Symlink(SymlinkBlob<B>),
}

impl<B: BlockStore> FsBlob<B> {
    pub fn blob_id(&self) -> BlobId {
        match self {
            FsBlob::File(blob) => blob.blob_id(),
            FsBlob::Dir(blob) => blob.blob_id(),
            FsBlob::Symlink(blob) => blob.blob_id(),
        }
    }

    pub fn blob_type(&self) -> BlobType {
        match self {
            FsBlob::File(_) => BlobType::File,
            FsBlob::Dir(_) => BlobType::Dir,
            FsBlob::Symlink(_) => BlobType::Symlink,
        }
    }

    pub fn parent(&self) -> BlobId {
        match self {
            FsBlob::File(blob) => blob.parent(),
            FsBlob::Dir(blob) => blob.parent(),
            FsBlob::Symlink(blob) => blob.parent(),
        }
    }

    pub fn set_parent(&mut self, parent: &BlobId) -> Result<()> {
        match self {
            FsBlob::File(blob) => blob.set_parent(parent),
            FsBlob::Dir(blob) => blob.set_parent(parent),
            FsBlob::Symlink(blob) => blob.set_parent(parent),
        }
    }

    pub fn as_dir(&mut self) -> Result<&mut DirBlob<B>> {
        match self {
            FsBlob::Dir(blob) => Ok(blob),
            _ => Err(crate::error::FsError::NotADirectory.into()),
        }
    }

    pub fn as_file(&mut self) -> Result<&mut FileBlob<B>> {
        match self {
            FsBlob::File(blob) => Ok(blob),
            FsBlob::Dir(_) => Err(crate::error::FsError::IsADirectory.into()),
            FsBlob::Symlink(_) => Err(crate::error::FsError::InvalidOperation.into()),
        }
    }

    pub fn as_symlink(&mut self) -> Result<&mut SymlinkBlob<B>> {
        match self {
            FsBlob::Symlink(blob) => Ok(blob),
            _ => Err(crate::error::FsError::InvalidOperation.into()),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            FsBlob::File(blob) => blob.flush(),
            FsBlob::Dir(blob) => blob.flush(),
            FsBlob::Symlink(blob) => blob.flush(),
        }
    }

    /// Forgets unwritten changes so dropping the blob won't write them back.
    /// Used when the blob is about to be destroyed.
    pub fn discard_changes(&mut self) {
        if let FsBlob::Dir(blob) = self {
            blob.discard_changes();
        }
    }
}

pub struct FsBlobStore<B: BlockStore> {
    blobstore: BlobStore<B>,
}

impl<B: BlockStore> FsBlobStore<B> {
    pub fn new(
        store: Arc<ParallelAccessBlockStore<B>>,
        physical_block_size_bytes: u64,
    ) -> Result<Self> {
        Ok(Self {
            blobstore: BlobStore::new(store, physical_block_size_bytes)?,
        })
    }

    pub fn create_file_blob(&self, parent: &BlobId, metadata: Metadata) -> Result<FileBlob<B>> {
        let blob = self.blobstore.create()?;
        blob.write(&serialize_header(BlobType::File, parent, &metadata), 0)?;
        Ok(FileBlob::new(blob, *parent))
    }

    pub fn create_dir_blob(&self, parent: &BlobId, metadata: Metadata) -> Result<DirBlob<B>> {
        let blob = self.blobstore.create()?;
        blob.write(&serialize_header(BlobType::Dir, parent, &metadata), 0)?;
        Ok(DirBlob::new_empty(blob, *parent))
    }

    pub fn create_symlink_blob(
        &self,
        target: &str,
        parent: &BlobId,
        metadata: Metadata,
    ) -> Result<SymlinkBlob<B>> {
        let blob = self.blobstore.create()?;
        let mut content = serialize_header(BlobType::Symlink, parent, &metadata);
        content.extend_from_slice(target.as_bytes());
        blob.write(&content, 0)?;
        Ok(SymlinkBlob::new(blob, *parent, target.to_string()))
    }

    pub fn load(&self, id: &BlobId) -> Result<Option<FsBlob<B>>> {
        let Some(blob) = self.blobstore.load(id)? else {
            return Ok(None);
        };
        let mut header = [0u8; HEADER_SIZE as usize];
        blob.read(&mut header, 0)?;
        let (blob_type, parent, _metadata) = deserialize_header(&header)?;
        Ok(Some(match blob_type {
            BlobType::File => FsBlob::File(FileBlob::new(blob, parent)),
            BlobType::Dir => {
                let content = blob.read_all()?;
                let entries = DirEntryList::deserialize(&content[HEADER_SIZE as usize..])?;
                FsBlob::Dir(DirBlob::new(blob, parent, entries))
            }
            BlobType::Symlink => {
                let content = blob.read_all()?;
                let target = String::from_utf8(content[HEADER_SIZE as usize..].to_vec())
                    .map_err(|_| {
                        Error::Corruption("symlink target is not valid UTF-8".to_string())
                    })?;
                FsBlob::Symlink(SymlinkBlob::new(blob, parent, target))
            }
        }))
    }

    /// Removes the blob and its whole block tree.
    pub fn remove(&self, mut blob: FsBlob<B>) -> Result<()> {
        blob.discard_changes();
        let id = blob.blob_id();
        drop(blob);
        self.blobstore.remove_by_id(&id)
    }

    pub fn remove_by_id(&self, id: &BlobId) -> Result<()> {
        self.blobstore.remove_by_id(id)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.blobstore.num_blocks()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.blobstore.estimate_space_for_num_blocks_left()
    }

    pub fn virtual_block_size_bytes(&self) -> u64 {
        self.blobstore.virtual_block_size_bytes()
    }

    pub fn flush(&self) -> Result<()> {
        self.blobstore.flush()
    }
}
