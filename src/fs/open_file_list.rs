use crate::blobstore::BlobId;
use crate::error::{FsError, Result};
use std::collections::HashMap;

/// An opened file: the blob it refers to plus the directory it was opened
/// under (the entry there carries the timestamps to maintain).
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub blob_id: BlobId,
    pub parent_id: BlobId,
}

/// Numbered descriptors handed to the kernel interface.
#[derive(Debug, Default)]
pub struct OpenFileList {
    files: HashMap<u64, OpenFile>,
    next_descriptor: u64,
}

impl OpenFileList {
    pub fn open(&mut self, file: OpenFile) -> u64 {
        let descriptor = self.next_descriptor;
        self.next_descriptor += 1;
        self.files.insert(descriptor, file);
        descriptor
    }

    pub fn get(&self, descriptor: u64) -> Result<OpenFile> {
        self.files
            .get(&descriptor)
            .copied()
            .ok_or_else(|| FsError::BadFileDescriptor.into())
    }

    pub fn close(&mut self, descriptor: u64) -> Result<()> {
        self.files
            .remove(&descriptor)
            .map(|_| ())
            .ok_or_else(|| FsError::BadFileDescriptor.into())
    }
}
