use super::{write_parent, HEADER_SIZE};
use crate::blobstore::{Blob, BlobId};
use crate::blockstore::BlockStore;
use crate::error::Result;

/// A regular file: raw bytes behind the blob header.
pub struct FileBlob<B: BlockStore> {
    blob: Blob<B>,
    parent: BlobId,
}

impl<B: BlockStore> FileBlob<B> {
    pub(super) fn new(blob: Blob<B>, parent: BlobId) -> Self {
        Self { blob, parent }
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

    pub fn num_bytes(&self) -> Result<u64> {
        Ok(self.blob.size()? - HEADER_SIZE)
    }

    /// Best-effort read; returns the number of bytes read (0 past EOF).
    pub fn read(&self, target: &mut [u8], offset: u64) -> Result<usize> {
        self.blob.try_read(target, HEADER_SIZE + offset)
    }

    pub fn write(&mut self, source: &[u8], offset: u64) -> Result<()> {
        self.blob.write(source, HEADER_SIZE + offset)
    }

    pub fn resize(&mut self, new_num_bytes: u64) -> Result<()> {
        self.blob.resize(HEADER_SIZE + new_num_bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.blob.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fsblobstore;
    use super::*;
    use crate::blockstore::BlockId;

    #[test]
    fn starts_empty() {
        let (store, root) = fsblobstore();
        let file = store
            .create_file_blob(&root, super::super::Metadata::new(0o100644, 0, 0))
            .unwrap();
        assert_eq!(file.num_bytes().unwrap(), 0);
    }

    #[test]
    fn write_and_read() {
        let (store, root) = fsblobstore();
        let mut file = store
            .create_file_blob(&root, super::super::Metadata::new(0o100644, 0, 0))
            .unwrap();
        file.write(b"file content", 0).unwrap();
        assert_eq!(file.num_bytes().unwrap(), 12);

        let mut buffer = [0u8; 12];
        assert_eq!(file.read(&mut buffer, 0).unwrap(), 12);
        assert_eq!(&buffer, b"file content");

        // Reads past the end are clamped.
        assert_eq!(file.read(&mut buffer, 8).unwrap(), 4);
        assert_eq!(&buffer[..4], b"tent");
        assert_eq!(file.read(&mut buffer, 100).unwrap(), 0);
    }

    #[test]
    fn truncate_and_sparse_write() {
        let (store, root) = fsblobstore();
        let mut file = store
            .create_file_blob(&root, super::super::Metadata::new(0o100644, 0, 0))
            .unwrap();
        file.write(b"xyz", 1000).unwrap();
        assert_eq!(file.num_bytes().unwrap(), 1003);
        let mut buffer = [0u8; 4];
        file.read(&mut buffer, 999).unwrap();
        assert_eq!(&buffer, b"\0xyz");

        file.resize(2).unwrap();
        assert_eq!(file.num_bytes().unwrap(), 2);
    }

    #[test]
    fn parent_pointer_is_updatable() {
        let (store, root) = fsblobstore();
        let mut file = store
            .create_file_blob(&root, super::super::Metadata::new(0o100644, 0, 0))
            .unwrap();
        assert_eq!(file.parent(), root);
        let new_parent = BlockId::random();
        file.set_parent(&new_parent).unwrap();
        let id = file.blob_id();
        drop(file);

        let mut reloaded = store.load(&id).unwrap().unwrap();
        assert_eq!(reloaded.parent(), new_parent);
        assert!(reloaded.as_file().is_ok());
    }
}
