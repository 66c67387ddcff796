use super::write_parent;
use crate::blobstore::{Blob, BlobId};
use crate::blockstore::BlockStore;
use crate::error::Result;

/// A symbolic link: the UTF-8 target path behind the blob header, no
/// terminator.
pub struct SymlinkBlob<B: BlockStore> {
    blob: Blob<B>,
    parent: BlobId,
    target: String,
}

impl<B: BlockStore> SymlinkBlob<B> {
    pub(super) fn new(blob: Blob<B>, parent: BlobId, target: String) -> Self {
        Self { blob, parent, target }
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

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn flush(&mut self) -> Result<()> {
        self.blob.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fsblobstore;
    use super::super::Metadata;

    #[test]
    fn target_roundtrip() {
        let (store, root) = fsblobstore();
        let link = store
            .create_symlink_blob("/some/../target path", &root, Metadata::new(0o120777, 0, 0))
            .unwrap();
        let id = link.blob_id();
        drop(link);

        let mut reloaded = store.load(&id).unwrap().unwrap();
        let link = reloaded.as_symlink().unwrap();
        assert_eq!(link.target(), "/some/../target path");
        assert_eq!(link.parent(), root);
    }
}
