use {
    super::{FS_BLOB_HEADER_LEN, write_parent},
    crate::{Result, blob::Blob},
    blockvault_protocol::BlobId,
};

/// File contents, stored right after the blob header.
pub struct FileBlob {
    blob: Blob,
    parent: Option<BlobId>,
}

impl FileBlob {
    pub(super) fn new(blob: Blob, parent: Option<BlobId>) -> Self {
        Self { blob, parent }
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> BlobId {
        BlobId(self.blob.id())
    }

    #[must_use]
    #[inline]
    pub fn parent(&self) -> Option<BlobId> {
        self.parent
    }

    #[inline]
    pub fn set_parent(&mut self, parent: BlobId) -> Result<()> {
        write_parent(&mut self.blob, Some(parent))?;
        self.parent = Some(parent);
        Ok(())
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        self.blob.size().saturating_sub(FS_BLOB_HEADER_LEN)
    }

    /// Reads up to `len` bytes at `offset`. Returns fewer bytes at the end of the file.
    #[inline]
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.blob
            .try_read(offset.saturating_add(FS_BLOB_HEADER_LEN), len)
    }

    #[inline]
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.blob
            .write(offset.saturating_add(FS_BLOB_HEADER_LEN), data)
    }

    #[inline]
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.blob.resize(size.saturating_add(FS_BLOB_HEADER_LEN))
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.blob.flush()
    }

    #[inline]
    pub fn remove(self) -> Result<()> {
        self.blob.remove()
    }
}
