use {
    super::{FS_BLOB_HEADER_LEN, write_parent},
    crate::{Error, Result, blob::Blob},
    blockvault_protocol::BlobId,
};

/// A symbolic link. The payload is the UTF-8 target.
pub struct SymlinkBlob {
    blob: Blob,
    parent: Option<BlobId>,
    target: String,
}

impl SymlinkBlob {
    pub(super) fn load(blob: Blob, parent: Option<BlobId>) -> Result<Self> {
        let invalid = |detail: &str| Error::invalid(format!("symlink {}: {detail}", blob.id()));
        let len = usize::try_from(blob.size().saturating_sub(FS_BLOB_HEADER_LEN))
            .map_err(|_| invalid("target is too long"))?;
        let target = String::from_utf8(blob.read(FS_BLOB_HEADER_LEN, len)?)
            .map_err(|_| invalid("target is not UTF-8"))?;
        Ok(Self {
            blob,
            parent,
            target,
        })
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
    pub fn target(&self) -> &str {
        &self.target
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
