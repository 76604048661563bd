//! Interpretation of blobs as files, directories and symlinks.
//!
//! Every filesystem blob starts with a header:
//!
//! - format (16 bits, little endian)
//! - kind (8 bits) - see [`EntryKind`]
//! - parent blob id (128 bits) - all zeros for the root directory
//!
//! followed by the kind-specific payload.

mod dir;
mod file;
mod symlink;

pub use {
    dir::{DirBlob, DirEntry},
    file::FileBlob,
    symlink::SymlinkBlob,
};

use {
    crate::{
        Error, Result,
        blob::{Blob, NodeStore},
    },
    blockvault_protocol::{BlobId, BlockId, EntryKind, ID_LEN},
    byteorder::{ByteOrder, LE},
    std::sync::Arc,
    tracing::debug,
};

const FS_BLOB_FORMAT: u16 = 1;
const HEADER_LEN: usize = 3 + ID_LEN;
#[expect(clippy::as_conversions, reason = "const context")]
pub const FS_BLOB_HEADER_LEN: u64 = HEADER_LEN as u64;
const PARENT_OFFSET: u64 = 3;

fn encode_parent(parent: Option<BlobId>) -> [u8; ID_LEN] {
    parent.map_or([0; ID_LEN], |id| *id.block_id().as_bytes())
}

fn header_bytes(kind: EntryKind, parent: Option<BlobId>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&FS_BLOB_FORMAT.to_le_bytes());
    buf.push(kind.to_u8());
    buf.extend_from_slice(&encode_parent(parent));
    buf
}

fn parse_header(blob: &Blob) -> Result<(EntryKind, Option<BlobId>)> {
    let id = blob.id();
    let invalid = |detail: &str| Error::invalid(format!("blob {id}: {detail}"));
    if blob.size() < FS_BLOB_HEADER_LEN {
        return Err(invalid("blob is shorter than its header"));
    }
    let header = blob.read(0, HEADER_LEN)?;
    let (format, rest) = header.split_at(2);
    let format = LE::read_u16(format);
    if format != FS_BLOB_FORMAT {
        return Err(invalid(&format!("unknown blob format {format}")));
    }
    let (kind, parent) = rest.split_at(1);
    let kind = kind
        .first()
        .copied()
        .map(EntryKind::try_from)
        .ok_or_else(|| invalid("missing kind"))?
        .map_err(|err| invalid(&err.to_string()))?;
    let parent = BlockId::from_slice(parent)?;
    let parent = (parent.as_bytes() != &[0; ID_LEN]).then_some(BlobId(parent));
    Ok((kind, parent))
}

fn write_parent(blob: &mut Blob, parent: Option<BlobId>) -> Result<()> {
    blob.write(PARENT_OFFSET, &encode_parent(parent))
}

/// A loaded filesystem blob of any kind.
pub enum FsBlob {
    File(FileBlob),
    Dir(DirBlob),
    Symlink(SymlinkBlob),
}

impl FsBlob {
    #[must_use]
    #[inline]
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::File(_) => EntryKind::File,
            Self::Dir(_) => EntryKind::Directory,
            Self::Symlink(_) => EntryKind::Symlink,
        }
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> BlobId {
        match self {
            Self::File(blob) => blob.id(),
            Self::Dir(blob) => blob.id(),
            Self::Symlink(blob) => blob.id(),
        }
    }

    #[must_use]
    #[inline]
    pub fn parent(&self) -> Option<BlobId> {
        match self {
            Self::File(blob) => blob.parent(),
            Self::Dir(blob) => blob.parent(),
            Self::Symlink(blob) => blob.parent(),
        }
    }

    #[inline]
    pub fn set_parent(&mut self, parent: BlobId) -> Result<()> {
        match self {
            Self::File(blob) => blob.set_parent(parent),
            Self::Dir(blob) => blob.set_parent(parent),
            Self::Symlink(blob) => blob.set_parent(parent),
        }
    }

    /// Size reported by `stat`: content length for files, target length for symlinks.
    #[must_use]
    #[inline]
    pub fn stat_size(&self) -> u64 {
        match self {
            Self::File(blob) => blob.size(),
            Self::Dir(blob) => blob.payload_size(),
            Self::Symlink(blob) => u64::try_from(blob.target().len()).unwrap_or(u64::MAX),
        }
    }

    #[inline]
    pub fn into_dir(self, path: &str) -> Result<DirBlob> {
        match self {
            Self::Dir(dir) => Ok(dir),
            _ => Err(Error::NotADirectory(path.into())),
        }
    }

    #[inline]
    pub fn into_file(self, path: &str) -> Result<FileBlob> {
        match self {
            Self::File(file) => Ok(file),
            Self::Dir(_) => Err(Error::IsADirectory(path.into())),
            Self::Symlink(_) => Err(Error::InvalidArgument(format!("{path} is a symlink"))),
        }
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        match self {
            Self::File(blob) => blob.flush(),
            Self::Dir(blob) => blob.flush(),
            Self::Symlink(blob) => blob.flush(),
        }
    }

    #[inline]
    pub fn remove(self) -> Result<()> {
        match self {
            Self::File(blob) => blob.remove(),
            Self::Dir(blob) => blob.remove(),
            Self::Symlink(blob) => blob.remove(),
        }
    }
}

/// Creates and loads filesystem blobs.
pub struct FsBlobStore {
    nodes: Arc<NodeStore>,
}

impl FsBlobStore {
    #[must_use]
    #[inline]
    pub fn new(nodes: Arc<NodeStore>) -> Self {
        Self { nodes }
    }

    #[must_use]
    #[inline]
    pub fn nodes(&self) -> &Arc<NodeStore> {
        &self.nodes
    }

    fn create_blob(&self, kind: EntryKind, parent: Option<BlobId>, payload: &[u8]) -> Result<Blob> {
        let mut blob = Blob::create(Arc::clone(&self.nodes))?;
        let mut data = header_bytes(kind, parent);
        data.extend_from_slice(payload);
        blob.write(0, &data)?;
        debug!(blob = %blob.id(), %kind, "created fs blob");
        Ok(blob)
    }

    #[inline]
    pub fn create_file(&self, parent: BlobId) -> Result<FileBlob> {
        let blob = self.create_blob(EntryKind::File, Some(parent), &[])?;
        Ok(FileBlob::new(blob, Some(parent)))
    }

    /// `parent` is `None` only for the root directory.
    #[inline]
    pub fn create_dir(&self, parent: Option<BlobId>) -> Result<DirBlob> {
        let blob = self.create_blob(EntryKind::Directory, parent, &[])?;
        DirBlob::load(blob, parent)
    }

    #[inline]
    pub fn create_symlink(&self, parent: BlobId, target: &str) -> Result<SymlinkBlob> {
        let blob = self.create_blob(EntryKind::Symlink, Some(parent), target.as_bytes())?;
        SymlinkBlob::load(blob, Some(parent))
    }

    /// Loads a blob of any kind. `None` if the blob doesn't exist.
    #[inline]
    pub fn load(&self, id: &BlobId) -> Result<Option<FsBlob>> {
        let Some(blob) = Blob::load(Arc::clone(&self.nodes), &id.block_id())? else {
            return Ok(None);
        };
        let (kind, parent) = parse_header(&blob)?;
        let blob = match kind {
            EntryKind::File => FsBlob::File(FileBlob::new(blob, parent)),
            EntryKind::Directory => FsBlob::Dir(DirBlob::load(blob, parent)?),
            EntryKind::Symlink => FsBlob::Symlink(SymlinkBlob::load(blob, parent)?),
        };
        Ok(Some(blob))
    }

    /// Like [`Self::load`], but a missing blob means the filesystem is corrupt.
    #[inline]
    pub fn load_existing(&self, id: &BlobId) -> Result<FsBlob> {
        self.load(id)?
            .ok_or_else(|| Error::invalid(format!("blob {id} is referenced but missing")))
    }

    #[inline]
    pub fn num_blocks(&self) -> Result<u64> {
        self.nodes.blocks().num_blocks()
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.nodes.blocks().flush()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use {
        super::*,
        crate::blockstore::test_util::{TEST_BLOCK_SIZE, store},
    };

    pub fn blob_store() -> FsBlobStore {
        FsBlobStore::new(Arc::new(NodeStore::new(store(TEST_BLOCK_SIZE))))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_util::blob_store};

    #[test]
    fn load_by_kind() {
        let store = blob_store();
        let root = store.create_dir(None).unwrap();
        assert_eq!(root.parent(), None);
        let file = store.create_file(root.id()).unwrap();
        let link = store.create_symlink(root.id(), "/target").unwrap();

        let loaded = store.load(&root.id()).unwrap().unwrap();
        assert_eq!(loaded.kind(), EntryKind::Directory);
        assert_eq!(loaded.parent(), None);

        let loaded = store.load(&file.id()).unwrap().unwrap();
        assert_eq!(loaded.kind(), EntryKind::File);
        assert_eq!(loaded.parent(), Some(root.id()));
        assert!(matches!(
            loaded.into_dir("/file"),
            Err(Error::NotADirectory(_))
        ));

        let loaded = store.load(&link.id()).unwrap().unwrap();
        assert_eq!(loaded.kind(), EntryKind::Symlink);
        assert_eq!(loaded.stat_size(), 7);

        assert!(store.load(&BlobId(BlockId::random())).unwrap().is_none());
        assert!(matches!(
            store.load_existing(&BlobId(BlockId::random())),
            Err(Error::FilesystemInvalid(_))
        ));
    }

    #[test]
    fn reparent() {
        let store = blob_store();
        let a = store.create_dir(None).unwrap();
        let b = store.create_dir(None).unwrap();
        let file = store.create_file(a.id()).unwrap();
        let mut loaded = store.load(&file.id()).unwrap().unwrap();
        loaded.set_parent(b.id()).unwrap();
        assert_eq!(
            store.load(&file.id()).unwrap().unwrap().parent(),
            Some(b.id())
        );
    }
}
