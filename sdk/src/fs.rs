//! String-path filesystem interface for bindings such as FUSE.
//!
//! Every failure is an [`Error`], and [`Error::to_errno`] gives the errno to report.

use {
    crate::{
        Error, Result,
        device::{DEFAULT_DIR_MODE, Device, Stat, StatFs},
        fsblob::DirEntry,
    },
    blockvault_protocol::{BlobId, DateTimeUtc, MAX_NAME_LEN, VaultPath},
    std::sync::Arc,
    tracing::trace,
};

fn parse_path(path: &str) -> Result<VaultPath> {
    if let Some(name) = path.split('/').find(|name| name.len() > MAX_NAME_LEN) {
        return Err(Error::InvalidName(name.into()));
    }
    path.parse()
        .map_err(|err| Error::InvalidArgument(format!("invalid path {path:?}: {err}")))
}

#[derive(Clone)]
pub struct Filesystem {
    device: Arc<Device>,
}

impl Filesystem {
    #[must_use]
    #[inline]
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    #[must_use]
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn open(&self, path: &str) -> Result<OpenFile> {
        let file = self.device.open_file(&parse_path(path)?)?;
        Ok(OpenFile {
            device: Arc::clone(&self.device),
            file,
        })
    }

    /// Creates an empty file and opens it.
    #[inline]
    pub fn create(&self, path: &str, mode: u32) -> Result<OpenFile> {
        let file = self.device.create_file(&parse_path(path)?, mode)?;
        Ok(OpenFile {
            device: Arc::clone(&self.device),
            file,
        })
    }

    #[inline]
    pub fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.open(path)?.read(offset, len)
    }

    /// Returns the number of bytes written, which is always all of `data`.
    #[inline]
    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        self.open(path)?.write(offset, data)
    }

    #[inline]
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.open(path)?.truncate(size)
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.device.flush()
    }

    #[inline]
    pub fn fsync(&self) -> Result<()> {
        self.device.flush()
    }

    #[inline]
    pub fn stat(&self, path: &str) -> Result<Stat> {
        self.device.stat(&parse_path(path)?)
    }

    #[inline]
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.device.create_dir(&parse_path(path)?, mode)?;
        Ok(())
    }

    /// Creates all missing directories along `path`.
    #[inline]
    pub fn mkdir_all(&self, path: &str) -> Result<()> {
        let path = parse_path(path)?;
        let mut current = VaultPath::root();
        for name in path.components() {
            current = current.join_one(name)?;
            match self.device.create_dir(&current, DEFAULT_DIR_MODE) {
                Ok(_) | Err(Error::NameConflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    #[inline]
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.device.rmdir(&parse_path(path)?)
    }

    /// Removes a path together with everything below it.
    #[inline]
    pub fn remove_all(&self, path: &str) -> Result<()> {
        self.device.remove(&parse_path(path)?)
    }

    #[inline]
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.device.rename(&parse_path(from)?, &parse_path(to)?)
    }

    #[inline]
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.device.unlink(&parse_path(path)?)
    }

    #[inline]
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.device.read_dir(&parse_path(path)?)
    }

    #[inline]
    pub fn symlink(&self, target: &str, path: &str) -> Result<()> {
        self.device.create_symlink(&parse_path(path)?, target)?;
        Ok(())
    }

    #[inline]
    pub fn readlink(&self, path: &str) -> Result<String> {
        self.device.read_link(&parse_path(path)?)
    }

    #[inline]
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.device.set_mode(&parse_path(path)?, mode)
    }

    #[inline]
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.device.set_owner(&parse_path(path)?, uid, gid)
    }

    #[inline]
    pub fn utimens(
        &self,
        path: &str,
        atime: Option<DateTimeUtc>,
        mtime: Option<DateTimeUtc>,
    ) -> Result<()> {
        self.device.set_times(&parse_path(path)?, atime, mtime)
    }

    #[inline]
    pub fn statfs(&self) -> Result<StatFs> {
        self.device.statfs()
    }
}

/// An open regular file. Stays valid across renames of the file.
pub struct OpenFile {
    device: Arc<Device>,
    file: BlobId,
}

impl OpenFile {
    #[must_use]
    #[inline]
    pub fn blob_id(&self) -> BlobId {
        self.file
    }

    #[inline]
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.device.read_file(self.file, offset, len)
    }

    #[inline]
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        trace!(file = %self.file, offset, len = data.len(), "write");
        self.device.write_file(self.file, offset, data)?;
        Ok(data.len())
    }

    #[inline]
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.device.truncate_file(self.file, size)
    }

    #[inline]
    pub fn size(&self) -> Result<u64> {
        self.device.file_size(self.file)
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.device.flush()
    }

    #[inline]
    pub fn fsync(&self) -> Result<()> {
        self.device.flush()
    }

    #[inline]
    pub fn stat(&self) -> Result<Stat> {
        self.device.stat_file(self.file)
    }
}
