//! Path-addressed filesystem operations.
//!
//! Operations on the same blob are serialized through a lock table keyed by blob
//! id. No lock is held while another one is acquired, except for operations that
//! touch several blobs at once, which lock all of them in id order.

use {
    crate::{
        Error, Result,
        fsblob::{DirBlob, DirEntry, FileBlob, FsBlob, FsBlobStore},
    },
    blockvault_protocol::{BlobId, DateTimeUtc, EntryKind, VaultPath, check_name},
    chrono::Utc,
    parking_lot::{Mutex, RawMutex, lock_api::ArcMutexGuard},
    std::{collections::HashMap, sync::Arc},
    tracing::{debug, warn},
};

type BlobGuard = ArcMutexGuard<RawMutex, ()>;

/// Unused lock table entries are dropped once the table grows past this.
const LOCK_TABLE_PRUNE_LEN: usize = 1024;

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const SYMLINK_MODE: u32 = 0o777;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub blob_id: BlobId,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: DateTimeUtc,
    pub mtime: DateTimeUtc,
    pub ctime: DateTimeUtc,
}

impl Stat {
    fn new(entry: &DirEntry, size: u64) -> Self {
        Self {
            blob_id: entry.blob_id,
            kind: entry.kind,
            size,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
        }
    }

    /// Permission bits combined with the file type bits.
    #[must_use]
    #[inline]
    pub fn st_mode(&self) -> u32 {
        let file_type = match self.kind {
            EntryKind::File => libc::S_IFREG,
            EntryKind::Directory => libc::S_IFDIR,
            EntryKind::Symlink => libc::S_IFLNK,
        };
        u32::from(file_type) | (self.mode & 0o7777)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: usize,
    /// Plaintext bytes per block.
    pub payload_size: usize,
    pub num_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoveMode {
    Recursive,
    File,
    EmptyDir,
}

fn split(path: &VaultPath) -> Result<(VaultPath, &str)> {
    match (path.parent(), path.last_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(Error::InvalidArgument(
            "operation is not supported on the root directory".into(),
        )),
    }
}

pub struct Device {
    store: FsBlobStore,
    root: BlobId,
    owner: (u32, u32),
    locks: Mutex<HashMap<BlobId, Arc<Mutex<()>>>>,
}

impl Device {
    #[must_use]
    #[inline]
    pub fn new(store: FsBlobStore, root: BlobId) -> Self {
        Self {
            store,
            root,
            owner: (0, 0),
            locks: Mutex::default(),
        }
    }

    /// Owner assigned to new entries and reported for the root directory.
    #[must_use]
    #[inline]
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = (uid, gid);
        self
    }

    #[must_use]
    #[inline]
    pub fn root(&self) -> BlobId {
        self.root
    }

    #[must_use]
    #[inline]
    pub fn store(&self) -> &FsBlobStore {
        &self.store
    }

    fn lock(&self, id: BlobId) -> BlobGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            if locks.len() > LOCK_TABLE_PRUNE_LEN {
                locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            }
            Arc::clone(locks.entry(id).or_default())
        };
        mutex.lock_arc()
    }

    fn lock_all(&self, ids: impl IntoIterator<Item = BlobId>) -> Vec<BlobGuard> {
        let mut ids: Vec<BlobId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|id| self.lock(id)).collect()
    }

    fn load_dir(&self, id: &BlobId, path: &VaultPath) -> Result<DirBlob> {
        self.store.load_existing(id)?.into_dir(path.as_str())
    }

    fn load_file(&self, id: &BlobId) -> Result<FileBlob> {
        self.store.load_existing(id)?.into_file(&id.to_string())
    }

    /// Walks `path` from the root directory and returns the id of the blob it names.
    fn resolve_id(&self, path: &VaultPath) -> Result<BlobId> {
        let mut current = self.root;
        let mut walked = VaultPath::root();
        for name in path.components() {
            let dir = {
                let _guard = self.lock(current);
                self.load_dir(&current, &walked)?
            };
            walked = walked.join_one(name)?;
            current = dir
                .get_entry(name)
                .ok_or_else(|| Error::NotFound(walked.to_string()))?
                .blob_id;
        }
        Ok(current)
    }

    #[inline]
    pub fn resolve(&self, path: &VaultPath) -> Result<FsBlob> {
        let id = self.resolve_id(path)?;
        let _guard = self.lock(id);
        self.store.load_existing(&id)
    }

    /// Parent directory id and a copy of the entry naming `path`.
    fn lookup(&self, path: &VaultPath) -> Result<(BlobId, DirEntry)> {
        let (parent, name) = split(path)?;
        let parent_id = self.resolve_id(&parent)?;
        let _guard = self.lock(parent_id);
        let dir = self.load_dir(&parent_id, &parent)?;
        let entry = dir
            .get_entry(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok((parent_id, entry))
    }

    fn create_entry(
        &self,
        path: &VaultPath,
        kind: EntryKind,
        mode: u32,
        create: impl FnOnce(BlobId) -> Result<FsBlob>,
    ) -> Result<BlobId> {
        let (parent, name) = split(path)?;
        check_name(name).map_err(|_| Error::InvalidName(name.into()))?;
        let parent_id = self.resolve_id(&parent)?;
        let _guard = self.lock(parent_id);
        let mut dir = self.load_dir(&parent_id, &parent)?;
        if dir.get_entry(name).is_some() {
            return Err(Error::NameConflict(path.to_string()));
        }
        let blob = create(parent_id)?;
        let id = blob.id();
        let mut entry = DirEntry::new(kind, name.into(), id, mode);
        (entry.uid, entry.gid) = self.owner;
        dir.add_entry(entry)?;
        dir.flush()?;
        debug!(%path, blob = %id, %kind, "created entry");
        Ok(id)
    }

    #[inline]
    pub fn create_file(&self, path: &VaultPath, mode: u32) -> Result<BlobId> {
        self.create_entry(path, EntryKind::File, mode, |parent| {
            self.store.create_file(parent).map(FsBlob::File)
        })
    }

    #[inline]
    pub fn create_dir(&self, path: &VaultPath, mode: u32) -> Result<BlobId> {
        self.create_entry(path, EntryKind::Directory, mode, |parent| {
            self.store.create_dir(Some(parent)).map(FsBlob::Dir)
        })
    }

    #[inline]
    pub fn create_symlink(&self, path: &VaultPath, target: &str) -> Result<BlobId> {
        if target.is_empty() {
            return Err(Error::InvalidArgument("symlink target cannot be empty".into()));
        }
        self.create_entry(path, EntryKind::Symlink, SYMLINK_MODE, |parent| {
            self.store.create_symlink(parent, target).map(FsBlob::Symlink)
        })
    }

    /// Removes `path` and everything below it.
    ///
    /// The entry is unlinked and flushed before any blob is deleted, so an
    /// interrupted removal leaves unreachable blocks rather than a dangling entry.
    #[inline]
    pub fn remove(&self, path: &VaultPath) -> Result<()> {
        self.remove_with(path, RemoveMode::Recursive)
    }

    /// Removes a file or symlink.
    #[inline]
    pub fn unlink(&self, path: &VaultPath) -> Result<()> {
        self.remove_with(path, RemoveMode::File)
    }

    /// Removes an empty directory.
    #[inline]
    pub fn rmdir(&self, path: &VaultPath) -> Result<()> {
        self.remove_with(path, RemoveMode::EmptyDir)
    }

    fn remove_with(&self, path: &VaultPath, mode: RemoveMode) -> Result<()> {
        let (parent, name) = split(path)?;
        let (parent_id, entry) = self.lookup(path)?;
        let removed = {
            let _guards = self.lock_all([parent_id, entry.blob_id]);
            let mut dir = self.load_dir(&parent_id, &parent)?;
            if dir.get_entry(name).map(|current| current.blob_id) != Some(entry.blob_id) {
                return Err(Error::NotFound(path.to_string()));
            }
            match mode {
                RemoveMode::Recursive => {}
                RemoveMode::File => {
                    if entry.kind == EntryKind::Directory {
                        return Err(Error::IsADirectory(path.to_string()));
                    }
                }
                RemoveMode::EmptyDir => {
                    if entry.kind != EntryKind::Directory {
                        return Err(Error::NotADirectory(path.to_string()));
                    }
                    if !self.load_dir(&entry.blob_id, path)?.is_empty() {
                        return Err(Error::DirectoryNotEmpty(path.to_string()));
                    }
                }
            }
            let removed = dir.remove_entry(name)?;
            dir.flush()?;
            removed
        };
        self.delete_tree(removed.blob_id)?;
        self.store.flush()?;
        debug!(%path, blob = %removed.blob_id, "removed entry");
        Ok(())
    }

    /// Deletes an unlinked blob and all its descendants, children first.
    ///
    /// The tree is already unlinked, so only one blob is locked at a time.
    fn delete_tree(&self, id: BlobId) -> Result<()> {
        let loaded = {
            let _guard = self.lock(id);
            self.store.load(&id)?
        };
        let Some(blob) = loaded else {
            warn!(blob = %id, "blob scheduled for deletion is already missing");
            return Ok(());
        };
        if let FsBlob::Dir(dir) = &blob {
            for entry in dir.entries() {
                self.delete_tree(entry.blob_id)?;
            }
        }
        let _guard = self.lock(id);
        blob.remove()
    }

    /// Id of the entry `name` in the directory `dir_id`, if there is one.
    fn entry_id(
        &self,
        dir_id: BlobId,
        dir_path: &VaultPath,
        name: &str,
    ) -> Result<Option<BlobId>> {
        let _guard = self.lock(dir_id);
        Ok(self
            .load_dir(&dir_id, dir_path)?
            .get_entry(name)
            .map(|entry| entry.blob_id))
    }

    /// Checks whether the entry `name` in `dir` may be replaced by `moved`.
    /// Returns the entry to replace, if any. The caller holds the lock of that entry.
    fn replaceable(
        &self,
        dir: &DirBlob,
        name: &str,
        moved: &DirEntry,
        to: &VaultPath,
    ) -> Result<Option<DirEntry>> {
        let Some(existing) = dir.get_entry(name) else {
            return Ok(None);
        };
        match (
            moved.kind == EntryKind::Directory,
            existing.kind == EntryKind::Directory,
        ) {
            (true, false) => Err(Error::NotADirectory(to.to_string())),
            (false, true) => Err(Error::IsADirectory(to.to_string())),
            (true, true) => {
                if self.load_dir(&existing.blob_id, to)?.is_empty() {
                    Ok(Some(existing.clone()))
                } else {
                    Err(Error::DirectoryNotEmpty(to.to_string()))
                }
            }
            (false, false) => Ok(Some(existing.clone())),
        }
    }

    /// Moves `from` to `to`, replacing a compatible existing target.
    ///
    /// Blob contents are never copied: the moved blob keeps its id.
    #[inline]
    pub fn rename(&self, from: &VaultPath, to: &VaultPath) -> Result<()> {
        let (from_parent, from_name) = split(from)?;
        let (to_parent, to_name) = split(to)?;
        check_name(to_name).map_err(|_| Error::InvalidName(to_name.into()))?;
        if from == to {
            self.lookup(from)?;
            return Ok(());
        }
        if to.starts_with(from) {
            return Err(Error::InvalidArgument(format!(
                "cannot move {from} into its own subdirectory {to}"
            )));
        }
        let from_parent_id = self.resolve_id(&from_parent)?;
        let to_parent_id = self.resolve_id(&to_parent)?;

        let (moved_id, replaced) = loop {
            // Locks the target too. Retries if it changed before locking.
            let target = self.entry_id(to_parent_id, &to_parent, to_name)?;
            let _guards = self.lock_all([from_parent_id, to_parent_id].into_iter().chain(target));
            let mut from_dir = self.load_dir(&from_parent_id, &from_parent)?;
            let entry = from_dir
                .get_entry(from_name)
                .cloned()
                .ok_or_else(|| Error::NotFound(from.to_string()))?;
            if from_parent_id == to_parent_id {
                if from_dir.get_entry(to_name).map(|existing| existing.blob_id) != target {
                    debug!(%to, "rename target changed, retrying");
                    continue;
                }
                let replaced = self.replaceable(&from_dir, to_name, &entry, to)?;
                if replaced.is_some() {
                    from_dir.remove_entry(to_name)?;
                }
                from_dir.rename_entry(from_name, to_name)?;
                from_dir.flush()?;
                break (None, replaced);
            }
            let mut to_dir = self.load_dir(&to_parent_id, &to_parent)?;
            if to_dir.get_entry(to_name).map(|existing| existing.blob_id) != target {
                debug!(%to, "rename target changed, retrying");
                continue;
            }
            let replaced = self.replaceable(&to_dir, to_name, &entry, to)?;
            let mut moved = from_dir.remove_entry(from_name)?;
            from_dir.flush()?;
            if replaced.is_some() {
                to_dir.remove_entry(to_name)?;
            }
            to_name.clone_into(&mut moved.name);
            moved.ctime = Utc::now();
            let moved_id = moved.blob_id;
            to_dir.add_entry(moved)?;
            to_dir.flush()?;
            break (Some(moved_id), replaced);
        };

        if let Some(moved_id) = moved_id {
            let _guard = self.lock(moved_id);
            let mut blob = self.store.load_existing(&moved_id)?;
            blob.set_parent(to_parent_id)?;
            blob.flush()?;
        }
        if let Some(replaced) = replaced {
            self.delete_tree(replaced.blob_id)?;
            self.store.flush()?;
        }
        debug!(%from, %to, "renamed");
        Ok(())
    }

    #[inline]
    pub fn stat(&self, path: &VaultPath) -> Result<Stat> {
        if path.is_root() {
            let size = {
                let _guard = self.lock(self.root);
                self.load_dir(&self.root, path)?.payload_size()
            };
            return Ok(Stat {
                blob_id: self.root,
                kind: EntryKind::Directory,
                size,
                mode: DEFAULT_DIR_MODE,
                uid: self.owner.0,
                gid: self.owner.1,
                atime: DateTimeUtc::UNIX_EPOCH,
                mtime: DateTimeUtc::UNIX_EPOCH,
                ctime: DateTimeUtc::UNIX_EPOCH,
            });
        }
        let (_, entry) = self.lookup(path)?;
        let _guard = self.lock(entry.blob_id);
        let blob = self.store.load_existing(&entry.blob_id)?;
        Ok(Stat::new(&entry, blob.stat_size()))
    }

    /// Entries of a directory in stored order.
    #[inline]
    pub fn read_dir(&self, path: &VaultPath) -> Result<Vec<DirEntry>> {
        let id = self.resolve_id(path)?;
        let _guard = self.lock(id);
        Ok(self.load_dir(&id, path)?.entries().cloned().collect())
    }

    #[inline]
    pub fn read_link(&self, path: &VaultPath) -> Result<String> {
        match self.resolve(path)? {
            FsBlob::Symlink(link) => Ok(link.target().into()),
            FsBlob::File(_) | FsBlob::Dir(_) => {
                Err(Error::InvalidArgument(format!("{path} is not a symlink")))
            }
        }
    }

    fn update_entry(
        &self,
        path: &VaultPath,
        update: impl FnOnce(&mut DirBlob, &str) -> Result<()>,
    ) -> Result<()> {
        let (parent, name) = split(path)?;
        let parent_id = self.resolve_id(&parent)?;
        let _guard = self.lock(parent_id);
        let mut dir = self.load_dir(&parent_id, &parent)?;
        if dir.get_entry(name).is_none() {
            return Err(Error::NotFound(path.to_string()));
        }
        update(&mut dir, name)?;
        dir.flush()
    }

    #[inline]
    pub fn set_mode(&self, path: &VaultPath, mode: u32) -> Result<()> {
        self.update_entry(path, |dir, name| dir.set_mode(name, mode))
    }

    #[inline]
    pub fn set_owner(&self, path: &VaultPath, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.update_entry(path, |dir, name| dir.set_owner(name, uid, gid))
    }

    /// `None` leaves the corresponding timestamp unchanged.
    #[inline]
    pub fn set_times(
        &self,
        path: &VaultPath,
        atime: Option<DateTimeUtc>,
        mtime: Option<DateTimeUtc>,
    ) -> Result<()> {
        self.update_entry(path, |dir, name| dir.set_times(name, atime, mtime))
    }

    /// Id of the file at `path`.
    #[inline]
    pub fn open_file(&self, path: &VaultPath) -> Result<BlobId> {
        let (_, entry) = self.lookup(path)?;
        match entry.kind {
            EntryKind::File => Ok(entry.blob_id),
            EntryKind::Directory => Err(Error::IsADirectory(path.to_string())),
            EntryKind::Symlink => Err(Error::InvalidArgument(format!("{path} is a symlink"))),
        }
    }

    /// Reads up to `len` bytes. Returns fewer bytes at the end of the file.
    #[inline]
    pub fn read_file(&self, file: BlobId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _guard = self.lock(file);
        self.load_file(&file)?.read(offset, len)
    }

    #[inline]
    pub fn file_size(&self, file: BlobId) -> Result<u64> {
        let _guard = self.lock(file);
        Ok(self.load_file(&file)?.size())
    }

    /// Stat of a file found through its parent pointer, independent of its current path.
    #[inline]
    pub fn stat_file(&self, file: BlobId) -> Result<Stat> {
        let (parent, size) = {
            let _guard = self.lock(file);
            let blob = self.load_file(&file)?;
            (blob.parent(), blob.size())
        };
        let parent =
            parent.ok_or_else(|| Error::invalid(format!("file {file} has no parent")))?;
        let _guard = self.lock(parent);
        let dir = self.store.load_existing(&parent)?.into_dir(&parent.to_string())?;
        let entry = dir
            .get_entry_by_id(&file)
            .ok_or_else(|| Error::NotFound(format!("file {file} is no longer linked")))?;
        Ok(Stat::new(entry, size))
    }

    #[inline]
    pub fn write_file(&self, file: BlobId, offset: u64, data: &[u8]) -> Result<()> {
        let parent = {
            let _guard = self.lock(file);
            let mut blob = self.load_file(&file)?;
            blob.write(offset, data)?;
            blob.parent()
        };
        self.touch(parent, file)
    }

    #[inline]
    pub fn truncate_file(&self, file: BlobId, size: u64) -> Result<()> {
        let parent = {
            let _guard = self.lock(file);
            let mut blob = self.load_file(&file)?;
            blob.truncate(size)?;
            blob.parent()
        };
        self.touch(parent, file)
    }

    /// Updates the modification time in the entry of `file`.
    fn touch(&self, parent: Option<BlobId>, file: BlobId) -> Result<()> {
        let Some(parent) = parent else {
            return Ok(());
        };
        let _guard = self.lock(parent);
        let Some(FsBlob::Dir(mut dir)) = self.store.load(&parent)? else {
            debug!(blob = %file, "parent of written file is gone");
            return Ok(());
        };
        match dir.touch_by_id(&file) {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => {
                debug!(blob = %file, "written file is no longer linked");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[inline]
    pub fn statfs(&self) -> Result<StatFs> {
        let blocks = self.store.nodes().blocks();
        Ok(StatFs {
            block_size: blocks.block_size(),
            payload_size: blocks.payload_size(),
            num_blocks: self.store.num_blocks()?,
        })
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}
