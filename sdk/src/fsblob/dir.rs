//! Directory blobs.
//!
//! The payload is a sequence of entries in stored order. Entry layout
//! (integers little endian):
//!
//! - kind (8 bits)
//! - mode, uid, gid (32 bits each)
//! - atime, mtime, ctime (64-bit seconds + 32-bit nanoseconds each)
//! - blob id (128 bits)
//! - name length (16 bits)
//! - name (UTF-8)

use {
    super::{FS_BLOB_HEADER_LEN, write_parent},
    crate::{Error, Result, blob::Blob},
    blockvault_protocol::{BlobId, BlockId, DateTimeUtc, EntryKind, ID_LEN, check_name},
    byteorder::{LE, ReadBytesExt},
    chrono::Utc,
    std::io::Read,
};

const ENTRY_FIXED_LEN: usize = 1 + 3 * 4 + 3 * 12 + ID_LEN + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub name: String,
    pub blob_id: BlobId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: DateTimeUtc,
    pub mtime: DateTimeUtc,
    pub ctime: DateTimeUtc,
}

impl DirEntry {
    /// New entry with all timestamps set to now.
    #[must_use]
    #[inline]
    pub fn new(kind: EntryKind, name: String, blob_id: BlobId, mode: u32) -> Self {
        let now = Utc::now();
        Self {
            kind,
            name,
            blob_id,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn encoded_len(&self) -> usize {
        ENTRY_FIXED_LEN.saturating_add(self.name.len())
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| Error::InvalidName(self.name.clone()))?;
        buf.push(self.kind.to_u8());
        for value in [self.mode, self.uid, self.gid] {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        for time in [self.atime, self.mtime, self.ctime] {
            buf.extend_from_slice(&time.timestamp().to_le_bytes());
            buf.extend_from_slice(&time.timestamp_subsec_nanos().to_le_bytes());
        }
        buf.extend_from_slice(self.blob_id.block_id().as_bytes());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        Ok(())
    }

    fn decode(reader: &mut &[u8]) -> anyhow::Result<Self> {
        let kind = EntryKind::try_from(reader.read_u8()?)?;
        let mode = reader.read_u32::<LE>()?;
        let uid = reader.read_u32::<LE>()?;
        let gid = reader.read_u32::<LE>()?;
        let mut times = [DateTimeUtc::UNIX_EPOCH; 3];
        for time in &mut times {
            let secs = reader.read_i64::<LE>()?;
            let nanos = reader.read_u32::<LE>()?;
            *time = DateTimeUtc::from_timestamp(secs, nanos)
                .ok_or_else(|| anyhow::format_err!("invalid timestamp {secs}.{nanos}"))?;
        }
        let [atime, mtime, ctime] = times;
        let mut id = [0; ID_LEN];
        reader.read_exact(&mut id)?;
        let name_len = reader.read_u16::<LE>()?;
        let mut name = vec![0; usize::from(name_len)];
        reader.read_exact(&mut name)?;
        Ok(Self {
            kind,
            name: String::from_utf8(name)?,
            blob_id: BlobId(BlockId::from_bytes(id)),
            mode,
            uid,
            gid,
            atime,
            mtime,
            ctime,
        })
    }
}

/// A directory: the blob plus its decoded entries.
pub struct DirBlob {
    blob: Blob,
    parent: Option<BlobId>,
    entries: Vec<DirEntry>,
}

impl DirBlob {
    pub(super) fn load(blob: Blob, parent: Option<BlobId>) -> Result<Self> {
        let len = blob.size().saturating_sub(FS_BLOB_HEADER_LEN);
        let len = usize::try_from(len)
            .map_err(|_| Error::invalid(format!("directory {} is too large", blob.id())))?;
        let payload = blob.read(FS_BLOB_HEADER_LEN, len)?;
        let mut reader = payload.as_slice();
        let mut entries = Vec::new();
        while !reader.is_empty() {
            let entry = DirEntry::decode(&mut reader).map_err(|err| {
                Error::invalid(format!("directory {}: malformed entry: {err}", blob.id()))
            })?;
            entries.push(entry);
        }
        Ok(Self {
            blob,
            parent,
            entries,
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

    /// Size of the serialized entry list.
    #[must_use]
    #[inline]
    pub fn payload_size(&self) -> u64 {
        self.blob.size().saturating_sub(FS_BLOB_HEADER_LEN)
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in stored order.
    #[inline]
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    #[must_use]
    #[inline]
    pub fn get_entry(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    #[must_use]
    #[inline]
    pub fn get_entry_by_id(&self, id: &BlobId) -> Option<&DirEntry> {
        self.entries.iter().find(|entry| entry.blob_id == *id)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| Error::NotFound(name.into()))
    }

    fn position_by_id(&self, id: &BlobId) -> Result<usize> {
        self.entries
            .iter()
            .position(|entry| entry.blob_id == *id)
            .ok_or_else(|| Error::NotFound(format!("entry for blob {id}")))
    }

    /// Blob offset of the entry at `index`.
    fn offset_of(&self, index: usize) -> u64 {
        let payload_offset: usize = self
            .entries
            .iter()
            .take(index)
            .map(DirEntry::encoded_len)
            .sum();
        FS_BLOB_HEADER_LEN.saturating_add(u64::try_from(payload_offset).unwrap_or(u64::MAX))
    }

    fn encode_from(&self, index: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in self.entries.iter().skip(index) {
            entry.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Rewrites the entries starting at `index` and cuts the blob after the last one.
    fn rewrite_tail(&mut self, index: usize) -> Result<()> {
        let offset = self.offset_of(index);
        let tail = self.encode_from(index)?;
        self.blob.write(offset, &tail)?;
        let end = offset.saturating_add(u64::try_from(tail.len()).unwrap_or(u64::MAX));
        self.blob.resize(end)
    }

    /// Rewrites a single entry whose encoded length did not change.
    fn rewrite_in_place(&mut self, index: usize) -> Result<()> {
        let offset = self.offset_of(index);
        let mut buf = Vec::new();
        if let Some(entry) = self.entries.get(index) {
            entry.encode_into(&mut buf)?;
        }
        self.blob.write(offset, &buf)
    }

    /// Appends an entry. Fails if the name is invalid or already taken.
    #[inline]
    pub fn add_entry(&mut self, entry: DirEntry) -> Result<()> {
        check_name(&entry.name).map_err(|_| Error::InvalidName(entry.name.clone()))?;
        if self.get_entry(&entry.name).is_some() {
            return Err(Error::NameConflict(entry.name));
        }
        let mut buf = Vec::with_capacity(entry.encoded_len());
        entry.encode_into(&mut buf)?;
        self.blob.write(self.blob.size(), &buf)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Puts `previous` back at `index` if `result` is an error, so the entries
    /// keep matching the stored blob.
    fn restore_on_error(
        &mut self,
        index: usize,
        previous: DirEntry,
        result: Result<()>,
    ) -> Result<()> {
        if result.is_err() {
            if let Some(entry) = self.entries.get_mut(index) {
                *entry = previous;
            }
        }
        result
    }

    #[inline]
    pub fn remove_entry(&mut self, name: &str) -> Result<DirEntry> {
        let index = self.position(name)?;
        let entry = self.entries.remove(index);
        if let Err(err) = self.rewrite_tail(index) {
            self.entries.insert(index, entry);
            return Err(err);
        }
        Ok(entry)
    }

    #[inline]
    pub fn rename_entry(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        check_name(new_name).map_err(|_| Error::InvalidName(new_name.into()))?;
        let index = self.position(old_name)?;
        if old_name == new_name {
            return Ok(());
        }
        if self.get_entry(new_name).is_some() {
            return Err(Error::NameConflict(new_name.into()));
        }
        let Some(entry) = self.entries.get_mut(index) else {
            return Err(Error::NotFound(old_name.into()));
        };
        let previous = entry.clone();
        new_name.clone_into(&mut entry.name);
        entry.ctime = Utc::now();
        let result = if previous.name.len() == new_name.len() {
            self.rewrite_in_place(index)
        } else {
            self.rewrite_tail(index)
        };
        self.restore_on_error(index, previous, result)
    }

    fn update(&mut self, name: &str, f: impl FnOnce(&mut DirEntry)) -> Result<()> {
        let index = self.position(name)?;
        let Some(entry) = self.entries.get_mut(index) else {
            return Err(Error::NotFound(name.into()));
        };
        let previous = entry.clone();
        f(entry);
        entry.ctime = Utc::now();
        let result = self.rewrite_in_place(index);
        self.restore_on_error(index, previous, result)
    }

    #[inline]
    pub fn set_mode(&mut self, name: &str, mode: u32) -> Result<()> {
        self.update(name, |entry| entry.mode = mode)
    }

    #[inline]
    pub fn set_owner(&mut self, name: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.update(name, |entry| {
            if let Some(uid) = uid {
                entry.uid = uid;
            }
            if let Some(gid) = gid {
                entry.gid = gid;
            }
        })
    }

    #[inline]
    pub fn set_times(
        &mut self,
        name: &str,
        atime: Option<DateTimeUtc>,
        mtime: Option<DateTimeUtc>,
    ) -> Result<()> {
        self.update(name, |entry| {
            if let Some(atime) = atime {
                entry.atime = atime;
            }
            if let Some(mtime) = mtime {
                entry.mtime = mtime;
            }
        })
    }

    /// Sets the modification time of the entry pointing at `id`.
    #[inline]
    pub fn touch_by_id(&mut self, id: &BlobId) -> Result<()> {
        let index = self.position_by_id(id)?;
        let Some(entry) = self.entries.get_mut(index) else {
            return Err(Error::NotFound(format!("entry for blob {id}")));
        };
        let previous = entry.clone();
        let now = Utc::now();
        entry.mtime = now;
        entry.ctime = now;
        let result = self.rewrite_in_place(index);
        self.restore_on_error(index, previous, result)
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

#[cfg(test)]
#[expect(clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        crate::{
            blob::NodeStore,
            blockstore::{
                BlockContainer,
                test_util::{FlakyContainer, TEST_BLOCK_SIZE, store_with},
            },
            fsblob::{FsBlob, FsBlobStore, test_util::blob_store},
        },
        std::sync::{Arc, atomic::Ordering},
    };

    fn entry(name: &str, kind: EntryKind) -> DirEntry {
        DirEntry::new(kind, name.into(), BlobId(BlockId::random()), 0o644)
    }

    fn reload(store: &FsBlobStore, id: &BlobId) -> DirBlob {
        let Some(FsBlob::Dir(dir)) = store.load(id).unwrap() else {
            panic!("expected a directory");
        };
        dir
    }

    fn names(dir: &DirBlob) -> Vec<&str> {
        dir.entries().map(|entry| entry.name.as_str()).collect()
    }

    #[test]
    fn add_and_conflict() {
        let store = blob_store();
        let mut dir = store.create_dir(None).unwrap();
        assert!(dir.is_empty());
        dir.add_entry(entry("a", EntryKind::File)).unwrap();
        dir.add_entry(entry("b", EntryKind::Directory)).unwrap();
        assert!(matches!(
            dir.add_entry(entry("a", EntryKind::Symlink)),
            Err(Error::NameConflict(_))
        ));
        assert!(matches!(
            dir.add_entry(entry("x/y", EntryKind::File)),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            dir.add_entry(entry("..", EntryKind::File)),
            Err(Error::InvalidName(_))
        ));
        assert_eq!(names(&dir), ["a", "b"]);
        assert_eq!(dir.get_entry("b").unwrap().kind, EntryKind::Directory);

        let loaded = reload(&store, &dir.id());
        assert_eq!(loaded.entries().collect::<Vec<_>>(), dir.entries().collect::<Vec<_>>());
        assert_eq!(loaded.payload_size(), dir.payload_size());
    }

    #[test]
    fn remove_then_readd() {
        let store = blob_store();
        let mut dir = store.create_dir(None).unwrap();
        for name in ["one", "two", "three"] {
            dir.add_entry(entry(name, EntryKind::File)).unwrap();
        }
        let removed = dir.remove_entry("two").unwrap();
        assert_eq!(removed.name, "two");
        assert!(matches!(dir.remove_entry("two"), Err(Error::NotFound(_))));
        assert_eq!(names(&reload(&store, &dir.id())), ["one", "three"]);

        dir.add_entry(entry("two", EntryKind::File)).unwrap();
        assert_eq!(names(&reload(&store, &dir.id())), ["one", "three", "two"]);

        for name in ["one", "three", "two"] {
            dir.remove_entry(name).unwrap();
        }
        assert_eq!(dir.payload_size(), 0);
        assert!(reload(&store, &dir.id()).is_empty());
    }

    #[test]
    fn rename() {
        let store = blob_store();
        let mut dir = store.create_dir(None).unwrap();
        let first = entry("aaa", EntryKind::File);
        let first_id = first.blob_id;
        dir.add_entry(first).unwrap();
        dir.add_entry(entry("bbb", EntryKind::File)).unwrap();
        dir.add_entry(entry("ccc", EntryKind::File)).unwrap();

        dir.rename_entry("aaa", "xyz").unwrap();
        assert_eq!(names(&reload(&store, &dir.id())), ["xyz", "bbb", "ccc"]);

        dir.rename_entry("xyz", "a-much-longer-name").unwrap();
        let loaded = reload(&store, &dir.id());
        assert_eq!(names(&loaded), ["a-much-longer-name", "bbb", "ccc"]);
        assert_eq!(loaded.get_entry_by_id(&first_id).unwrap().name, "a-much-longer-name");

        dir.rename_entry("a-much-longer-name", "s").unwrap();
        assert_eq!(names(&reload(&store, &dir.id())), ["s", "bbb", "ccc"]);

        assert!(matches!(
            dir.rename_entry("missing", "q"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            dir.rename_entry("s", "bbb"),
            Err(Error::NameConflict(_))
        ));
        dir.rename_entry("s", "s").unwrap();
    }

    #[test]
    fn attributes() {
        let store = blob_store();
        let mut dir = store.create_dir(None).unwrap();
        dir.add_entry(entry("a", EntryKind::File)).unwrap();
        dir.add_entry(entry("b", EntryKind::File)).unwrap();
        let time = DateTimeUtc::from_timestamp(1_000_000_000, 123).unwrap();

        dir.set_mode("a", 0o600).unwrap();
        dir.set_owner("a", Some(1000), None).unwrap();
        dir.set_times("a", None, Some(time)).unwrap();
        assert!(matches!(dir.set_mode("zz", 0), Err(Error::NotFound(_))));

        let loaded = reload(&store, &dir.id());
        let a = loaded.get_entry("a").unwrap();
        assert_eq!(a.mode, 0o600);
        assert_eq!((a.uid, a.gid), (1000, 0));
        assert_eq!(a.mtime, time);
        assert!(a.ctime > time);
        assert_eq!(loaded.entries().collect::<Vec<_>>()[1].name, "b");
    }

    #[test]
    fn malformed_payload() {
        let store = blob_store();
        let mut dir = store.create_dir(None).unwrap();
        dir.add_entry(entry("a", EntryKind::File)).unwrap();
        let size = dir.blob.size();
        dir.blob.resize(size - 1).unwrap();
        assert!(matches!(
            store.load(&dir.id()),
            Err(Error::FilesystemInvalid(_))
        ));
    }

    #[test]
    fn failed_write_keeps_entries() {
        let container = Arc::new(FlakyContainer::default());
        let blocks = store_with(
            Arc::clone(&container) as Arc<dyn BlockContainer>,
            TEST_BLOCK_SIZE,
        );
        let store = FsBlobStore::new(Arc::new(NodeStore::new(blocks)));
        let mut dir = store.create_dir(None).unwrap();
        for name in ["a", "b", "c"] {
            dir.add_entry(entry(name, EntryKind::File)).unwrap();
        }
        let before: Vec<DirEntry> = dir.entries().cloned().collect();

        container.fail_writes.store(true, Ordering::Relaxed);
        dir.remove_entry("a").unwrap_err();
        dir.rename_entry("b", "a-longer-name").unwrap_err();
        dir.rename_entry("b", "x").unwrap_err();
        dir.set_mode("c", 0o600).unwrap_err();
        assert_eq!(dir.entries().cloned().collect::<Vec<_>>(), before);

        container.fail_writes.store(false, Ordering::Relaxed);
        let mut stored = reload(&store, &dir.id());
        assert_eq!(stored.entries().cloned().collect::<Vec<_>>(), before);
        stored.remove_entry("a").unwrap();
        assert_eq!(names(&reload(&store, &dir.id())), ["b", "c"]);
    }
}
