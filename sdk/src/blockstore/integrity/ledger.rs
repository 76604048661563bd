use {
    crate::{Error, Result, crypto::{AeadCipher, random_bytes}},
    anyhow::{Context, format_err},
    blockvault_protocol::{BlockId, ClientId, FilesystemId, encoding},
    byteorder::{ByteOrder, LE},
    serde::{Deserialize, Serialize},
    std::{path::PathBuf, sync::Arc},
    tracing::{debug, info},
};

const KEY_CLIENT_ID: &[u8] = b"client_id";
const KEY_FILESYSTEM_ID: &[u8] = b"filesystem_id";
const ENTRY_AAD_PREFIX: &[u8] = b"ledger";

/// Where the version ledger of a filesystem is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerLocation {
    /// Ledgers live in `<dir>/<filesystem id>`.
    Directory(PathBuf),
    /// Throwaway ledger removed on drop.
    Temporary,
}

impl LedgerLocation {
    /// Per-user default, usually `~/.local/share/blockvault`.
    #[inline]
    pub fn default_dir() -> Result<Self> {
        let dir = dirs::data_local_dir()
            .context("failed to get local data dir")?
            .join("blockvault");
        Ok(Self::Directory(dir))
    }

    /// Path of the ledger of `filesystem_id`, if it is persistent.
    #[must_use]
    #[inline]
    pub fn path_for(&self, filesystem_id: &FilesystemId) -> Option<PathBuf> {
        match self {
            Self::Directory(dir) => Some(dir.join(filesystem_id.to_string())),
            Self::Temporary => None,
        }
    }

    /// True if a ledger for `filesystem_id` has been created before.
    #[inline]
    pub fn exists_for(&self, filesystem_id: &FilesystemId) -> Result<bool> {
        match self.path_for(filesystem_id) {
            Some(path) => Ok(path.try_exists()?),
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastWriter {
    Client(ClientId),
    /// The block was removed. Any ciphertext still found for it is a replay.
    Removed,
}

/// What this client knows about one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_writer: LastWriter,
    /// Highest accepted version per writing client.
    pub versions: Vec<(ClientId, u64)>,
    /// SHA-256 of the last accepted ciphertext.
    pub digest: [u8; 32],
}

impl LedgerEntry {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self {
            last_writer: LastWriter::Removed,
            versions: Vec::new(),
            digest: [0; 32],
        }
    }

    #[must_use]
    #[inline]
    pub fn version_of(&self, client: ClientId) -> Option<u64> {
        self.versions
            .iter()
            .find(|(id, _)| *id == client)
            .map(|(_, version)| *version)
    }

    #[inline]
    pub fn set_version(&mut self, client: ClientId, version: u64) {
        if let Some(entry) = self.versions.iter_mut().find(|(id, _)| *id == client) {
            entry.1 = version;
        } else {
            self.versions.push((client, version));
        }
    }

    #[must_use]
    #[inline]
    pub fn is_live(&self) -> bool {
        self.last_writer != LastWriter::Removed
    }
}

impl Default for LedgerEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent per-client record of block versions, backed by sled.
///
/// Entries are sealed with the filesystem cipher so that the local state
/// neither leaks the block structure nor can be edited without the key.
///
/// Entries of removed blocks stay as tombstones and are never pruned. Without
/// one, the last ciphertext of a removed block would be accepted again as a
/// live block, so the ledger grows with the number of distinct block ids ever
/// written.
pub struct Ledger {
    db: sled::Db,
    entries: sled::Tree,
    cipher: Arc<dyn AeadCipher>,
    client_id: ClientId,
    fresh: bool,
}

impl Ledger {
    /// Opens the ledger of `filesystem_id`, creating it if necessary.
    ///
    /// [`Ledger::is_fresh`] reports whether it had to be created.
    #[inline]
    pub fn open(
        location: &LedgerLocation,
        filesystem_id: &FilesystemId,
        cipher: Arc<dyn AeadCipher>,
    ) -> Result<Self> {
        let db = match location.path_for(filesystem_id) {
            Some(path) => {
                fs_err::create_dir_all(&path)?;
                sled::open(&path)?
            }
            None => sled::Config::new().temporary(true).open()?,
        };
        let meta = db.open_tree("meta")?;
        let entries = db.open_tree("entries")?;

        let (client_id, fresh) = match meta.get(KEY_CLIENT_ID)? {
            Some(value) => {
                let stored_fs = meta
                    .get(KEY_FILESYSTEM_ID)?
                    .context("ledger has no filesystem id")?;
                if FilesystemId::from_slice(&stored_fs)? != *filesystem_id {
                    return Err(format_err!(
                        "ledger belongs to filesystem {}",
                        FilesystemId::from_slice(&stored_fs)?
                    )
                    .into());
                }
                if value.len() != 4 {
                    return Err(format_err!("invalid client id in ledger").into());
                }
                (ClientId(LE::read_u32(&value)), false)
            }
            None => {
                let client_id = ClientId(rand::random());
                meta.insert(KEY_FILESYSTEM_ID, filesystem_id.as_bytes().as_slice())?;
                meta.insert(KEY_CLIENT_ID, &client_id.0.to_le_bytes()[..])?;
                db.flush()?;
                info!(%client_id, %filesystem_id, "created new ledger");
                (client_id, true)
            }
        };
        debug!(?location, %client_id, "opened ledger");
        Ok(Self {
            db,
            entries,
            cipher,
            client_id,
            fresh,
        })
    }

    #[must_use]
    #[inline]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// True if the ledger did not exist before it was opened.
    #[must_use]
    #[inline]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    fn aad(id: &BlockId) -> Vec<u8> {
        [ENTRY_AAD_PREFIX, id.as_bytes().as_slice()].concat()
    }

    #[inline]
    pub fn get(&self, id: &BlockId) -> Result<Option<LedgerEntry>> {
        let Some(sealed) = self.entries.get(id.as_bytes())? else {
            return Ok(None);
        };
        let nonce_size = self.cipher.nonce_size();
        let (nonce, ciphertext) = sealed.split_at(nonce_size.min(sealed.len()));
        let plaintext = self
            .cipher
            .decrypt(nonce, &Self::aad(id), ciphertext)
            .map_err(|_| Error::integrity(*id, "ledger entry failed authentication"))?;
        Ok(Some(encoding::deserialize(&plaintext)?))
    }

    #[inline]
    pub fn put(&self, id: &BlockId, entry: &LedgerEntry) -> Result<()> {
        let plaintext = encoding::serialize(entry).context("failed to encode ledger entry")?;
        let mut sealed = random_bytes(self.cipher.nonce_size())?;
        let ciphertext = self.cipher.encrypt(&sealed, &Self::aad(id), &plaintext)?;
        sealed.extend_from_slice(&ciphertext);
        self.entries.insert(id.as_bytes(), sealed)?;
        Ok(())
    }

    #[inline]
    pub fn contains(&self, id: &BlockId) -> Result<bool> {
        Ok(self.entries.contains_key(id.as_bytes())?)
    }

    /// Ids of all blocks the ledger considers live.
    #[inline]
    pub fn live_ids(&self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for pair in self.entries.iter() {
            let (key, _) = pair?;
            let id = BlockId::from_slice(&key)?;
            if self.get(&id)?.is_some_and(|entry| entry.is_live()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::crypto::CipherName, tempfile::TempDir};

    fn cipher() -> Arc<dyn AeadCipher> {
        let name = CipherName::default();
        name.instantiate(&name.generate_key().unwrap()).unwrap()
    }

    #[test]
    fn entries_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let location = LedgerLocation::Directory(dir.path().into());
        let fs_id = FilesystemId::random();
        let cipher = cipher();
        let id = BlockId::random();

        assert!(!location.exists_for(&fs_id).unwrap());
        let client_id = {
            let ledger = Ledger::open(&location, &fs_id, Arc::clone(&cipher)).unwrap();
            assert!(ledger.is_fresh());
            let mut entry = LedgerEntry::new();
            entry.last_writer = LastWriter::Client(ledger.client_id());
            entry.set_version(ledger.client_id(), 5);
            entry.digest = [9; 32];
            ledger.put(&id, &entry).unwrap();
            ledger.flush().unwrap();
            ledger.client_id()
        };
        assert!(location.exists_for(&fs_id).unwrap());

        let ledger = Ledger::open(&location, &fs_id, Arc::clone(&cipher)).unwrap();
        assert!(!ledger.is_fresh());
        assert_eq!(ledger.client_id(), client_id);
        let entry = ledger.get(&id).unwrap().unwrap();
        assert_eq!(entry.version_of(client_id), Some(5));
        assert_eq!(entry.digest, [9; 32]);
        assert_eq!(ledger.live_ids().unwrap(), [id]);
        assert!(ledger.get(&BlockId::random()).unwrap().is_none());
    }

    #[test]
    fn other_filesystem_is_rejected() {
        let dir = TempDir::new().unwrap();
        let fs_id = FilesystemId::random();
        let path = dir.path().join(fs_id.to_string());
        drop(Ledger::open(&LedgerLocation::Directory(dir.path().into()), &fs_id, cipher()).unwrap());
        // Pretend the ledger directory belongs to another filesystem.
        let other = FilesystemId::random();
        fs_err::rename(&path, dir.path().join(other.to_string())).unwrap();
        let err = Ledger::open(&LedgerLocation::Directory(dir.path().into()), &other, cipher());
        assert!(err.is_err());
    }

    #[test]
    fn entries_are_sealed() {
        let ledger = Ledger::open(&LedgerLocation::Temporary, &FilesystemId::random(), cipher())
            .unwrap();
        let id = BlockId::random();
        ledger.put(&id, &LedgerEntry::new()).unwrap();
        // Moving a sealed entry to another key fails authentication.
        let other = BlockId::random();
        let sealed = ledger.entries.get(id.as_bytes()).unwrap().unwrap();
        ledger.entries.insert(other.as_bytes(), sealed).unwrap();
        assert!(matches!(
            ledger.get(&other).unwrap_err(),
            Error::Integrity { .. }
        ));
        assert!(ledger.get(&id).unwrap().is_some());
    }
}
