//! Creating and mounting filesystems.

use {
    crate::{
        Error, Result, UnlockError,
        blob::NodeStore,
        blockstore::{BlockCodec, BlockContainer, IntegrityBlockStore, Ledger, LedgerLocation},
        config::{
            CONFIG_FORMAT_VERSION, ConfigLocation, VaultConfig, current_version, decrypt_config,
            encrypt_config,
        },
        crypto::{CipherName, KdfParams},
        device::Device,
        fs::Filesystem,
        fsblob::{FsBlob, FsBlobStore},
    },
    blockvault_protocol::{BlobId, ClientId, EncryptionKey, FilesystemId},
    std::sync::Arc,
    tracing::{info, instrument, warn},
};

pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub cipher: CipherName,
    /// Size of an encrypted block in bytes.
    pub block_size: usize,
    pub kdf: KdfParams,
    pub config_location: ConfigLocation,
    pub ledger: LedgerLocation,
    /// Binds the filesystem to the creating client.
    pub exclusive: bool,
}

impl CreateOptions {
    /// Defaults with the ledger in `ledger`.
    #[must_use]
    #[inline]
    pub fn new(ledger: LedgerLocation) -> Self {
        Self {
            cipher: CipherName::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            kdf: KdfParams::default(),
            config_location: ConfigLocation::default(),
            ledger,
            exclusive: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnlockOptions {
    pub config_location: ConfigLocation,
    pub ledger: LedgerLocation,
    /// Mount even if this client has no ledger for the filesystem yet.
    ///
    /// A new ledger trusts whatever the container holds at this moment, so
    /// rollbacks that happened before cannot be detected.
    pub allow_fresh_ledger: bool,
}

impl UnlockOptions {
    #[must_use]
    #[inline]
    pub fn new(ledger: LedgerLocation) -> Self {
        Self {
            config_location: ConfigLocation::default(),
            ledger,
            allow_fresh_ledger: false,
        }
    }
}

/// A mounted filesystem.
pub struct Vault {
    config: VaultConfig,
    client_id: ClientId,
    filesystem: Filesystem,
}

fn open_store(
    container: Arc<dyn BlockContainer>,
    cipher: CipherName,
    key: &EncryptionKey,
    block_size: usize,
    ledger: Ledger,
    exclusive: bool,
) -> Result<FsBlobStore> {
    let codec = BlockCodec::new(cipher.instantiate(key)?, block_size)?;
    let blocks = IntegrityBlockStore::new(container, codec, ledger, exclusive);
    Ok(FsBlobStore::new(Arc::new(NodeStore::new(Arc::new(blocks)))))
}

impl Vault {
    /// Creates a new filesystem with an empty root directory.
    ///
    /// Fails if the config location already holds a config.
    #[instrument(skip_all, fields(cipher = %options.cipher, block_size = options.block_size))]
    #[inline]
    pub fn create(
        container: Arc<dyn BlockContainer>,
        password: &str,
        options: CreateOptions,
    ) -> Result<Self, UnlockError> {
        if options.config_location.exists(container.as_ref())? {
            return Err(Error::NameConflict(format!(
                "filesystem config already exists at {}",
                options.config_location
            ))
            .into());
        }
        let cipher = options.cipher;
        let encryption_key = cipher.generate_key()?;
        let filesystem_id = FilesystemId::random();
        let ledger = Ledger::open(
            &options.ledger,
            &filesystem_id,
            cipher.instantiate(&encryption_key)?,
        )?;
        let client_id = ledger.client_id();
        let store = open_store(
            Arc::clone(&container),
            cipher,
            &encryption_key,
            options.block_size,
            ledger,
            options.exclusive,
        )?;
        let root = store.create_dir(None)?;
        root.flush()?;
        let config = VaultConfig {
            format_version: CONFIG_FORMAT_VERSION,
            created_with_version: current_version(),
            last_opened_with_version: current_version(),
            cipher,
            encryption_key,
            block_size: options.block_size,
            root_blob: root.id(),
            filesystem_id,
            exclusive_client_id: options.exclusive.then_some(client_id),
        };

        // The config is written last: until then, nothing points at the new blocks.
        let record = encrypt_config(&config, password, options.kdf)?;
        options
            .config_location
            .write(container.as_ref(), &record)?;
        info!(%filesystem_id, root = %config.root_blob, %client_id, "created filesystem");
        Ok(Self::assemble(config, client_id, store))
    }

    /// Decrypts the config with `password` and mounts the filesystem.
    #[instrument(skip_all, fields(config = %options.config_location))]
    #[inline]
    pub fn unlock(
        container: Arc<dyn BlockContainer>,
        password: &str,
        options: UnlockOptions,
    ) -> Result<Self, UnlockError> {
        let record = options
            .config_location
            .read(container.as_ref())?
            .ok_or_else(|| UnlockError::ConfigMissing(options.config_location.to_string()))?;
        let (mut config, kdf) = decrypt_config(&record, password)?;
        let filesystem_id = config.filesystem_id;

        if !options.allow_fresh_ledger && !options.ledger.exists_for(&filesystem_id)? {
            return Err(UnlockError::LedgerUnavailable(filesystem_id.to_string()));
        }
        let ledger = Ledger::open(
            &options.ledger,
            &filesystem_id,
            config.cipher.instantiate(&config.encryption_key)?,
        )?;
        if ledger.is_fresh() {
            if !options.allow_fresh_ledger {
                return Err(UnlockError::LedgerUnavailable(filesystem_id.to_string()));
            }
            warn!(
                %filesystem_id,
                "mounting with a new ledger; earlier rollbacks cannot be detected"
            );
        }
        let client_id = ledger.client_id();
        if let Some(expected) = config.exclusive_client_id {
            if expected != client_id {
                return Err(UnlockError::ExclusiveClientMismatch {
                    expected: expected.to_string(),
                    actual: client_id.to_string(),
                });
            }
        }

        let store = open_store(
            Arc::clone(&container),
            config.cipher,
            &config.encryption_key,
            config.block_size,
            ledger,
            config.exclusive_client_id.is_some(),
        )?;
        if !container.exists(&config.root_blob.block_id())? {
            return Err(UnlockError::FilesystemInvalid(format!(
                "root blob {} is missing",
                config.root_blob
            )));
        }
        match store.load(&config.root_blob) {
            Ok(Some(FsBlob::Dir(_))) => {}
            Ok(Some(blob)) => {
                return Err(UnlockError::FilesystemInvalid(format!(
                    "root blob {} is a {}, not a directory",
                    config.root_blob,
                    blob.kind()
                )));
            }
            Ok(None) => {
                return Err(UnlockError::FilesystemInvalid(format!(
                    "root blob {} is missing",
                    config.root_blob
                )));
            }
            Err(Error::FilesystemInvalid(detail)) => {
                return Err(UnlockError::FilesystemInvalid(detail));
            }
            Err(err) => return Err(err.into()),
        }

        if config.last_opened_with_version != current_version() {
            config.last_opened_with_version = current_version();
            let record = encrypt_config(&config, password, kdf)?;
            options
                .config_location
                .write(container.as_ref(), &record)?;
        }
        info!(%filesystem_id, %client_id, cipher = %config.cipher, "mounted filesystem");
        Ok(Self::assemble(config, client_id, store))
    }

    fn assemble(config: VaultConfig, client_id: ClientId, store: FsBlobStore) -> Self {
        let device = Arc::new(Device::new(store, config.root_blob));
        Self {
            config,
            client_id,
            filesystem: Filesystem::new(device),
        }
    }

    #[must_use]
    #[inline]
    pub fn cipher_name(&self) -> CipherName {
        self.config.cipher
    }

    #[must_use]
    #[inline]
    pub fn root_blob(&self) -> BlobId {
        self.config.root_blob
    }

    #[must_use]
    #[inline]
    pub fn filesystem_id(&self) -> FilesystemId {
        self.config.filesystem_id
    }

    #[must_use]
    #[inline]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    #[inline]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    #[must_use]
    #[inline]
    pub fn filesystem(&self) -> &Filesystem {
        &self.filesystem
    }

    #[must_use]
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        self.filesystem.device()
    }

    /// Flushes the ledger and closes the filesystem.
    #[inline]
    pub fn unmount(self) -> Result<()> {
        self.device().flush()?;
        info!(filesystem_id = %self.config.filesystem_id, "unmounted filesystem");
        Ok(())
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if let Err(err) = self.device().flush() {
            warn!(?err, "failed to flush ledger on drop");
        }
    }
}
