//! The filesystem config: everything needed to mount besides the blocks.
//!
//! The config is JSON, padded and encrypted with a password-derived key (see
//! [`record`]). It lives either inside the container under
//! [`CONFIG_BLOCK_ID`](crate::blockstore::CONFIG_BLOCK_ID) or in a separate file.

pub mod record;

pub use record::{OUTER_FORMAT_VERSION, decrypt_config, encrypt_config};

use {
    crate::{
        Result,
        blockstore::{BlockContainer, CONFIG_BLOCK_ID},
        crypto::CipherName,
    },
    blockvault_protocol::{BlobId, ClientId, EncryptionKey, FilesystemId},
    serde::{Deserialize, Serialize},
    std::{
        fmt::{self, Display},
        io::{ErrorKind, Write},
        path::PathBuf,
    },
    tempfile::NamedTempFile,
};

/// Version of the inner (JSON) config format written by this build.
pub const CONFIG_FORMAT_VERSION: u32 = 1;
/// Oldest inner config format this build can read.
pub const MIN_CONFIG_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub format_version: u32,
    pub created_with_version: String,
    pub last_opened_with_version: String,
    pub cipher: CipherName,
    pub encryption_key: EncryptionKey,
    pub block_size: usize,
    pub root_blob: BlobId,
    pub filesystem_id: FilesystemId,
    /// If set, only this client may mount the filesystem, and blocks missing from
    /// the container but known to the ledger are integrity violations.
    #[serde(default)]
    pub exclusive_client_id: Option<ClientId>,
}

/// Version string of this build, recorded in the config.
#[must_use]
#[inline]
pub fn current_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

/// Where the encrypted config is stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigLocation {
    #[default]
    Internal,
    External(PathBuf),
}

impl Display for ConfigLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "block {CONFIG_BLOCK_ID}"),
            Self::External(path) => write!(f, "{}", path.display()),
        }
    }
}

impl ConfigLocation {
    /// Reads the encrypted config. `None` if there is none.
    #[inline]
    pub fn read(&self, container: &dyn BlockContainer) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Internal => container.get(&CONFIG_BLOCK_ID),
            Self::External(path) => match fs_err::read(path) {
                Ok(data) => Ok(Some(data)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Replaces the encrypted config atomically.
    #[inline]
    pub fn write(&self, container: &dyn BlockContainer, data: &[u8]) -> Result<()> {
        match self {
            Self::Internal => container.put(&CONFIG_BLOCK_ID, data),
            Self::External(path) => {
                let dir = match path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                let mut file = NamedTempFile::new_in(dir)?;
                file.write_all(data)?;
                file.as_file().sync_all()?;
                file.persist(path).map_err(|err| err.error)?;
                Ok(())
            }
        }
    }

    #[inline]
    pub fn exists(&self, container: &dyn BlockContainer) -> Result<bool> {
        match self {
            Self::Internal => container.exists(&CONFIG_BLOCK_ID),
            Self::External(path) => Ok(path.try_exists()?),
        }
    }
}
