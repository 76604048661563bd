use {
    anyhow::{Context as _, Result},
    blockvault_sdk::{
        blockstore::LedgerLocation,
        crypto::{CipherName, KdfParams},
        vault::DEFAULT_BLOCK_SIZE,
    },
    byte_unit::Byte,
    derivative::Derivative,
    serde::{Deserialize, Serialize},
    std::{io::ErrorKind, path::PathBuf},
};

pub const CONFIG_FILE_NAME: &str = "blockvault.json5";

#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory of the local integrity ledgers. Defaults to the per-user data dir.
    pub state_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    #[derivative(Default(value = "default_log_filter()"))]
    pub log_filter: String,
    /// Cipher used by `create` unless given on the command line.
    pub default_cipher: CipherName,
    #[derivative(Default(value = "default_block_size()"))]
    pub default_block_size: Byte,
    /// Argon2id parameters for new filesystems.
    pub kdf: KdfParams,
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_block_size() -> Byte {
    Byte::from_u64(u64::try_from(DEFAULT_BLOCK_SIZE).unwrap_or(u64::MAX))
}

impl Config {
    /// Loads the config from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (default_config_path()?, false),
        };
        match fs_err::read_to_string(&path) {
            Ok(text) => json5::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn ledger_location(&self) -> Result<LedgerLocation> {
        match &self.state_dir {
            Some(dir) => Ok(LedgerLocation::Directory(dir.clone())),
            None => Ok(LedgerLocation::default_dir()?),
        }
    }

    pub fn block_size(&self) -> Result<usize> {
        usize::try_from(self.default_block_size.as_u64()).context("block size is too large")
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("cannot find config dir")?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    #[test]
    fn defaults_and_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs_err::write(&path, "{}").unwrap();
        let config = Config::load(Some(path.clone())).unwrap();
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.block_size().unwrap(), DEFAULT_BLOCK_SIZE);
        assert_eq!(config.default_cipher, CipherName::XChaCha20Poly1305);

        fs_err::write(
            &path,
            r#"{
                // comments are allowed
                state_dir: "/tmp/ledgers",
                default_cipher: "aes-256-gcm",
                default_block_size: "4 KiB",
                kdf: { memory_kib: 1024, iterations: 2, parallelism: 1 },
            }"#,
        )
        .unwrap();
        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.default_cipher, CipherName::Aes256Gcm);
        assert_eq!(config.block_size().unwrap(), 4096);
        assert_eq!(config.kdf.iterations, 2);
        assert_eq!(
            config.ledger_location().unwrap(),
            LedgerLocation::Directory("/tmp/ledgers".into())
        );
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        Config::load(Some(dir.path().join("missing.json5"))).unwrap_err();
    }
}
