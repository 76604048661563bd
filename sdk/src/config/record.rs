//! Password-encrypted config record.
//!
//! Layout:
//!
//! - magic `blockvlt` (8 bytes)
//! - outer format version (32 bits, little endian)
//! - bincode body: KDF parameters, salt, outer cipher name, nonce, ciphertext
//!
//! Everything before the ciphertext is the associated data of the encryption.
//! The plaintext is the JSON config prefixed with its length (32 bits, little
//! endian) and padded with random bytes to a multiple of 1 KiB, so the record
//! size doesn't reveal the config size.

use {
    super::{CONFIG_FORMAT_VERSION, MIN_CONFIG_FORMAT_VERSION, VaultConfig},
    crate::{
        Error, Result, UnlockError,
        crypto::{CipherName, KdfParams, SALT_LEN, random_bytes},
    },
    anyhow::Context,
    blockvault_protocol::{EncryptionKey, encoding},
    byteorder::{ByteOrder, LE},
    serde::{Deserialize, Serialize},
    tracing::debug,
    zeroize::Zeroizing,
};

const MAGIC: &[u8; 8] = b"blockvlt";
pub const OUTER_FORMAT_VERSION: u32 = 1;
const PREFIX_LEN: usize = 12;
const PAD_MULTIPLE: usize = 1024;
const OUTER_CIPHER: CipherName = CipherName::XChaCha20Poly1305;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OuterHeader {
    kdf: KdfParams,
    salt: Vec<u8>,
    cipher: CipherName,
    nonce: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OuterRecord {
    header: OuterHeader,
    ciphertext: Vec<u8>,
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

fn associated_data(header: &OuterHeader) -> Result<Vec<u8>> {
    let mut aad = prefix().to_vec();
    aad.extend_from_slice(&encoding::serialize(header).context("failed to encode config header")?);
    Ok(aad)
}

fn prefix() -> [u8; PREFIX_LEN] {
    let mut prefix = [0; PREFIX_LEN];
    let (magic, version) = prefix.split_at_mut(MAGIC.len());
    magic.copy_from_slice(MAGIC);
    LE::write_u32(version, OUTER_FORMAT_VERSION);
    prefix
}

fn pad(json: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let len = u32::try_from(json.len())
        .map_err(|_| Error::InvalidArgument("config is too large".into()))?;
    let unpadded = json.len().saturating_add(4);
    let padded = unpadded.div_ceil(PAD_MULTIPLE).saturating_mul(PAD_MULTIPLE);
    let mut plaintext = Zeroizing::new(Vec::with_capacity(padded));
    plaintext.extend_from_slice(&len.to_le_bytes());
    plaintext.extend_from_slice(json);
    plaintext.extend_from_slice(&random_bytes(padded.saturating_sub(unpadded))?);
    Ok(plaintext)
}

fn unpad(plaintext: &[u8]) -> Option<&[u8]> {
    let (len, rest) = plaintext.split_at_checked(4)?;
    let len = usize::try_from(LE::read_u32(len)).ok()?;
    rest.get(..len)
}

/// Encrypts `config` with a key derived from `password`.
#[inline]
pub fn encrypt_config(config: &VaultConfig, password: &str, kdf: KdfParams) -> Result<Vec<u8>> {
    let json = Zeroizing::new(serde_json::to_vec(config).context("failed to serialize config")?);
    let plaintext = pad(&json)?;

    let salt = random_bytes(SALT_LEN)?;
    let key = kdf.derive(password, &salt, OUTER_CIPHER.key_size())?;
    let cipher = OUTER_CIPHER.instantiate(&EncryptionKey::from_bytes(key.to_vec())?)?;
    let header = OuterHeader {
        kdf,
        salt,
        cipher: OUTER_CIPHER,
        nonce: random_bytes(cipher.nonce_size())?,
    };
    let ciphertext = cipher.encrypt(&header.nonce, &associated_data(&header)?, &plaintext)?;

    let mut data = prefix().to_vec();
    encoding::serialize_into(&mut data, &OuterRecord { header, ciphertext })
        .context("failed to encode config record")?;
    debug!(len = data.len(), "encrypted config");
    Ok(data)
}

/// Decrypts a config record. Also returns the KDF parameters it was sealed with.
///
/// Any authentication failure is reported as [`UnlockError::WrongPassword`]: a
/// wrong password and a tampered record can't be told apart.
#[inline]
pub fn decrypt_config(
    data: &[u8],
    password: &str,
) -> Result<(VaultConfig, KdfParams), UnlockError> {
    let (prefix, body) = data
        .split_at_checked(PREFIX_LEN)
        .ok_or_else(|| UnlockError::ConfigInvalid("record is too short".into()))?;
    let (magic, version) = prefix.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(UnlockError::ConfigInvalid("bad magic".into()));
    }
    let version = LE::read_u32(version);
    if version != OUTER_FORMAT_VERSION {
        return Err(UnlockError::IncompatibleVersion {
            found: version,
            supported: OUTER_FORMAT_VERSION.to_string(),
        });
    }
    let record: OuterRecord = encoding::deserialize(body)
        .map_err(|err| UnlockError::ConfigInvalid(format!("malformed record: {err}")))?;
    let header = &record.header;
    header.kdf.check_limits().map_err(|err| {
        UnlockError::ConfigInvalid(format!("unacceptable key derivation parameters: {err}"))
    })?;

    let key = header.kdf.derive(password, &header.salt, header.cipher.key_size())?;
    let cipher = header
        .cipher
        .instantiate(&EncryptionKey::from_bytes(key.to_vec())?)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(&header.nonce, &associated_data(header)?, &record.ciphertext)
            .map_err(|_| UnlockError::WrongPassword)?,
    );
    let json = unpad(&plaintext)
        .ok_or_else(|| UnlockError::ConfigInvalid("invalid config padding".into()))?;

    let probe: VersionProbe = serde_json::from_slice(json)
        .map_err(|err| UnlockError::ConfigInvalid(format!("malformed config: {err}")))?;
    if !(MIN_CONFIG_FORMAT_VERSION..=CONFIG_FORMAT_VERSION).contains(&probe.format_version) {
        return Err(UnlockError::IncompatibleVersion {
            found: probe.format_version,
            supported: format!("{MIN_CONFIG_FORMAT_VERSION}..={CONFIG_FORMAT_VERSION}"),
        });
    }
    let config = serde_json::from_slice(json)
        .map_err(|err| UnlockError::ConfigInvalid(format!("malformed config: {err}")))?;
    Ok((config, header.kdf))
}
