//! All encryption operations use an AEAD cipher chosen when the filesystem is created.
//!
//! Supported ciphers are XChaCha20-Poly1305 (default), AES-256-GCM and AES-256-SIV.
//! The cipher name is stored in the config, and the same cipher is used for every
//! block of the filesystem.
//!
//! Each block is encrypted with a nonce derived from the block id, the id of the
//! writing client and the block version: `SHA-256("blockvault-nonce" || id || client || version)`
//! truncated to the cipher's nonce size. A client never writes the same version of
//! a block twice, so a nonce is never reused under one key. The plaintext block header
//! (format, block id, client id, version) is passed as associated data, which binds
//! the ciphertext to its block id and version.
//!
//! The config is encrypted with a separate key derived from the user's password
//! using Argon2id with a random 256-bit salt. The salt, the KDF parameters and
//! a random nonce are stored in plaintext next to the ciphertext and are
//! authenticated as associated data. The config key is never written anywhere.
//!
//! Local integrity state (the version ledger) is sealed with the filesystem cipher
//! using random nonces.

mod cipher;
mod kdf;

pub use {
    cipher::{AeadCipher, CipherName},
    kdf::{KdfParams, SALT_LEN},
};

use {
    anyhow::{Result, format_err},
    rand::{TryRngCore, rngs::OsRng},
};

/// Fills a new buffer of `len` bytes from the operating system's random source.
#[inline]
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|err| format_err!("failed to get random bytes: {err}"))?;
    Ok(buf)
}
