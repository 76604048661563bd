use {
    anyhow::{Context, Result, bail, ensure, format_err},
    blockvault_protocol::EncryptionKey,
    serde::{Deserialize, Serialize},
    std::{
        fmt::{self, Display},
        str::FromStr,
        sync::Arc,
    },
};

/// Authenticated encryption with associated data.
///
/// Implementations never reuse a nonce on their own; callers pass the nonce
/// explicitly so that it can be derived from data that is unique per encryption.
pub trait AeadCipher: Send + Sync {
    fn name(&self) -> CipherName;

    fn nonce_size(&self) -> usize;

    /// Number of bytes the ciphertext is longer than the plaintext.
    fn overhead(&self) -> usize;

    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails if the ciphertext, the nonce or the associated data was tampered with.
    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherName {
    #[default]
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "aes-256-siv")]
    Aes256Siv,
}

impl CipherName {
    pub const ALL: [Self; 3] = [Self::XChaCha20Poly1305, Self::Aes256Gcm, Self::Aes256Siv];

    #[must_use]
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Aes256Siv => "aes-256-siv",
        }
    }

    #[must_use]
    #[inline]
    pub const fn key_size(self) -> usize {
        match self {
            Self::XChaCha20Poly1305 | Self::Aes256Gcm => 32,
            Self::Aes256Siv => 64,
        }
    }

    #[inline]
    pub fn generate_key(self) -> Result<EncryptionKey> {
        EncryptionKey::generate(self.key_size())
    }

    /// Creates a cipher instance bound to `key`.
    #[inline]
    pub fn instantiate(self, key: &EncryptionKey) -> Result<Arc<dyn AeadCipher>> {
        ensure!(
            key.len() == self.key_size(),
            "invalid key length for {self}: got {}, expected {}",
            key.len(),
            self.key_size()
        );
        let cipher: Arc<dyn AeadCipher> = match self {
            Self::XChaCha20Poly1305 => Arc::new(XChaCha20Poly1305Cipher::new(key)?),
            Self::Aes256Gcm => Arc::new(Aes256GcmCipher::new(key)?),
            Self::Aes256Siv => Arc::new(Aes256SivCipher::new(key)?),
        };
        Ok(cipher)
    }
}

impl Display for CipherName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for name in Self::ALL {
            if name.as_str() == s {
                return Ok(name);
            }
        }
        bail!(
            "unknown cipher {s:?}, supported: {}",
            Self::ALL.map(Self::as_str).join(", ")
        )
    }
}

fn check_nonce(nonce: &[u8], expected: usize) -> Result<()> {
    ensure!(
        nonce.len() == expected,
        "invalid nonce length: got {}, expected {expected}",
        nonce.len()
    );
    Ok(())
}

struct XChaCha20Poly1305Cipher {
    inner: chacha20poly1305::XChaCha20Poly1305,
}

impl XChaCha20Poly1305Cipher {
    const NONCE_SIZE: usize = 24;

    fn new(key: &EncryptionKey) -> Result<Self> {
        use chacha20poly1305::KeyInit;

        let inner = chacha20poly1305::XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| format_err!("invalid key length for xchacha20-poly1305"))?;
        Ok(Self { inner })
    }
}

impl AeadCipher for XChaCha20Poly1305Cipher {
    fn name(&self) -> CipherName {
        CipherName::XChaCha20Poly1305
    }

    fn nonce_size(&self) -> usize {
        Self::NONCE_SIZE
    }

    fn overhead(&self) -> usize {
        16
    }

    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use chacha20poly1305::aead::{Aead, Payload};

        check_nonce(nonce, Self::NONCE_SIZE)?;
        self.inner
            .encrypt(
                chacha20poly1305::XNonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| format_err!("xchacha20-poly1305 encryption failed"))
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        use chacha20poly1305::aead::{Aead, Payload};

        check_nonce(nonce, Self::NONCE_SIZE)?;
        self.inner
            .decrypt(
                chacha20poly1305::XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| format_err!("xchacha20-poly1305 authentication failed"))
    }
}

struct Aes256GcmCipher {
    inner: aes_gcm::Aes256Gcm,
}

impl Aes256GcmCipher {
    const NONCE_SIZE: usize = 12;

    fn new(key: &EncryptionKey) -> Result<Self> {
        use aes_gcm::KeyInit;

        let inner = aes_gcm::Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| format_err!("invalid key length for aes-256-gcm"))?;
        Ok(Self { inner })
    }
}

impl AeadCipher for Aes256GcmCipher {
    fn name(&self) -> CipherName {
        CipherName::Aes256Gcm
    }

    fn nonce_size(&self) -> usize {
        Self::NONCE_SIZE
    }

    fn overhead(&self) -> usize {
        16
    }

    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, Payload};

        check_nonce(nonce, Self::NONCE_SIZE)?;
        self.inner
            .encrypt(
                aes_gcm::Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| format_err!("aes-256-gcm encryption failed"))
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, Payload};

        check_nonce(nonce, Self::NONCE_SIZE)?;
        self.inner
            .decrypt(
                aes_gcm::Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| format_err!("aes-256-gcm authentication failed"))
    }
}

/// AES-SIV is nonce-misuse resistant, so it stays safe even if a nonce repeats.
struct Aes256SivCipher {
    inner: aes_siv::Aes256SivAead,
}

impl Aes256SivCipher {
    const NONCE_SIZE: usize = 16;

    fn new(key: &EncryptionKey) -> Result<Self> {
        use aes_siv::KeyInit;

        let inner = aes_siv::Aes256SivAead::new_from_slice(key.as_bytes())
            .map_err(|_| format_err!("invalid key length for aes-256-siv"))?;
        Ok(Self { inner })
    }

    fn nonce(nonce: &[u8]) -> Result<aes_siv::Nonce> {
        check_nonce(nonce, Self::NONCE_SIZE)?;
        aes_siv::Nonce::try_from(nonce).context("invalid nonce for aes-256-siv")
    }
}

impl AeadCipher for Aes256SivCipher {
    fn name(&self) -> CipherName {
        CipherName::Aes256Siv
    }

    fn nonce_size(&self) -> usize {
        Self::NONCE_SIZE
    }

    fn overhead(&self) -> usize {
        16
    }

    fn encrypt(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use aes_siv::aead::{Aead, Payload};

        self.inner
            .encrypt(
                &Self::nonce(nonce)?,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| format_err!("aes-256-siv encryption failed"))
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        use aes_siv::aead::{Aead, Payload};

        self.inner
            .decrypt(
                &Self::nonce(nonce)?,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| format_err!("aes-256-siv authentication failed"))
    }
}
