use {
    anyhow::{Error, ensure, format_err},
    base64::{Engine, display::Base64Display, prelude::BASE64_URL_SAFE_NO_PAD},
    rand::{TryRngCore, rngs::OsRng},
    serde::{Deserialize, Deserializer, Serialize, Serializer, de},
    std::{
        borrow::Cow,
        fmt::{self, Debug, Display},
        str::FromStr,
    },
    zeroize::Zeroizing,
};

/// Longest key any supported cipher needs (AES-SIV uses two 256-bit keys).
pub const MAX_KEY_LENGTH: usize = 64;

/// Secret used to encrypt the blocks of one filesystem.
///
/// The key is generated when the filesystem is created and is only ever persisted
/// inside the password-encrypted config record. The buffer is wiped on drop.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<Vec<u8>>);

impl EncryptionKey {
    /// Generates a key of `len` bytes from the operating system's random source.
    #[inline]
    pub fn generate(len: usize) -> anyhow::Result<Self> {
        ensure!(
            (1..=MAX_KEY_LENGTH).contains(&len),
            "invalid key length {len}"
        );
        let mut key = Zeroizing::new(vec![0u8; len]);
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|err| format_err!("failed to get random bytes: {err}"))?;
        Ok(Self(key))
    }

    #[inline]
    pub fn from_bytes(bytes: Vec<u8>) -> anyhow::Result<Self> {
        ensure!(
            (1..=MAX_KEY_LENGTH).contains(&bytes.len()),
            "invalid key length {}",
            bytes.len()
        );
        Ok(Self(Zeroizing::new(bytes)))
    }

    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    #[inline]
    pub fn display_unmasked(&self) -> impl Display + '_ {
        Base64Display::new(self.0.as_ref(), &BASE64_URL_SAFE_NO_PAD)
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

impl Serialize for EncryptionKey {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(BASE64_URL_SAFE_NO_PAD.encode(self.0.as_slice()));
        encoded.serialize(serializer)
    }
}

impl FromStr for EncryptionKey {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(BASE64_URL_SAFE_NO_PAD.decode(s)?)
    }
}

impl PartialEq for EncryptionKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice() == other.0.as_slice()
    }
}

impl Eq for EncryptionKey {}

impl Debug for EncryptionKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey").finish()
    }
}
