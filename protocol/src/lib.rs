#![allow(clippy::collapsible_else_if)]

pub mod credentials;
pub mod encoding;
mod path;

pub use crate::{
    credentials::EncryptionKey,
    path::{MAX_NAME_LEN, VaultPath, check_name},
};
use {
    anyhow::{Error, bail, format_err},
    chrono::Utc,
    derive_more::{From, Into},
    serde::{Deserialize, Deserializer, Serialize, Serializer, de},
    std::{
        borrow::Cow,
        fmt::{self, Debug, Display},
        str::FromStr,
    },
};

pub type DateTimeUtc = chrono::DateTime<Utc>;

/// Length of block and filesystem identifiers in bytes.
pub const ID_LEN: usize = 16;

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Generates a new identifier from the thread-local CSPRNG.
            #[must_use]
            #[inline]
            pub fn random() -> Self {
                Self(rand::random())
            }

            #[must_use]
            #[inline]
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            #[inline]
            pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
                let array = <[u8; ID_LEN]>::try_from(bytes).map_err(|_| {
                    format_err!(
                        "invalid {} length; got {}, expected {ID_LEN}",
                        stringify!($name),
                        bytes.len()
                    )
                })?;
                Ok(Self(array))
            }

            #[must_use]
            #[inline]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            #[inline]
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_slice(&hex::decode(s)?)
            }
        }

        impl Serialize for $name {
            #[inline]
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                hex::encode(self.0).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            #[inline]
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                Cow::<'_, str>::deserialize(deserializer)?
                    .parse()
                    .map_err(de::Error::custom)
            }
        }
    };
}

random_id!(
    /// Address of a block inside a block container.
    ///
    /// Identifiers are random rather than content-derived so that equal plaintexts
    /// stored in different blocks cannot be correlated.
    BlockId
);

random_id!(
    /// Identifies one filesystem instance, e.g. to keep per-filesystem local state apart.
    FilesystemId
);

/// A blob is addressed by the id of its root block, which never changes
/// during the lifetime of the blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct BlobId(pub BlockId);

impl BlobId {
    #[must_use]
    #[inline]
    pub const fn block_id(&self) -> BlockId {
        self.0
    }
}

impl Display for BlobId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for BlobId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl FromStr for BlobId {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Identifies a client (a local installation with its own version ledger)
/// that wrote a block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct ClientId(pub u32);

impl Display for ClientId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl EntryKind {
    #[must_use]
    #[inline]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
            Self::Symlink => 3,
        }
    }
}

impl TryFrom<u8> for EntryKind {
    type Error = Error;

    #[inline]
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            3 => Ok(Self::Symlink),
            _ => bail!("invalid value for EntryKind: {value}"),
        }
    }
}

impl Display for EntryKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Directory => "dir",
            Self::Symlink => "symlink",
        })
    }
}
