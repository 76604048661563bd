//! Error types of the storage engine.
//!
//! Errors raised by the block layer (`Integrity`, `Rollback`, I/O and ledger
//! failures) travel up through the blob and device layers unchanged. Nothing is
//! retried. Every variant maps to exactly one errno via [`Error::to_errno`].
//!
//! Mounting has its own error type, [`UnlockError`], because callers need to tell
//! a wrong password apart from a missing config or an incompatible format.

use {
    blockvault_protocol::BlockId,
    std::{fmt::Display, io},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// A block failed authentication, carries another block's id, or
    /// contradicts the version ledger in a way a replay cannot explain.
    #[error("integrity violation at block {block}: {detail}")]
    Integrity { block: BlockId, detail: String },

    /// A block is older than the newest version this client has accepted.
    #[error("rollback detected at block {block}: {detail}")]
    Rollback { block: BlockId, detail: String },

    #[error("name already exists: {0}")]
    NameConflict(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structural corruption above the block layer, e.g. a directory entry
    /// pointing at a blob that does not exist.
    #[error("filesystem invalid: {0}")]
    FilesystemInvalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ledger storage error: {0}")]
    Ledger(#[from] sled::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn integrity(block: BlockId, detail: impl Display) -> Self {
        Self::Integrity {
            block,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn rollback(block: BlockId, detail: impl Display) -> Self {
        Self::Rollback {
            block,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn invalid(detail: impl Display) -> Self {
        Self::FilesystemInvalid(detail.to_string())
    }

    /// POSIX errno for a filesystem binding.
    #[must_use]
    #[inline]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Integrity { .. }
            | Self::Rollback { .. }
            | Self::FilesystemInvalid(_)
            | Self::Ledger(_)
            | Self::Other(_) => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::NameConflict(_) => libc::EEXIST,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Self::InvalidName(name) if name.len() > blockvault_protocol::MAX_NAME_LEN => {
                libc::ENAMETOOLONG
            }
            Self::InvalidName(_) | Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("wrong password")]
    WrongPassword,

    #[error("filesystem config not found at {0}")]
    ConfigMissing(String),

    #[error("config is not a filesystem config: {0}")]
    ConfigInvalid(String),

    #[error("filesystem invalid: {0}")]
    FilesystemInvalid(String),

    #[error("incompatible filesystem format version {found}, supported: {supported}")]
    IncompatibleVersion { found: u32, supported: String },

    #[error(
        "local integrity state for filesystem {0} is missing; \
        refusing to mount without opting into a fresh ledger"
    )]
    LedgerUnavailable(String),

    #[error("filesystem is bound to client {expected}, this client is {actual}")]
    ExclusiveClientMismatch { expected: String, actual: String },

    #[error(transparent)]
    Storage(#[from] Error),
}

impl From<io::Error> for UnlockError {
    fn from(err: io::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<sled::Error> for UnlockError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<anyhow::Error> for UnlockError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err.into())
    }
}
