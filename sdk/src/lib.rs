//! Encrypted, integrity-protected block filesystem.
//!
//! Layers, bottom up:
//!
//! - [`blockstore`]: raw block containers, the block codec and the rollback-guarded store
//! - [`blob`]: variable-size blobs built as trees of blocks
//! - [`fsblob`]: files, directories and symlinks stored in blobs
//! - [`device`] and [`fs`]: path-addressed filesystem operations
//! - [`config`] and [`vault`]: the encrypted config and mounting

pub mod blob;
pub mod blockstore;
pub mod config;
pub mod crypto;
pub mod device;
mod error;
pub mod fs;
pub mod fsblob;
pub mod vault;

pub use {
    error::{Error, Result, UnlockError},
    vault::{CreateOptions, UnlockOptions, Vault},
};
