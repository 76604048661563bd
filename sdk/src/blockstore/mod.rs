//! Block storage layers.
//!
//! A [`BlockContainer`] stores opaque byte strings by [`BlockId`] and gives no
//! guarantees of its own. The [`codec`] encrypts single blocks, and
//! [`IntegrityBlockStore`] adds version tracking on top of it so that replayed or
//! swapped blocks are rejected.

pub mod codec;
mod integrity;
mod memory;
mod ondisk;

pub use {
    codec::{BlockCodec, BlockHeader},
    integrity::{IntegrityBlockStore, LastWriter, Ledger, LedgerEntry, LedgerLocation},
    memory::InMemoryContainer,
    ondisk::OnDiskContainer,
};

use {
    crate::Result,
    blockvault_protocol::{BlockId, ID_LEN},
};

/// Reserved id of the block holding the encrypted filesystem config
/// when the config is stored inside the container.
pub const CONFIG_BLOCK_ID: BlockId = BlockId::from_bytes([0; ID_LEN]);

/// Raw key-value storage for blocks.
pub trait BlockContainer: Send + Sync {
    fn get(&self, id: &BlockId) -> Result<Option<Vec<u8>>>;

    /// Stores `data` under `id`, replacing the previous value. The write must be atomic.
    fn put(&self, id: &BlockId, data: &[u8]) -> Result<()>;

    /// Returns `false` if there was no block with this id.
    fn remove(&self, id: &BlockId) -> Result<bool>;

    fn exists(&self, id: &BlockId) -> Result<bool>;

    fn list_ids(&self) -> Result<Vec<BlockId>>;
}
