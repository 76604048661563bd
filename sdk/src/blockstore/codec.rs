//! Encryption of single blocks.
//!
//! Block layout:
//!
//! - format (16 bits, little endian)
//! - block id (128 bits)
//! - id of the writing client (32 bits, little endian)
//! - block version (64 bits, little endian)
//! - AEAD ciphertext of: payload length (32 bits, little endian), payload, zero padding
//!
//! The first four fields form the header, which is authenticated as associated data.
//! Every encoded block has exactly the configured block size.

use {
    crate::{Error, Result, crypto::AeadCipher},
    anyhow::Context,
    blockvault_protocol::{BlockId, ClientId, ID_LEN},
    byteorder::{ByteOrder, LE, WriteBytesExt},
    sha2::{Digest, Sha256},
    std::sync::Arc,
};

pub const BLOCK_FORMAT: u16 = 1;
pub const HEADER_LEN: usize = 2 + ID_LEN + 4 + 8;
const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub id: BlockId,
    pub client: ClientId,
    pub version: u64,
}

impl BlockHeader {
    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&BLOCK_FORMAT.to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.client.0.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf
    }

    fn parse(expected_id: &BlockId, data: &[u8]) -> Result<Self> {
        let header = data
            .get(..HEADER_LEN)
            .ok_or_else(|| Error::integrity(*expected_id, "block is shorter than its header"))?;
        let (format, rest) = header.split_at(2);
        let (id, rest) = rest.split_at(ID_LEN);
        let (client, version) = rest.split_at(4);
        let format = LE::read_u16(format);
        if format != BLOCK_FORMAT {
            return Err(Error::integrity(
                *expected_id,
                format!("unknown block format {format}"),
            ));
        }
        let id = BlockId::from_slice(id)?;
        if id != *expected_id {
            return Err(Error::integrity(
                *expected_id,
                format!("block contains id {id}"),
            ));
        }
        Ok(Self {
            id,
            client: ClientId(LE::read_u32(client)),
            version: LE::read_u64(version),
        })
    }

    /// Nonce unique for each (block, client, version) triple.
    fn nonce(&self, len: usize) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"blockvault-nonce");
        hasher.update(self.id.as_bytes());
        hasher.update(self.client.0.to_le_bytes());
        hasher.update(self.version.to_le_bytes());
        let mut digest = hasher.finalize().to_vec();
        digest.truncate(len);
        digest
    }
}

/// Encrypts and decrypts blocks of a fixed size with the filesystem cipher.
pub struct BlockCodec {
    cipher: Arc<dyn AeadCipher>,
    block_size: usize,
}

impl BlockCodec {
    #[inline]
    pub fn new(cipher: Arc<dyn AeadCipher>, block_size: usize) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE || u32::try_from(block_size).is_err() {
            return Err(Error::InvalidArgument(format!(
                "unsupported block size {block_size}, must be at least {MIN_BLOCK_SIZE} bytes"
            )));
        }
        if cipher.nonce_size() > <Sha256 as Digest>::output_size() {
            return Err(Error::InvalidArgument(format!(
                "unsupported nonce size of {}",
                cipher.name()
            )));
        }
        Ok(Self { cipher, block_size })
    }

    #[must_use]
    #[inline]
    pub fn cipher(&self) -> &Arc<dyn AeadCipher> {
        &self.cipher
    }

    #[must_use]
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximal plaintext length that fits into one block.
    #[must_use]
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.block_size
            .saturating_sub(HEADER_LEN)
            .saturating_sub(self.cipher.overhead())
            .saturating_sub(LENGTH_PREFIX_LEN)
    }

    #[inline]
    pub fn encode(&self, header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>> {
        let max = self.payload_size();
        if payload.len() > max {
            return Err(Error::InvalidArgument(format!(
                "block payload of {} bytes exceeds {max}",
                payload.len()
            )));
        }
        let mut plaintext = Vec::with_capacity(max.saturating_add(LENGTH_PREFIX_LEN));
        plaintext.write_u32::<LE>(u32::try_from(payload.len()).context("payload too large")?)?;
        plaintext.extend_from_slice(payload);
        plaintext.resize(max.saturating_add(LENGTH_PREFIX_LEN), 0);

        let aad = header.to_bytes();
        let ciphertext =
            self.cipher
                .encrypt(&header.nonce(self.cipher.nonce_size()), &aad, &plaintext)?;
        let mut block = aad;
        block.extend_from_slice(&ciphertext);
        debug_assert_eq!(block.len(), self.block_size);
        Ok(block)
    }

    /// Decodes a block fetched under `expected_id`.
    ///
    /// Any mismatch (size, format, id, authentication) is an integrity error.
    #[inline]
    pub fn decode(&self, expected_id: &BlockId, block: &[u8]) -> Result<(BlockHeader, Vec<u8>)> {
        if block.len() != self.block_size {
            return Err(Error::integrity(
                *expected_id,
                format!(
                    "unexpected block size {}, expected {}",
                    block.len(),
                    self.block_size
                ),
            ));
        }
        let header = BlockHeader::parse(expected_id, block)?;
        let (aad, ciphertext) = block.split_at(HEADER_LEN);
        let plaintext = self
            .cipher
            .decrypt(&header.nonce(self.cipher.nonce_size()), aad, ciphertext)
            .map_err(|_| Error::integrity(*expected_id, "authentication failed"))?;
        let payload = plaintext
            .get(..LENGTH_PREFIX_LEN)
            .and_then(|len| usize::try_from(LE::read_u32(len)).ok())
            .and_then(|len| plaintext.get(LENGTH_PREFIX_LEN..)?.get(..len))
            .ok_or_else(|| Error::integrity(*expected_id, "invalid payload length"))?;
        Ok((header, payload.to_vec()))
    }
}
