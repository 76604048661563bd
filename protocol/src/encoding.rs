//! Compact binary encoding used for local state and the outer config record.

use {
    anyhow::{Result, ensure},
    serde::{Serialize, de::DeserializeOwned},
    std::io::Write,
};

fn config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::NoLimit,
> {
    bincode::config::legacy()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, config())
}

pub fn serialize_into<T: Serialize>(
    mut writer: impl Write,
    value: &T,
) -> Result<usize, bincode::error::EncodeError> {
    bincode::serde::encode_into_std_write(value, &mut writer, config())
}

/// Decodes a value that must span the whole input.
pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, len) = bincode::serde::decode_from_slice(data, config())?;
    ensure!(
        len == data.len(),
        "unexpected trailing data: {} bytes",
        data.len() - len
    );
    Ok(value)
}
