use super::format::{open_object_expect, ObjectType};
use super::writer::{IndexVolumePayload, VolumeEntry, VOLUME_HEADER_SIZE, VOLUME_MAGIC};
use super::VolumeId;
use crate::block_id::BlockId;
use crate::compress::decompress;
use crate::crypto::CryptoEngine;
use crate::error::{CaissonError, Result};
use crate::storage::StorageBackend;

/// Decrypt, decompress, and verify one sealed block payload.
///
/// The recomputed keyed hash must match the expected id; a mismatch means
/// remote corruption that authenticated-decrypted cleanly (or a hash
/// collision), and is unrecoverable.
pub fn open_block(sealed: &[u8], block_id: &BlockId, crypto: &dyn CryptoEngine) -> Result<Vec<u8>> {
    let compressed = open_object_expect(sealed, ObjectType::BlockData, &block_id.0, crypto)?;
    let plaintext = decompress(&compressed)?;
    let recomputed = BlockId::compute(crypto.block_id_key(), &plaintext);
    if recomputed != *block_id {
        return Err(CaissonError::BlockIdMismatch {
            expected: *block_id,
            actual: recomputed,
        });
    }
    Ok(plaintext)
}

/// Fetch one block from a remote volume with a range read and open it.
pub fn read_block(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    volume_name: &str,
    offset: u64,
    stored_size: u32,
    block_id: &BlockId,
) -> Result<Vec<u8>> {
    let sealed = read_raw_block(storage, volume_name, offset, stored_size)?;
    open_block(&sealed, block_id, crypto)
}

/// Fetch one sealed payload without opening it. Used by compact to move
/// blocks between volumes without re-encrypting.
pub fn read_raw_block(
    storage: &dyn StorageBackend,
    volume_name: &str,
    offset: u64,
    stored_size: u32,
) -> Result<Vec<u8>> {
    let data = storage
        .get_range(volume_name, offset, stored_size as u64)?
        .ok_or_else(|| CaissonError::Consistency(format!("volume not found: {volume_name}")))?;
    if data.len() != stored_size as usize {
        return Err(CaissonError::InvalidFormat(format!(
            "short read from {volume_name} at offset {offset}: expected {stored_size} bytes, got {}",
            data.len()
        )));
    }
    Ok(data)
}

/// Download a whole block volume and parse its trailer.
pub fn read_volume_entries(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    volume_id: &VolumeId,
    volume_name: &str,
) -> Result<Vec<VolumeEntry>> {
    let data = storage
        .get(volume_name)?
        .ok_or_else(|| CaissonError::Consistency(format!("volume not found: {volume_name}")))?;
    parse_volume_entries(&data, volume_id, crypto)
}

/// Parse the trailer from already-downloaded volume bytes.
pub fn parse_volume_entries(
    data: &[u8],
    volume_id: &VolumeId,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<VolumeEntry>> {
    if data.len() < VOLUME_HEADER_SIZE + 4 {
        return Err(CaissonError::InvalidFormat("volume too small".into()));
    }
    if &data[..8] != VOLUME_MAGIC {
        return Err(CaissonError::InvalidFormat("invalid volume magic".into()));
    }

    let len_offset = data.len() - 4;
    let trailer_len = u32::from_le_bytes(
        data[len_offset..]
            .try_into()
            .map_err(|_| CaissonError::InvalidFormat("invalid trailer length field".into()))?,
    ) as usize;
    if trailer_len + 4 > data.len() - VOLUME_HEADER_SIZE {
        return Err(CaissonError::InvalidFormat("invalid trailer length".into()));
    }

    let trailer_start = len_offset - trailer_len;
    let sealed_trailer = &data[trailer_start..len_offset];

    let trailer_bytes =
        open_object_expect(sealed_trailer, ObjectType::VolumeTrailer, &volume_id.0, crypto)?;
    let entries: Vec<VolumeEntry> = rmp_serde::from_slice(&trailer_bytes)?;
    Ok(entries)
}

/// Download and open a companion index volume.
pub fn read_index_volume(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    volume_id: &VolumeId,
    index_name: &str,
) -> Result<IndexVolumePayload> {
    let data = storage
        .get(index_name)?
        .ok_or_else(|| CaissonError::Consistency(format!("index volume not found: {index_name}")))?;
    let bytes = open_object_expect(&data, ObjectType::VolumeIndex, &volume_id.0, crypto)?;
    let payload: IndexVolumePayload = rmp_serde::from_slice(&bytes)?;
    Ok(payload)
}
