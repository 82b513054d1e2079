use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::format::{seal_object, ObjectType};
use super::VolumeId;
use crate::block_id::BlockId;
use crate::compress::{compress, Compression};
use crate::crypto::CryptoEngine;
use crate::error::{CaissonError, Result};

/// Magic bytes at the start of every block volume.
pub const VOLUME_MAGIC: &[u8; 8] = b"CAISVOL\x01";
/// Block volume format version.
pub const VOLUME_VERSION: u8 = 1;
/// Size of the volume header (magic + version byte).
pub const VOLUME_HEADER_SIZE: usize = 9;

/// Maximum number of blocks in a single volume. Caps trailer size when many
/// tiny blocks would otherwise pile into one volume.
pub const MAX_BLOCKS_PER_VOLUME: usize = 10_000;

/// One entry in a volume's trailer: where a sealed block lives in the volume
/// and how long its plaintext is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub block_id: BlockId,
    /// Offset of the sealed payload, past its 4-byte length prefix.
    pub offset: u64,
    pub stored_size: u32,
    pub length: u32,
}

/// Payload of a companion index volume: the block volume's trailer listing,
/// readable without downloading any block data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVolumePayload {
    pub block_volume: VolumeId,
    pub entries: Vec<VolumeEntry>,
}

struct BlockMeta {
    block_id: BlockId,
    stored_size: u32,
    length: u32,
}

/// A sealed, ready-to-upload block volume.
pub struct SealedVolume {
    pub volume_id: VolumeId,
    pub bytes: Vec<u8>,
    pub entries: Vec<VolumeEntry>,
}

/// Compress-then-encrypt a plaintext block for storage inside a volume.
/// The AAD context is the block id, so a sealed payload can move between
/// volumes (compact) but cannot be substituted for a different block.
pub fn seal_block(
    plaintext: &[u8],
    compression: Compression,
    block_id: &BlockId,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let compressed = compress(compression, plaintext)?;
    seal_object(ObjectType::BlockData, &block_id.0, &compressed, crypto)
}

/// Accumulates sealed block payloads and produces finished volumes.
///
/// Payloads are appended directly into one contiguous buffer as
/// `[4-byte LE length][sealed payload]`, so sealing only appends the
/// encrypted trailer; no second volume-sized buffer is needed.
pub struct VolumeWriter {
    target_size: usize,
    bytes: Vec<u8>,
    meta: Vec<BlockMeta>,
    current_size: usize,
    pending: HashMap<BlockId, u32>,
}

impl VolumeWriter {
    pub fn new(target_size: usize) -> Self {
        Self {
            target_size,
            bytes: Vec::new(),
            meta: Vec::new(),
            current_size: 0,
            pending: HashMap::new(),
        }
    }

    /// Append a sealed block payload. Returns the offset within the volume
    /// where the payload starts (past its 4-byte length prefix).
    pub fn add_block(&mut self, block_id: BlockId, sealed: Vec<u8>, length: u32) -> u64 {
        let stored_size = sealed.len() as u32;

        if self.meta.is_empty() {
            self.bytes.extend_from_slice(VOLUME_MAGIC);
            self.bytes.push(VOLUME_VERSION);
        }

        let offset = VOLUME_HEADER_SIZE as u64 + self.current_size as u64 + 4;

        self.bytes.extend_from_slice(&stored_size.to_le_bytes());
        self.bytes.extend_from_slice(&sealed);
        self.current_size += 4 + sealed.len();
        debug_assert_eq!(self.bytes.len(), VOLUME_HEADER_SIZE + self.current_size);

        self.pending.insert(block_id, stored_size);
        self.meta.push(BlockMeta {
            block_id,
            stored_size,
            length,
        });

        offset
    }

    /// Whether a block is buffered in this writer (not yet sealed).
    pub fn contains_pending(&self, block_id: &BlockId) -> bool {
        self.pending.contains_key(block_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.meta.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.meta.len()
    }

    /// Whether the buffered volume should be sealed and uploaded.
    pub fn should_flush(&self) -> bool {
        if self.meta.is_empty() {
            return false;
        }
        self.current_size >= self.target_size || self.meta.len() >= MAX_BLOCKS_PER_VOLUME
    }

    /// Assign a fresh volume id, append the encrypted trailer, and hand the
    /// finished volume to the caller. The writer is cleared for reuse.
    ///
    /// Trailer layout: `[sealed trailer][4-byte LE trailer length]`, read back
    /// from the end of the volume. The trailer is fallibly built before the
    /// buffer is touched, so a failed seal leaves the writer intact.
    pub fn seal(&mut self, crypto: &dyn CryptoEngine) -> Result<SealedVolume> {
        if self.meta.is_empty() {
            return Err(CaissonError::Other("cannot seal empty volume writer".into()));
        }

        let mut entries: Vec<VolumeEntry> = Vec::with_capacity(self.meta.len());
        let mut running_offset = VOLUME_HEADER_SIZE;
        for meta in &self.meta {
            let offset = running_offset as u64 + 4;
            running_offset += 4 + meta.stored_size as usize;
            entries.push(VolumeEntry {
                block_id: meta.block_id,
                offset,
                stored_size: meta.stored_size,
                length: meta.length,
            });
        }

        let volume_id = VolumeId::random();
        let trailer_bytes = rmp_serde::to_vec(&entries)?;
        let sealed_trailer = seal_object(
            ObjectType::VolumeTrailer,
            &volume_id.0,
            &trailer_bytes,
            crypto,
        )?;

        let trailer_len = sealed_trailer.len() as u32;
        self.bytes.extend_from_slice(&sealed_trailer);
        self.bytes.extend_from_slice(&trailer_len.to_le_bytes());

        let bytes = std::mem::take(&mut self.bytes);
        self.meta.clear();
        self.current_size = 0;
        self.pending.clear();

        Ok(SealedVolume {
            volume_id,
            bytes,
            entries,
        })
    }
}

/// Build the sealed payload of a companion index volume for a block volume.
pub fn build_index_volume(
    volume_id: &VolumeId,
    entries: &[VolumeEntry],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let payload = IndexVolumePayload {
        block_volume: *volume_id,
        entries: entries.to_vec(),
    };
    let bytes = rmp_serde::to_vec(&payload)?;
    seal_object(ObjectType::VolumeIndex, &volume_id.0, &bytes, crypto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextEngine;

    fn dummy_id(byte: u8) -> BlockId {
        BlockId([byte; 32])
    }

    fn engine() -> PlaintextEngine {
        PlaintextEngine::new(&[0u8; 32])
    }

    #[test]
    fn should_flush_on_size() {
        let mut w = VolumeWriter::new(100);
        assert!(!w.should_flush());
        w.add_block(dummy_id(1), vec![0u8; 120], 120);
        assert!(w.should_flush());
    }

    #[test]
    fn should_flush_on_block_count() {
        let mut w = VolumeWriter::new(usize::MAX);
        for i in 0..MAX_BLOCKS_PER_VOLUME {
            assert!(!w.should_flush(), "should not flush at {i} blocks");
            let mut id = [0u8; 32];
            id[0..4].copy_from_slice(&(i as u32).to_le_bytes());
            w.add_block(BlockId(id), vec![1], 1);
        }
        assert!(w.should_flush());
    }

    #[test]
    fn offsets_account_for_header_and_prefixes() {
        let mut w = VolumeWriter::new(usize::MAX);
        let off1 = w.add_block(dummy_id(1), vec![0xAA; 10], 10);
        let off2 = w.add_block(dummy_id(2), vec![0xBB; 20], 20);
        assert_eq!(off1, (VOLUME_HEADER_SIZE + 4) as u64);
        assert_eq!(off2, off1 + 10 + 4);
    }

    #[test]
    fn seal_produces_matching_entries_and_clears_writer() {
        let mut w = VolumeWriter::new(usize::MAX);
        let off1 = w.add_block(dummy_id(1), vec![0xAA; 10], 100);
        let off2 = w.add_block(dummy_id(2), vec![0xBB; 20], 200);
        assert!(w.contains_pending(&dummy_id(1)));

        let sealed = w.seal(&engine()).unwrap();
        assert_eq!(sealed.entries.len(), 2);
        assert_eq!(sealed.entries[0].offset, off1);
        assert_eq!(sealed.entries[1].offset, off2);
        assert_eq!(sealed.entries[0].stored_size, 10);
        assert_eq!(sealed.entries[1].length, 200);
        assert_eq!(&sealed.bytes[..8], VOLUME_MAGIC);

        assert!(!w.has_pending());
        assert!(!w.contains_pending(&dummy_id(1)));
        assert_eq!(w.block_count(), 0);
    }

    #[test]
    fn seal_empty_writer_fails() {
        let mut w = VolumeWriter::new(100);
        assert!(w.seal(&engine()).is_err());
    }

    #[test]
    fn sealed_payload_lands_at_reported_offset() {
        let mut w = VolumeWriter::new(usize::MAX);
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let off = w.add_block(dummy_id(7), payload.clone(), 4);
        let sealed = w.seal(&engine()).unwrap();
        let start = off as usize;
        assert_eq!(&sealed.bytes[start..start + 4], payload.as_slice());
    }

    #[test]
    fn seal_block_binds_to_block_id() {
        use crate::crypto::Aes256GcmEngine;
        use crate::volume::format::open_object;

        let crypto = Aes256GcmEngine::new(&[0x11; 32], &[0x22; 32]);
        let sealed = seal_block(b"plaintext", Compression::Lz4, &dummy_id(3), &crypto).unwrap();
        // Opens under the right id...
        assert!(open_object(&sealed, &dummy_id(3).0, &crypto).is_ok());
        // ...and refuses the wrong one.
        assert!(open_object(&sealed, &dummy_id(4).0, &crypto).is_err());
    }
}
