use std::collections::HashMap;

use crate::block_id::BlockId;
use crate::error::{CaissonError, Result};
use crate::store::{BlockRecord, MetadataStore};
use crate::volume::writer::VolumeEntry;
use crate::volume::VolumeId;

/// Committed location of a block inside a remote volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub volume_id: VolumeId,
    pub offset: u64,
    pub stored_size: u32,
}

/// Result of a block lookup during backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Committed in the store from an earlier run.
    Known(BlockLocation),
    /// Seen earlier in this run; its volume may not be sealed yet.
    Pending,
    /// Never seen. The caller must pack and upload it.
    Unknown,
}

struct PendingBlock {
    length: u32,
    location: Option<BlockLocation>,
}

/// Per-run deduplication index layered over the committed store.
///
/// Blocks first noted here become `Pending`; once their volume is sealed,
/// `note_sealed` fills in the location. `drain` converts the run's new
/// blocks into store records for the final commit.
#[derive(Default)]
pub struct RunIndex {
    pending: HashMap<BlockId, PendingBlock>,
}

impl RunIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, store: &MetadataStore, id: &BlockId) -> Lookup {
        if let Some(record) = store.block(id) {
            return Lookup::Known(BlockLocation {
                volume_id: record.volume_id,
                offset: record.offset,
                stored_size: record.stored_size,
            });
        }
        if self.pending.contains_key(id) {
            Lookup::Pending
        } else {
            Lookup::Unknown
        }
    }

    /// Claim a new block for this run. Returns `false` if another path of
    /// the same run already claimed it (first writer wins).
    pub fn note_pending(&mut self, id: BlockId, length: u32) -> bool {
        use std::collections::hash_map::Entry;
        match self.pending.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PendingBlock {
                    length,
                    location: None,
                });
                true
            }
        }
    }

    /// Record the final locations of blocks packed into a sealed volume.
    pub fn note_sealed(&mut self, volume_id: VolumeId, entries: &[VolumeEntry]) {
        for entry in entries {
            if let Some(pending) = self.pending.get_mut(&entry.block_id) {
                pending.location = Some(BlockLocation {
                    volume_id,
                    offset: entry.offset,
                    stored_size: entry.stored_size,
                });
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Convert all blocks of this run into store records. Fails if any block
    /// was claimed but never sealed into a volume.
    pub fn drain(&mut self) -> Result<Vec<(BlockId, BlockRecord)>> {
        let mut records = Vec::with_capacity(self.pending.len());
        for (id, pending) in self.pending.drain() {
            let location = pending.location.ok_or_else(|| {
                CaissonError::Consistency(format!("block {id} was never sealed into a volume"))
            })?;
            records.push((
                id,
                BlockRecord {
                    length: pending.length,
                    stored_size: location.stored_size,
                    volume_id: location.volume_id,
                    offset: location.offset,
                },
            ));
        }
        Ok(records)
    }
}
