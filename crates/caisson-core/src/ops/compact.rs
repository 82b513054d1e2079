use std::collections::HashMap;

use chrono::Utc;

use crate::block_id::BlockId;
use crate::error::{CaissonError, Result};
use crate::lock::with_lock;
use crate::ops::{CancelToken, Engine};
use crate::store::VolumeRecord;
use crate::volume::reader::read_raw_block;
use crate::volume::writer::{build_index_volume, VolumeWriter};
use crate::volume::{remote_name, VolumeId, VolumeKind, VolumeState};

pub struct CompactRequest {
    /// Minimum fraction of dead bytes (0.0 to 1.0) before a volume is
    /// rewritten. Fully dead volumes are always deleted.
    pub threshold: f64,
    pub dry_run: bool,
    pub cancel: CancelToken,
}

impl Default for CompactRequest {
    fn default() -> Self {
        Self {
            threshold: 0.25,
            dry_run: false,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompactStats {
    pub volumes_examined: u64,
    pub volumes_deleted: u64,
    pub volumes_rewritten: u64,
    pub blocks_dropped: u64,
    pub bytes_reclaimed: u64,
    pub dry_run: bool,
}

struct VolumeUsage {
    live: Vec<BlockId>,
    dead: Vec<BlockId>,
    live_bytes: u64,
    dead_bytes: u64,
}

pub fn run(engine: &mut Engine, request: CompactRequest) -> Result<CompactStats> {
    let storage = engine.storage.clone();
    with_lock(storage.as_ref(), || compact_locked(engine, &request))
}

fn compact_locked(engine: &mut Engine, request: &CompactRequest) -> Result<CompactStats> {
    let mut stats = CompactStats {
        dry_run: request.dry_run,
        ..Default::default()
    };

    // All accounting runs off the committed store; no remote reads are
    // needed to find wasted space.
    let referenced = engine.store.referenced_block_ids();
    let mut usage: HashMap<VolumeId, VolumeUsage> = HashMap::new();
    for (id, record) in engine.store.blocks() {
        let entry = usage.entry(record.volume_id).or_insert_with(|| VolumeUsage {
            live: Vec::new(),
            dead: Vec::new(),
            live_bytes: 0,
            dead_bytes: 0,
        });
        if referenced.contains(id) {
            entry.live.push(*id);
            entry.live_bytes += record.stored_size as u64;
        } else {
            entry.dead.push(*id);
            entry.dead_bytes += record.stored_size as u64;
        }
    }

    let mut candidates: Vec<VolumeId> = Vec::new();
    for (volume_id, record) in engine.store.volumes() {
        if record.kind != VolumeKind::Block || record.state != VolumeState::Verified {
            continue;
        }
        stats.volumes_examined += 1;
        let Some(use_info) = usage.get(volume_id) else {
            // A volume with no blocks at all is pure waste.
            candidates.push(*volume_id);
            continue;
        };
        let total = use_info.live_bytes + use_info.dead_bytes;
        if use_info.live.is_empty()
            || (total > 0 && use_info.dead_bytes as f64 / total as f64 >= request.threshold)
        {
            candidates.push(*volume_id);
        }
    }
    // Deterministic processing order.
    candidates.sort_by_key(|id| id.to_hex());

    for volume_id in candidates {
        request.cancel.check()?;
        let empty = VolumeUsage {
            live: Vec::new(),
            dead: Vec::new(),
            live_bytes: 0,
            dead_bytes: 0,
        };
        let use_info = usage.get(&volume_id).unwrap_or(&empty);
        if request.dry_run {
            if use_info.live.is_empty() {
                stats.volumes_deleted += 1;
            } else {
                stats.volumes_rewritten += 1;
            }
            stats.blocks_dropped += use_info.dead.len() as u64;
            stats.bytes_reclaimed += use_info.dead_bytes;
            continue;
        }
        if use_info.live.is_empty() {
            delete_volume(engine, &volume_id, &use_info.dead, &mut stats)?;
        } else {
            rewrite_volume(engine, &volume_id, use_info, &mut stats)?;
        }
    }

    tracing::info!(
        "compact{}: {} volumes deleted, {} rewritten, {} blocks dropped, {} bytes reclaimed",
        if stats.dry_run { " (dry run)" } else { "" },
        stats.volumes_deleted,
        stats.volumes_rewritten,
        stats.blocks_dropped,
        stats.bytes_reclaimed,
    );
    Ok(stats)
}

/// Drop a volume that holds no referenced blocks. The store transitions to
/// `Deleting` before any remote delete, so a crash in between leaves a
/// record pointing at the cleanup still owed.
fn delete_volume(
    engine: &mut Engine,
    volume_id: &VolumeId,
    dead: &[BlockId],
    stats: &mut CompactStats,
) -> Result<()> {
    let record = volume_record(engine, volume_id)?;
    let size = record.size;
    let has_index = record.has_index;
    let block_name = record.remote_name;

    let mut tx = engine.store.begin();
    for id in dead {
        tx.remove_block(id)?;
    }
    tx.transition_volume(volume_id, VolumeState::Deleting)?;
    tx.commit()?;

    engine.storage.delete(&block_name)?;
    if has_index {
        engine
            .storage
            .delete(&remote_name(VolumeKind::Index, volume_id))?;
    }

    let mut tx = engine.store.begin();
    tx.transition_volume(volume_id, VolumeState::Deleted)?;
    tx.remove_volume(volume_id)?;
    tx.commit()?;

    stats.volumes_deleted += 1;
    stats.blocks_dropped += dead.len() as u64;
    stats.bytes_reclaimed += size;
    Ok(())
}

/// Repack a volume's live blocks into a fresh volume. The sealed payloads
/// move verbatim; their AAD binds them to block ids, not volumes, so no
/// re-encryption is needed.
fn rewrite_volume(
    engine: &mut Engine,
    volume_id: &VolumeId,
    use_info: &VolumeUsage,
    stats: &mut CompactStats,
) -> Result<()> {
    let record = volume_record(engine, volume_id)?;

    let mut writer = VolumeWriter::new(usize::MAX);
    let mut live = use_info.live.clone();
    live.sort();
    for id in &live {
        let block = engine
            .store
            .block(id)
            .ok_or(CaissonError::BlockNotInIndex(*id))?;
        let sealed = read_raw_block(
            engine.storage.as_ref(),
            &record.remote_name,
            block.offset,
            block.stored_size,
        )?;
        writer.add_block(*id, sealed, block.length);
    }
    let sealed = writer.seal(engine.crypto.as_ref())?;
    let new_name = remote_name(VolumeKind::Block, &sealed.volume_id);
    let index_bytes =
        build_index_volume(&sealed.volume_id, &sealed.entries, engine.crypto.as_ref())?;
    engine.storage.put(&new_name, &sealed.bytes)?;
    engine
        .storage
        .put(&remote_name(VolumeKind::Index, &sealed.volume_id), &index_bytes)?;

    let new_size = sealed.bytes.len() as u64;
    let mut tx = engine.store.begin();
    tx.record_volume(
        sealed.volume_id,
        VolumeRecord {
            kind: VolumeKind::Block,
            remote_name: new_name,
            size: new_size,
            created_at: Utc::now(),
            state: VolumeState::Verified,
            has_index: true,
        },
    )?;
    for entry in &sealed.entries {
        tx.update_block_location(&entry.block_id, sealed.volume_id, entry.offset)?;
    }
    for id in &use_info.dead {
        tx.remove_block(id)?;
    }
    tx.transition_volume(volume_id, VolumeState::Deleting)?;
    tx.commit()?;

    engine.storage.delete(&record.remote_name)?;
    if record.has_index {
        engine
            .storage
            .delete(&remote_name(VolumeKind::Index, volume_id))?;
    }

    let mut tx = engine.store.begin();
    tx.transition_volume(volume_id, VolumeState::Deleted)?;
    tx.remove_volume(volume_id)?;
    tx.commit()?;

    stats.volumes_rewritten += 1;
    stats.blocks_dropped += use_info.dead.len() as u64;
    stats.bytes_reclaimed += record.size.saturating_sub(new_size);
    Ok(())
}

fn volume_record(engine: &Engine, volume_id: &VolumeId) -> Result<VolumeRecord> {
    engine
        .store
        .volume(volume_id)
        .cloned()
        .ok_or_else(|| CaissonError::Consistency(format!("unknown volume: {volume_id}")))
}
