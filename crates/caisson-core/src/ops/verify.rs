use std::collections::HashMap;

use crate::error::Result;
use crate::ops::{CancelToken, Engine};
use crate::volume::reader::{open_block, parse_volume_entries, read_index_volume};
use crate::volume::{parse_remote_name, remote_name, VolumeId, VolumeKind, VolumeState};

pub struct VerifyRequest {
    /// Number of block volumes to download and fully check. Zero means
    /// presence checks only.
    pub sample_volumes: usize,
    pub cancel: CancelToken,
}

impl Default for VerifyRequest {
    fn default() -> Self {
        Self {
            sample_volumes: 1,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub remote_objects: u64,
    /// Remote volume objects the store knows nothing about.
    pub orphaned: Vec<String>,
    /// Store volumes whose remote object is gone.
    pub missing: Vec<String>,
    pub volumes_checked: u64,
    pub blocks_checked: u64,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.missing.is_empty() && self.errors.is_empty()
    }
}

/// Check the repository against its remote objects. Never mutates anything,
/// remote or local.
pub fn run(engine: &Engine, request: VerifyRequest) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    // Map every remote volume object back to a store record.
    let mut remote_volumes: HashMap<String, (VolumeKind, VolumeId)> = HashMap::new();
    for key in engine.storage.list("")? {
        request.cancel.check()?;
        report.remote_objects += 1;
        if let Some((kind, id)) = parse_remote_name(&key) {
            remote_volumes.insert(key, (kind, id));
        }
    }

    for (key, (kind, id)) in &remote_volumes {
        let known = match kind {
            VolumeKind::Block | VolumeKind::List => engine.store.volume(id).is_some(),
            VolumeKind::Index => engine.store.volume(id).is_some_and(|v| v.has_index),
        };
        if !known {
            report.orphaned.push(key.clone());
        }
    }
    report.orphaned.sort();

    // Every volume the store believes is uploaded must still exist.
    for (id, record) in engine.store.volumes() {
        request.cancel.check()?;
        if record.state != VolumeState::Verified {
            continue;
        }
        if !engine.storage.exists(&record.remote_name)? {
            report.missing.push(record.remote_name.clone());
        }
        if record.has_index {
            let index_name = remote_name(VolumeKind::Index, id);
            if !engine.storage.exists(&index_name)? {
                report.missing.push(index_name);
            }
        }
    }
    report.missing.sort();

    // Deep-check a sample of block volumes: trailer, companion index, and
    // every sealed block inside.
    let mut block_volumes: Vec<(VolumeId, String)> = engine
        .store
        .volumes()
        .filter(|(_, r)| r.kind == VolumeKind::Block && r.state == VolumeState::Verified)
        .map(|(id, r)| (*id, r.remote_name.clone()))
        .collect();
    block_volumes.sort_by(|a, b| a.1.cmp(&b.1));

    for (volume_id, name) in block_volumes.iter().take(request.sample_volumes) {
        request.cancel.check()?;
        if let Err(e) = check_block_volume(engine, volume_id, name, &mut report) {
            report.errors.push(format!("{name}: {e}"));
        }
        report.volumes_checked += 1;
    }

    Ok(report)
}

fn check_block_volume(
    engine: &Engine,
    volume_id: &VolumeId,
    name: &str,
    report: &mut VerifyReport,
) -> Result<()> {
    let Some(data) = engine.storage.get(name)? else {
        // Already counted as missing above.
        return Ok(());
    };
    let entries = parse_volume_entries(&data, volume_id, engine.crypto.as_ref())?;

    let has_index = engine
        .store
        .volume(volume_id)
        .is_some_and(|v| v.has_index);
    if has_index {
        let index_name = remote_name(VolumeKind::Index, volume_id);
        match read_index_volume(engine.storage.as_ref(), engine.crypto.as_ref(), volume_id, &index_name) {
            Ok(payload) => {
                if payload.entries != entries {
                    report
                        .errors
                        .push(format!("{name}: index volume disagrees with trailer"));
                }
            }
            Err(e) => report.errors.push(format!("{index_name}: {e}")),
        }
    }

    for entry in &entries {
        let start = entry.offset as usize;
        let end = start + entry.stored_size as usize;
        if end > data.len() {
            report
                .errors
                .push(format!("{name}: entry for {} out of bounds", entry.block_id));
            continue;
        }
        // Opening recomputes the keyed hash, so this catches any plaintext
        // corruption the cipher tag alone would miss.
        if let Err(e) = open_block(&data[start..end], &entry.block_id, engine.crypto.as_ref()) {
            report
                .errors
                .push(format!("{name}: block {}: {e}", entry.block_id));
            continue;
        }
        report.blocks_checked += 1;

        // Live blocks must agree with the store about where they are.
        if let Some(record) = engine.store.block(&entry.block_id) {
            if record.volume_id == *volume_id
                && (record.offset != entry.offset || record.stored_size != entry.stored_size)
            {
                report.errors.push(format!(
                    "{name}: store location for {} disagrees with trailer",
                    entry.block_id
                ));
            }
        }
    }

    // Every store block claimed to live here must appear in the trailer.
    for (id, record) in engine.store.blocks() {
        if record.volume_id == *volume_id && !entries.iter().any(|e| e.block_id == *id) {
            report
                .errors
                .push(format!("{name}: store block {id} missing from trailer"));
        }
    }

    Ok(())
}
