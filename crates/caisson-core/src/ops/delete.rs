use crate::error::Result;
use crate::lock::with_lock;
use crate::ops::Engine;
use crate::store::FilesetId;
use crate::volume::VolumeState;

#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Blocks that lost their last reference. Their bytes are reclaimed by
    /// the next compact, not here.
    pub blocks_unreferenced: u64,
}

/// Forget one fileset and its list volume. Block data is untouched; space
/// held by now-unreferenced blocks is reclaimed later by compact.
pub fn run(engine: &mut Engine, id: &FilesetId) -> Result<DeleteReport> {
    let storage = engine.storage.clone();
    with_lock(storage.as_ref(), || delete_locked(engine, id))
}

fn delete_locked(engine: &mut Engine, id: &FilesetId) -> Result<DeleteReport> {
    let before = engine.store.unreferenced_blocks().len() as u64;
    let (list_volume, list_name) = {
        let fileset = engine
            .store
            .fileset(id)
            .ok_or_else(|| crate::error::CaissonError::FilesetNotFound(id.to_hex()))?;
        let list_volume = fileset.list_volume;
        let name = engine
            .store
            .volume(&list_volume)
            .map(|v| v.remote_name.clone());
        (list_volume, name)
    };

    let mut tx = engine.store.begin();
    tx.remove_fileset(id)?;
    if list_name.is_some() {
        tx.transition_volume(&list_volume, VolumeState::Deleting)?;
    }
    tx.commit()?;

    if let Some(name) = &list_name {
        engine.storage.delete(name)?;
        let mut tx = engine.store.begin();
        tx.transition_volume(&list_volume, VolumeState::Deleted)?;
        tx.remove_volume(&list_volume)?;
        tx.commit()?;
    }

    let after = engine.store.unreferenced_blocks().len() as u64;
    let report = DeleteReport {
        blocks_unreferenced: after.saturating_sub(before),
    };
    tracing::info!(
        "deleted fileset {id}: {} blocks newly unreferenced",
        report.blocks_unreferenced
    );
    Ok(report)
}
