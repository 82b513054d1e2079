use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::block_id::BlockId;
use crate::error::{CaissonError, Result};
use crate::volume::{VolumeId, VolumeKind, VolumeState};

/// Current store schema version. Opening a store written by a different
/// schema is fatal; silent misreads of unknown layouts are worse than a
/// hard error.
pub const STORE_VERSION: u32 = 1;

/// Random 128-bit fileset identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesetId(pub [u8; 16]);

impl FilesetId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        FilesetId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for FilesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilesetId({})", self.to_hex())
    }
}

impl fmt::Display for FilesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Where a block's sealed payload lives and how big it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub length: u32,
    pub stored_size: u32,
    pub volume_id: VolumeId,
    pub offset: u64,
}

/// A remote volume known to the store.
///
/// Block volumes with `has_index` also have a companion index volume under
/// the same id; it is not tracked as a separate record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub kind: VolumeKind,
    pub remote_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub state: VolumeState,
    pub has_index: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Reference to one block of a file's content, in content order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: BlockId,
    pub length: u32,
}

/// One filesystem entry captured by a fileset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub mtime_ns: i64,
    pub mode: u32,
    /// Ordered content blocks; empty for directories and symlinks.
    pub blocks: Vec<BlockRef>,
    pub link_target: Option<String>,
}

/// A point-in-time snapshot: the full list of entries plus the id of the
/// remote list volume carrying the same manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetRecord {
    pub id: FilesetId,
    pub time: DateTime<Utc>,
    pub list_volume: VolumeId,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    blocks: HashMap<BlockId, BlockRecord>,
    volumes: HashMap<VolumeId, VolumeRecord>,
    filesets: Vec<FilesetRecord>,
}

/// Transactional metadata store persisted as a single MessagePack document.
///
/// Writes go through [`Transaction`]; a transaction stages changes against a
/// copy of the committed state and `commit` persists the copy with a
/// write-temp-then-rename, so a crash at any point leaves the previous
/// committed state intact. Readers only ever see committed state.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    state: StoreState,
}

impl MetadataStore {
    /// Create a fresh store file. Fails if one already exists.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(CaissonError::RepoAlreadyExists(
                path.to_string_lossy().into_owned(),
            ));
        }
        let state = StoreState {
            version: STORE_VERSION,
            ..Default::default()
        };
        persist_state(path, &state)?;
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Open an existing store file, checking the schema version.
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let state: StoreState = rmp_serde::from_slice(&data)?;
        if state.version != STORE_VERSION {
            return Err(CaissonError::UnsupportedVersion(state.version));
        }
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Begin a transaction. The `&mut` borrow enforces the single writer.
    pub fn begin(&mut self) -> Transaction<'_> {
        let staged = self.state.clone();
        Transaction {
            store: self,
            staged,
            active: true,
        }
    }

    // ── Committed-state queries ─────────────────────────────────────────

    pub fn block(&self, id: &BlockId) -> Option<&BlockRecord> {
        self.state.blocks.get(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&BlockId, &BlockRecord)> {
        self.state.blocks.iter()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<&VolumeRecord> {
        self.state.volumes.get(id)
    }

    pub fn volumes(&self) -> impl Iterator<Item = (&VolumeId, &VolumeRecord)> {
        self.state.volumes.iter()
    }

    /// All filesets, oldest first.
    pub fn filesets(&self) -> Vec<&FilesetRecord> {
        let mut sets: Vec<&FilesetRecord> = self.state.filesets.iter().collect();
        sets.sort_by_key(|f| f.time);
        sets
    }

    pub fn fileset(&self, id: &FilesetId) -> Option<&FilesetRecord> {
        self.state.filesets.iter().find(|f| f.id == *id)
    }

    /// Resolve a restore point: the most recent fileset not newer than `at`,
    /// or the most recent fileset overall when `at` is `None`.
    pub fn resolve_fileset(&self, at: Option<DateTime<Utc>>) -> Result<&FilesetRecord> {
        let candidate = match at {
            None => self.filesets().into_iter().next_back(),
            Some(t) => self
                .filesets()
                .into_iter()
                .filter(|f| f.time <= t)
                .next_back(),
        };
        candidate.ok_or_else(|| match at {
            None => CaissonError::FilesetNotFound("no filesets in repository".into()),
            Some(t) => CaissonError::FilesetNotFound(format!("no fileset at or before {t}")),
        })
    }

    /// Ordered block references for one file in one fileset.
    pub fn blocks_for_file(&self, fileset: &FilesetId, path: &str) -> Result<&[BlockRef]> {
        let fs = self
            .fileset(fileset)
            .ok_or_else(|| CaissonError::FilesetNotFound(fileset.to_hex()))?;
        let entry = fs
            .entries
            .iter()
            .find(|e| e.path == path)
            .ok_or_else(|| CaissonError::Other(format!("no such file in fileset: {path}")))?;
        Ok(&entry.blocks)
    }

    /// Block ids referenced by at least one fileset.
    pub fn referenced_block_ids(&self) -> HashSet<BlockId> {
        let mut referenced = HashSet::new();
        for fileset in &self.state.filesets {
            for entry in &fileset.entries {
                for block in &entry.blocks {
                    referenced.insert(block.id);
                }
            }
        }
        referenced
    }

    /// Blocks present in the store that no fileset references. These are
    /// candidates for space reclamation by compact.
    pub fn unreferenced_blocks(&self) -> Vec<BlockId> {
        let referenced = self.referenced_block_ids();
        self.state
            .blocks
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect()
    }
}

fn persist_state(path: &Path, state: &StoreState) -> Result<()> {
    let data = rmp_serde::to_vec(state)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(&data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Staged mutations against a copy of the committed state.
///
/// `commit` is all-or-nothing: the staged state is persisted first and only
/// then swapped in as the committed state. After `rollback`, every further
/// write (and commit) fails with `InvalidTransaction`.
pub struct Transaction<'a> {
    store: &'a mut MetadataStore,
    staged: StoreState,
    active: bool,
}

impl Transaction<'_> {
    fn check_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(CaissonError::InvalidTransaction)
        }
    }

    pub fn record_block(&mut self, id: BlockId, record: BlockRecord) -> Result<()> {
        self.check_active()?;
        self.staged.blocks.insert(id, record);
        Ok(())
    }

    pub fn update_block_location(
        &mut self,
        id: &BlockId,
        volume_id: VolumeId,
        offset: u64,
    ) -> Result<()> {
        self.check_active()?;
        let record = self
            .staged
            .blocks
            .get_mut(id)
            .ok_or(CaissonError::BlockNotInIndex(*id))?;
        record.volume_id = volume_id;
        record.offset = offset;
        Ok(())
    }

    pub fn remove_block(&mut self, id: &BlockId) -> Result<()> {
        self.check_active()?;
        self.staged.blocks.remove(id);
        Ok(())
    }

    pub fn record_volume(&mut self, id: VolumeId, record: VolumeRecord) -> Result<()> {
        self.check_active()?;
        self.staged.volumes.insert(id, record);
        Ok(())
    }

    /// Advance a volume's state, validating the transition.
    pub fn transition_volume(&mut self, id: &VolumeId, to: VolumeState) -> Result<()> {
        self.check_active()?;
        let record = self
            .staged
            .volumes
            .get_mut(id)
            .ok_or_else(|| CaissonError::Consistency(format!("unknown volume: {id}")))?;
        record.state = record.state.transition(to)?;
        Ok(())
    }

    pub fn remove_volume(&mut self, id: &VolumeId) -> Result<()> {
        self.check_active()?;
        self.staged.volumes.remove(id);
        Ok(())
    }

    pub fn record_fileset(&mut self, record: FilesetRecord) -> Result<()> {
        self.check_active()?;
        self.staged.filesets.push(record);
        Ok(())
    }

    pub fn remove_fileset(&mut self, id: &FilesetId) -> Result<()> {
        self.check_active()?;
        let before = self.staged.filesets.len();
        self.staged.filesets.retain(|f| f.id != *id);
        if self.staged.filesets.len() == before {
            return Err(CaissonError::FilesetNotFound(id.to_hex()));
        }
        Ok(())
    }

    /// Persist the staged state and make it the committed state.
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        persist_state(&self.store.path, &self.staged)?;
        self.store.state = std::mem::take(&mut self.staged);
        Ok(())
    }

    /// Discard all staged changes. The transaction is dead afterwards.
    pub fn rollback(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::create(&dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    fn block_record(volume_id: VolumeId) -> BlockRecord {
        BlockRecord {
            length: 100,
            stored_size: 80,
            volume_id,
            offset: 13,
        }
    }

    fn volume_record(state: VolumeState) -> VolumeRecord {
        VolumeRecord {
            kind: VolumeKind::Block,
            remote_name: "caisson-b00.dblock".into(),
            size: 1000,
            created_at: Utc::now(),
            state,
            has_index: true,
        }
    }

    fn fileset_at(ts: i64, blocks: Vec<BlockRef>) -> FilesetRecord {
        FilesetRecord {
            id: FilesetId::random(),
            time: Utc.timestamp_opt(ts, 0).unwrap(),
            list_volume: VolumeId::random(),
            entries: vec![FileEntry {
                path: "/data/file".into(),
                kind: FileKind::File,
                size: 100,
                mtime_ns: 0,
                mode: 0o644,
                blocks,
                link_target: None,
            }],
        }
    }

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let mut store = MetadataStore::create(&path).unwrap();

        let vid = VolumeId::random();
        let bid = BlockId([0x01; 32]);
        let mut tx = store.begin();
        tx.record_volume(vid, volume_record(VolumeState::Verified)).unwrap();
        tx.record_block(bid, block_record(vid)).unwrap();
        tx.commit().unwrap();

        let reopened = MetadataStore::open(&path).unwrap();
        assert_eq!(reopened.block(&bid).unwrap().volume_id, vid);
        assert_eq!(reopened.volume(&vid).unwrap().state, VolumeState::Verified);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        MetadataStore::create(&path).unwrap();
        assert!(MetadataStore::create(&path).is_err());
    }

    #[test]
    fn open_rejects_future_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let state = StoreState {
            version: STORE_VERSION + 1,
            ..Default::default()
        };
        persist_state(&path, &state).unwrap();
        match MetadataStore::open(&path) {
            Err(CaissonError::UnsupportedVersion(v)) => assert_eq!(v, STORE_VERSION + 1),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn uncommitted_changes_are_invisible() {
        let (_dir, mut store) = test_store();
        let bid = BlockId([0x02; 32]);
        {
            let mut tx = store.begin();
            tx.record_block(bid, block_record(VolumeId::random())).unwrap();
            // dropped without commit
        }
        assert!(store.block(&bid).is_none());
    }

    #[test]
    fn write_after_rollback_fails() {
        let (_dir, mut store) = test_store();
        let mut tx = store.begin();
        tx.record_block(BlockId([0x03; 32]), block_record(VolumeId::random()))
            .unwrap();
        tx.rollback();
        match tx.record_block(BlockId([0x04; 32]), block_record(VolumeId::random())) {
            Err(CaissonError::InvalidTransaction) => {}
            other => panic!("expected InvalidTransaction, got {other:?}"),
        }
        assert!(tx.commit().is_err());
    }

    #[test]
    fn transition_validation_in_transaction() {
        let (_dir, mut store) = test_store();
        let vid = VolumeId::random();
        let mut tx = store.begin();
        tx.record_volume(vid, volume_record(VolumeState::Pending)).unwrap();
        tx.transition_volume(&vid, VolumeState::Uploading).unwrap();
        tx.transition_volume(&vid, VolumeState::Verified).unwrap();
        // Verified -> Uploading is illegal.
        assert!(tx.transition_volume(&vid, VolumeState::Uploading).is_err());
        tx.commit().unwrap();
        assert_eq!(store.volume(&vid).unwrap().state, VolumeState::Verified);
    }

    #[test]
    fn resolve_fileset_by_time() {
        let (_dir, mut store) = test_store();
        let early = fileset_at(1_000, vec![]);
        let late = fileset_at(2_000, vec![]);
        let early_id = early.id;
        let late_id = late.id;

        let mut tx = store.begin();
        // Insert out of order; resolution must sort by time.
        tx.record_fileset(late).unwrap();
        tx.record_fileset(early).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.resolve_fileset(None).unwrap().id, late_id);
        let t = Utc.timestamp_opt(1_500, 0).unwrap();
        assert_eq!(store.resolve_fileset(Some(t)).unwrap().id, early_id);
        let exact = Utc.timestamp_opt(1_000, 0).unwrap();
        assert_eq!(store.resolve_fileset(Some(exact)).unwrap().id, early_id);

        let too_early = Utc.timestamp_opt(500, 0).unwrap();
        assert!(store.resolve_fileset(Some(too_early)).is_err());
    }

    #[test]
    fn resolve_fileset_empty_store_fails() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.resolve_fileset(None),
            Err(CaissonError::FilesetNotFound(_))
        ));
    }

    #[test]
    fn unreferenced_blocks_computed_from_filesets() {
        let (_dir, mut store) = test_store();
        let vid = VolumeId::random();
        let used = BlockId([0x0A; 32]);
        let orphan = BlockId([0x0B; 32]);

        let mut tx = store.begin();
        tx.record_block(used, block_record(vid)).unwrap();
        tx.record_block(orphan, block_record(vid)).unwrap();
        tx.record_fileset(fileset_at(1_000, vec![BlockRef { id: used, length: 100 }]))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(store.unreferenced_blocks(), vec![orphan]);
    }

    #[test]
    fn remove_fileset_frees_its_blocks() {
        let (_dir, mut store) = test_store();
        let vid = VolumeId::random();
        let bid = BlockId([0x0C; 32]);
        let fileset = fileset_at(1_000, vec![BlockRef { id: bid, length: 100 }]);
        let fid = fileset.id;

        let mut tx = store.begin();
        tx.record_block(bid, block_record(vid)).unwrap();
        tx.record_fileset(fileset).unwrap();
        tx.commit().unwrap();
        assert!(store.unreferenced_blocks().is_empty());

        let mut tx = store.begin();
        tx.remove_fileset(&fid).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.unreferenced_blocks(), vec![bid]);

        let mut tx = store.begin();
        assert!(matches!(
            tx.remove_fileset(&fid),
            Err(CaissonError::FilesetNotFound(_))
        ));
    }

    #[test]
    fn blocks_for_file_returns_ordered_refs() {
        let (_dir, mut store) = test_store();
        let b1 = BlockRef { id: BlockId([1; 32]), length: 10 };
        let b2 = BlockRef { id: BlockId([2; 32]), length: 20 };
        let fileset = fileset_at(1_000, vec![b1, b2]);
        let fid = fileset.id;

        let mut tx = store.begin();
        tx.record_fileset(fileset).unwrap();
        tx.commit().unwrap();

        let refs = store.blocks_for_file(&fid, "/data/file").unwrap();
        assert_eq!(refs, &[b1, b2]);
        assert!(store.blocks_for_file(&fid, "/nope").is_err());
    }
}
