use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use rayon::prelude::*;

use crate::block_id::BlockId;
use crate::chunker::chunk_stream;
use crate::error::{CaissonError, Result};
use crate::index::{Lookup, RunIndex};
use crate::lock::with_lock;
use crate::ops::{CancelToken, Engine, MAX_REPORTED_ERRORS};
use crate::storage::StorageBackend;
use crate::store::{
    BlockRef, FileEntry, FileKind, FilesetId, FilesetRecord, VolumeRecord,
};
use crate::volume::format::{seal_object, ObjectType};
use crate::volume::writer::{build_index_volume, seal_block, VolumeWriter};
use crate::volume::{remote_name, VolumeId, VolumeKind, VolumeState};

#[derive(Default)]
pub struct BackupRequest {
    pub sources: Vec<PathBuf>,
    /// Re-read and re-chunk every file, ignoring the mtime+size fast path.
    /// Catches silent source corruption at the cost of a full read.
    pub rechunk_all: bool,
    pub cancel: CancelToken,
}

#[derive(Debug, Default)]
pub struct BackupReport {
    pub fileset_id: Option<FilesetId>,
    pub files_processed: u64,
    pub files_unchanged: u64,
    pub files_failed: u64,
    pub bytes_scanned: u64,
    pub bytes_uploaded: u64,
    pub blocks_new: u64,
    pub blocks_reused: u64,
    pub volumes_uploaded: u64,
    /// Per-file soft errors, capped at [`MAX_REPORTED_ERRORS`].
    pub errors: Vec<String>,
}

impl BackupReport {
    fn record_error(&mut self, message: String) {
        tracing::warn!("{message}");
        self.files_failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }
}

struct ScannedEntry {
    path: PathBuf,
    kind: FileKind,
    size: u64,
    mtime_ns: i64,
    mode: u32,
    link_target: Option<String>,
}

/// A sealed volume making its way to the backend.
struct VolumeInFlight {
    volume_id: VolumeId,
    remote_name: String,
    size: u64,
    state: VolumeState,
    handle: Option<JoinHandle<Result<()>>>,
}

pub fn run(engine: &mut Engine, request: BackupRequest) -> Result<BackupReport> {
    let storage = engine.storage.clone();
    with_lock(storage.as_ref(), || backup_locked(engine, &request))
}

fn backup_locked(engine: &mut Engine, request: &BackupRequest) -> Result<BackupReport> {
    let mut in_flight: VecDeque<VolumeInFlight> = VecDeque::new();
    let result = backup_inner(engine, request, &mut in_flight);
    // Uploads must not outlive the repository lock, so on failure the
    // in-flight threads are joined before the lock is released.
    while let Some(mut volume) = in_flight.pop_front() {
        if let Some(handle) = volume.handle.take() {
            let _ = handle.join();
        }
    }
    result
}

fn backup_inner(
    engine: &mut Engine,
    request: &BackupRequest,
    in_flight: &mut VecDeque<VolumeInFlight>,
) -> Result<BackupReport> {
    let mut report = BackupReport::default();
    let scanned = scan_sources(&request.sources, &request.cancel, &mut report)?;
    tracing::info!("scanned {} entries", scanned.len());

    // Fast-path map from the most recent fileset: unchanged files reuse
    // their block list without being read.
    let previous: HashMap<String, FileEntry> = match engine.store.resolve_fileset(None) {
        Ok(fileset) => fileset
            .entries
            .iter()
            .filter(|e| e.kind == FileKind::File)
            .map(|e| (e.path.clone(), e.clone()))
            .collect(),
        Err(_) => HashMap::new(),
    };

    let mut index = RunIndex::new();
    let mut writer = VolumeWriter::new(engine.config.volume_target_size as usize);
    let mut finished: Vec<VolumeInFlight> = Vec::new();
    let mut entries: Vec<FileEntry> = Vec::with_capacity(scanned.len());

    for (stored_path, item) in &scanned {
        request.cancel.check()?;

        let (blocks, size) = match item.kind {
            FileKind::Directory | FileKind::Symlink => (Vec::new(), 0),
            FileKind::File => {
                if !request.rechunk_all {
                    if let Some(prev) = previous.get(stored_path) {
                        if prev.mtime_ns == item.mtime_ns && prev.size == item.size {
                            report.files_unchanged += 1;
                            report.blocks_reused += prev.blocks.len() as u64;
                            entries.push(FileEntry {
                                path: stored_path.clone(),
                                kind: FileKind::File,
                                size: prev.size,
                                mtime_ns: item.mtime_ns,
                                mode: item.mode,
                                blocks: prev.blocks.clone(),
                                link_target: None,
                            });
                            continue;
                        }
                    }
                }

                match pack_file_blocks(
                    engine,
                    &item.path,
                    &mut index,
                    &mut writer,
                    in_flight,
                    &mut finished,
                    &mut report,
                )? {
                    Some((refs, bytes_read)) => {
                        report.files_processed += 1;
                        report.bytes_scanned += bytes_read;
                        (refs, bytes_read)
                    }
                    // Soft error, already recorded.
                    None => continue,
                }
            }
        };

        entries.push(FileEntry {
            path: stored_path.clone(),
            kind: item.kind,
            size,
            mtime_ns: item.mtime_ns,
            mode: item.mode,
            blocks,
            link_target: item.link_target.clone(),
        });
    }

    request.cancel.check()?;

    // Flush the final partial volume and wait for every upload.
    if writer.has_pending() {
        flush_volume(engine, &mut writer, &mut index, in_flight, &mut finished, &mut report)?;
    }
    while let Some(volume) = in_flight.pop_front() {
        finished.push(join_upload(volume)?);
    }

    // Write the fileset manifest to the backend before committing anything
    // locally, so the remote side is self-describing on its own.
    let fileset = FilesetRecord {
        id: FilesetId::random(),
        time: Utc::now(),
        list_volume: VolumeId::random(),
        entries,
    };
    let list_name = remote_name(VolumeKind::List, &fileset.list_volume);
    let manifest = rmp_serde::to_vec(&fileset)?;
    let sealed_manifest = seal_object(
        ObjectType::FileList,
        &fileset.id.0,
        &manifest,
        engine.crypto.as_ref(),
    )?;
    let mut list_state = VolumeState::Pending.transition(VolumeState::Uploading)?;
    engine.storage.put(&list_name, &sealed_manifest)?;
    list_state = list_state.transition(VolumeState::Verified)?;
    report.bytes_uploaded += sealed_manifest.len() as u64;
    report.volumes_uploaded += 1;

    // Single commit covering volumes, blocks, and the fileset.
    let fileset_id = fileset.id;
    let list_volume = fileset.list_volume;
    let manifest_size = sealed_manifest.len() as u64;
    let mut tx = engine.store.begin();
    for volume in &finished {
        tx.record_volume(
            volume.volume_id,
            VolumeRecord {
                kind: VolumeKind::Block,
                remote_name: volume.remote_name.clone(),
                size: volume.size,
                created_at: Utc::now(),
                state: volume.state,
                has_index: true,
            },
        )?;
    }
    tx.record_volume(
        list_volume,
        VolumeRecord {
            kind: VolumeKind::List,
            remote_name: list_name,
            size: manifest_size,
            created_at: Utc::now(),
            state: list_state,
            has_index: false,
        },
    )?;
    for (id, record) in index.drain()? {
        tx.record_block(id, record)?;
    }
    tx.record_fileset(fileset)?;
    tx.commit()?;

    report.fileset_id = Some(fileset_id);
    tracing::info!(
        "backup complete: fileset {fileset_id}, {} new blocks, {} reused, {} volumes",
        report.blocks_new,
        report.blocks_reused,
        report.volumes_uploaded,
    );
    Ok(report)
}

/// Chunk one file's contents and pack every novel block into the writer,
/// sealing and uploading volumes as the target size is reached mid-file.
///
/// The file is read through the streaming chunker in batches of roughly one
/// volume, so memory stays bounded by the volume target regardless of file
/// size. Returns `None` after recording a soft error (open or read failure);
/// blocks already packed stay claimed and are committed unreferenced.
fn pack_file_blocks(
    engine: &Engine,
    path: &Path,
    index: &mut RunIndex,
    writer: &mut VolumeWriter,
    in_flight: &mut VecDeque<VolumeInFlight>,
    finished: &mut Vec<VolumeInFlight>,
    report: &mut BackupReport,
) -> Result<Option<(Vec<BlockRef>, u64)>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            report.record_error(format!("opening {}: {e}", path.display()));
            return Ok(None);
        }
    };

    let key = engine.crypto.block_id_key();
    let batch_target = engine.config.volume_target_size as usize;
    let mut chunks = chunk_stream(BufReader::new(file), &engine.config.chunker);
    let mut refs: Vec<BlockRef> = Vec::new();
    let mut bytes_read = 0u64;
    let mut batch: Vec<Vec<u8>> = Vec::new();
    let mut batch_bytes = 0usize;

    loop {
        let chunk = match chunks.next() {
            Some(Ok(data)) => Some(data),
            Some(Err(e)) => {
                report.record_error(format!("reading {}: {e}", path.display()));
                return Ok(None);
            }
            None => None,
        };
        let done = chunk.is_none();
        if let Some(data) = chunk {
            bytes_read += data.len() as u64;
            batch_bytes += data.len();
            batch.push(data);
        }

        if done || batch_bytes >= batch_target {
            let ids: Vec<BlockId> = batch.par_iter().map(|d| BlockId::compute(key, d)).collect();
            for (data, id) in batch.drain(..).zip(ids) {
                let length = data.len() as u32;
                match index.lookup(&engine.store, &id) {
                    Lookup::Known(_) | Lookup::Pending => {
                        report.blocks_reused += 1;
                    }
                    Lookup::Unknown => {
                        index.note_pending(id, length);
                        let sealed = seal_block(
                            &data,
                            engine.config.compression,
                            &id,
                            engine.crypto.as_ref(),
                        )?;
                        writer.add_block(id, sealed, length);
                        report.blocks_new += 1;
                    }
                }
                refs.push(BlockRef { id, length });
                if writer.should_flush() {
                    flush_volume(engine, writer, index, in_flight, finished, report)?;
                }
            }
            batch_bytes = 0;
        }
        if done {
            break;
        }
    }
    Ok(Some((refs, bytes_read)))
}

/// Seal the buffered volume and start uploading it (block volume plus its
/// companion index volume) on a worker thread, bounded by the configured
/// upload concurrency.
fn flush_volume(
    engine: &Engine,
    writer: &mut VolumeWriter,
    index: &mut RunIndex,
    in_flight: &mut VecDeque<VolumeInFlight>,
    finished: &mut Vec<VolumeInFlight>,
    report: &mut BackupReport,
) -> Result<()> {
    let sealed = writer.seal(engine.crypto.as_ref())?;
    index.note_sealed(sealed.volume_id, &sealed.entries);

    let block_name = remote_name(VolumeKind::Block, &sealed.volume_id);
    let index_name = remote_name(VolumeKind::Index, &sealed.volume_id);
    let index_bytes =
        build_index_volume(&sealed.volume_id, &sealed.entries, engine.crypto.as_ref())?;

    report.bytes_uploaded += (sealed.bytes.len() + index_bytes.len()) as u64;
    report.volumes_uploaded += 1;

    let state = VolumeState::Pending.transition(VolumeState::Uploading)?;
    let storage: Arc<dyn StorageBackend> = engine.storage.clone();
    let size = sealed.bytes.len() as u64;
    let upload_block_name = block_name.clone();
    let handle = std::thread::spawn(move || -> Result<()> {
        storage.put(&upload_block_name, &sealed.bytes)?;
        storage.put(&index_name, &index_bytes)?;
        Ok(())
    });

    in_flight.push_back(VolumeInFlight {
        volume_id: sealed.volume_id,
        remote_name: block_name,
        size,
        state,
        handle: Some(handle),
    });

    while in_flight.len() >= engine.config.upload_concurrency.max(1) {
        let volume = in_flight.pop_front().unwrap();
        finished.push(join_upload(volume)?);
    }
    Ok(())
}

fn join_upload(mut volume: VolumeInFlight) -> Result<VolumeInFlight> {
    let handle = volume.handle.take().ok_or_else(|| {
        CaissonError::Consistency(format!("upload of {} already joined", volume.remote_name))
    })?;
    handle
        .join()
        .map_err(|_| CaissonError::Other(format!("upload thread for {} panicked", volume.remote_name)))??;
    volume.state = volume.state.transition(VolumeState::Verified)?;
    Ok(volume)
}

/// Walk all sources into one sorted path → entry map. Unreadable entries
/// become soft errors; a source that is a plain file is backed up as-is.
fn scan_sources(
    sources: &[PathBuf],
    cancel: &CancelToken,
    report: &mut BackupReport,
) -> Result<BTreeMap<String, ScannedEntry>> {
    let mut scanned = BTreeMap::new();
    for source in sources {
        let walker = ignore::WalkBuilder::new(source)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();
        for entry in walker {
            cancel.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.record_error(format!("scanning {}: {e}", source.display()));
                    continue;
                }
            };
            let path = entry.into_path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    report.record_error(format!("stat {}: {e}", path.display()));
                    continue;
                }
            };

            let kind = if meta.file_type().is_symlink() {
                FileKind::Symlink
            } else if meta.is_dir() {
                FileKind::Directory
            } else if meta.is_file() {
                FileKind::File
            } else {
                // Sockets, fifos, devices.
                continue;
            };

            let link_target = if kind == FileKind::Symlink {
                match fs::read_link(&path) {
                    Ok(target) => Some(target.to_string_lossy().into_owned()),
                    Err(e) => {
                        report.record_error(format!("readlink {}: {e}", path.display()));
                        continue;
                    }
                }
            } else {
                None
            };

            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            let mtime_ns = mtime.unix_seconds() * 1_000_000_000 + mtime.nanoseconds() as i64;

            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode()
            };
            #[cfg(not(unix))]
            let mode = 0;

            let stored_path = path.to_string_lossy().into_owned();
            scanned.insert(
                stored_path,
                ScannedEntry {
                    path,
                    kind,
                    size: if kind == FileKind::File { meta.len() } else { 0 },
                    mtime_ns,
                    mode,
                    link_target,
                },
            );
        }
    }
    Ok(scanned)
}
