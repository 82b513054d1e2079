use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::block_id::BlockId;
use crate::error::{CaissonError, Result};
use crate::ops::{CancelToken, Engine, MAX_REPORTED_ERRORS};
use crate::store::{FileEntry, FileKind};
use crate::volume::reader::read_block;
use crate::volume::VolumeId;

#[derive(Default)]
pub struct RestoreRequest {
    pub destination: PathBuf,
    /// Paths to restore. Empty means everything. A path selects itself and,
    /// for directories, its whole subtree.
    pub paths: Vec<String>,
    /// Restore point; `None` means the most recent fileset.
    pub at: Option<DateTime<Utc>>,
    pub cancel: CancelToken,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub files_restored: u64,
    pub files_failed: u64,
    pub bytes_written: u64,
    pub errors: Vec<String>,
}

impl RestoreReport {
    fn record_error(&mut self, message: String) {
        tracing::warn!("{message}");
        self.files_failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }
}

/// Where one block's plaintext lands: which output file, at what offset.
type BlockTargets = SmallVec<[(usize, u64); 1]>;

struct FileToRestore {
    entry: FileEntry,
    out_path: PathBuf,
    handle: Option<fs::File>,
}

pub fn run(engine: &Engine, request: RestoreRequest) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();
    let fileset = engine.store.resolve_fileset(request.at)?;
    let selected: Vec<&FileEntry> = fileset
        .entries
        .iter()
        .filter(|e| is_selected(&e.path, &request.paths))
        .collect();
    tracing::info!(
        "restoring {} entries from fileset {} to {}",
        selected.len(),
        fileset.id,
        request.destination.display()
    );

    // Directories first, so files and links have somewhere to land.
    for entry in selected.iter().filter(|e| e.kind == FileKind::Directory) {
        let out = request.destination.join(sanitize(&entry.path));
        if let Err(e) = fs::create_dir_all(&out) {
            report.record_error(format!("creating {}: {e}", out.display()));
        }
    }

    for entry in selected.iter().filter(|e| e.kind == FileKind::Symlink) {
        request.cancel.check()?;
        let out = request.destination.join(sanitize(&entry.path));
        match restore_symlink(entry, &out) {
            Ok(()) => report.files_restored += 1,
            Err(e) => report.record_error(format!("linking {}: {e}", out.display())),
        }
    }

    // Pre-create every output file at its final size, then fill content
    // volume by volume so each remote volume is downloaded once.
    let mut files: Vec<FileToRestore> = Vec::new();
    for entry in selected.into_iter().filter(|e| e.kind == FileKind::File) {
        let out = request.destination.join(sanitize(&entry.path));
        if let Some(parent) = out.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                report.record_error(format!("creating {}: {e}", parent.display()));
                continue;
            }
        }
        let handle = match fs::File::create(&out).and_then(|f| {
            f.set_len(entry.size)?;
            Ok(f)
        }) {
            Ok(f) => f,
            Err(e) => {
                report.record_error(format!("creating {}: {e}", out.display()));
                continue;
            }
        };
        files.push(FileToRestore {
            entry: entry.clone(),
            out_path: out,
            handle: Some(handle),
        });
    }

    let failed = fill_file_contents(engine, &request.cancel, &files)?;

    for (idx, file) in files.iter_mut().enumerate() {
        file.handle.take();
        if let Some(reason) = failed.get(&idx) {
            report.record_error(format!(
                "restoring {}: {reason}",
                file.out_path.display()
            ));
            let _ = fs::remove_file(&file.out_path);
            continue;
        }
        apply_metadata(&file.entry, &file.out_path, &mut report);
        report.files_restored += 1;
        report.bytes_written += file.entry.size;
    }

    Ok(report)
}

fn is_selected(path: &str, wanted: &[String]) -> bool {
    if wanted.is_empty() {
        return true;
    }
    wanted.iter().any(|w| {
        let w = w.trim_end_matches('/');
        path == w || path.strip_prefix(w).is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Strip root, drive prefix, and parent traversal so a stored path can never
/// escape the restore destination.
fn sanitize(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn restore_symlink(entry: &FileEntry, out: &Path) -> std::io::Result<()> {
    let target = entry.link_target.as_deref().unwrap_or("");
    match fs::symlink_metadata(out) {
        Ok(_) => fs::remove_file(out)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, out)
    }
    #[cfg(not(unix))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("symlinks not supported on this platform ({target})"),
        ))
    }
}

/// Download each needed volume once and scatter its blocks into every file
/// position referencing them. Volumes are fetched in parallel; a failed
/// volume fails only the files that depend on it.
fn fill_file_contents(
    engine: &Engine,
    cancel: &CancelToken,
    files: &[FileToRestore],
) -> Result<HashMap<usize, String>> {
    let mut targets: HashMap<BlockId, BlockTargets> = HashMap::new();
    let mut by_volume: HashMap<VolumeId, Vec<BlockId>> = HashMap::new();
    let failed: Mutex<HashMap<usize, String>> = Mutex::new(HashMap::new());

    for (idx, file) in files.iter().enumerate() {
        let mut offset = 0u64;
        let mut resolved = true;
        for block in &file.entry.blocks {
            match engine.store.block(&block.id) {
                Some(record) => {
                    by_volume.entry(record.volume_id).or_default().push(block.id);
                    targets.entry(block.id).or_default().push((idx, offset));
                }
                None => {
                    failed
                        .lock()
                        .unwrap()
                        .insert(idx, format!("block {} not in index", block.id));
                    resolved = false;
                    break;
                }
            }
            offset += block.length as u64;
        }
        if !resolved {
            continue;
        }
    }

    by_volume
        .par_iter()
        .try_for_each(|(volume_id, block_ids)| -> Result<()> {
            cancel.check()?;
            let result = restore_volume(engine, volume_id, block_ids, &targets, files);
            if let Err(e) = result {
                // Only the dependent files fail; the volume error itself is
                // not fatal to the whole restore.
                let mut failed = failed.lock().unwrap();
                for id in block_ids {
                    if let Some(spots) = targets.get(id) {
                        for &(idx, _) in spots {
                            failed.entry(idx).or_insert_with(|| e.to_string());
                        }
                    }
                }
            }
            Ok(())
        })?;

    Ok(failed.into_inner().unwrap())
}

fn restore_volume(
    engine: &Engine,
    volume_id: &VolumeId,
    block_ids: &[BlockId],
    targets: &HashMap<BlockId, BlockTargets>,
    files: &[FileToRestore],
) -> Result<()> {
    let volume = engine
        .store
        .volume(volume_id)
        .ok_or_else(|| CaissonError::Consistency(format!("unknown volume: {volume_id}")))?;

    for id in block_ids {
        let record = engine
            .store
            .block(id)
            .ok_or(CaissonError::BlockNotInIndex(*id))?;
        let plaintext = read_block(
            engine.storage.as_ref(),
            engine.crypto.as_ref(),
            &volume.remote_name,
            record.offset,
            record.stored_size,
            id,
        )?;
        if let Some(spots) = targets.get(id) {
            for &(idx, offset) in spots {
                let Some(handle) = files[idx].handle.as_ref() else {
                    continue;
                };
                write_at(handle, &plaintext, offset)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &fs::File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_at(file: &fs::File, data: &[u8], offset: u64) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

fn apply_metadata(entry: &FileEntry, out: &Path, report: &mut RestoreReport) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if entry.mode != 0 {
            if let Err(e) = fs::set_permissions(out, fs::Permissions::from_mode(entry.mode)) {
                report.record_error(format!("chmod {}: {e}", out.display()));
                return;
            }
        }
    }
    let mtime = filetime::FileTime::from_unix_time(
        entry.mtime_ns.div_euclid(1_000_000_000),
        entry.mtime_ns.rem_euclid(1_000_000_000) as u32,
    );
    if let Err(e) = filetime::set_file_mtime(out, mtime) {
        tracing::debug!("setting mtime on {}: {e}", out.display());
    }
    let _ = report;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_escapes() {
        assert_eq!(sanitize("/etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize("../../up"), PathBuf::from("up"));
        assert_eq!(sanitize("a/../b"), PathBuf::from("a/b"));
        assert_eq!(sanitize("plain/rel"), PathBuf::from("plain/rel"));
    }

    #[test]
    fn selection_matches_exact_and_subtree() {
        let wanted = vec!["/data/sub".to_string()];
        assert!(is_selected("/data/sub", &wanted));
        assert!(is_selected("/data/sub/file.txt", &wanted));
        assert!(!is_selected("/data/subother", &wanted));
        assert!(!is_selected("/data", &wanted));
        assert!(is_selected("/anything", &[]));
    }

    #[test]
    fn selection_ignores_trailing_slash() {
        let wanted = vec!["/data/sub/".to_string()];
        assert!(is_selected("/data/sub", &wanted));
        assert!(is_selected("/data/sub/file.txt", &wanted));
    }
}
