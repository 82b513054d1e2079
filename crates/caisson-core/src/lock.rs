//! Advisory repository lock held as an object on the storage backend.
//!
//! Acquisition is racy-but-safe: each contender writes a lock object with a
//! timestamp-prefixed key, then lists all lock objects. The oldest key wins;
//! everyone else deletes their own object and backs off. Lock objects older
//! than the staleness cutoff are treated as leftovers from crashed runs and
//! removed.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CaissonError, Result};
use crate::storage::StorageBackend;

const LOCK_PREFIX: &str = "locks/";
const STALE_AFTER_HOURS: i64 = 6;

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: DateTime<Utc>,
}

/// Proof of lock ownership; pass it back to [`release_lock`].
#[derive(Debug)]
pub struct LockGuard {
    key: String,
}

fn lock_key(now: DateTime<Utc>) -> String {
    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    format!(
        "{LOCK_PREFIX}{:020}-{}.json",
        now.timestamp_micros(),
        hex::encode(nonce)
    )
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into())
}

fn holder_description(storage: &dyn StorageBackend, key: &str) -> String {
    match storage.get(key) {
        Ok(Some(data)) => match serde_json::from_slice::<LockEntry>(&data) {
            Ok(entry) => format!("{} (pid {}, since {})", entry.hostname, entry.pid, entry.time),
            Err(_) => key.to_string(),
        },
        _ => key.to_string(),
    }
}

fn remove_stale_locks(storage: &dyn StorageBackend, now: DateTime<Utc>) -> Result<()> {
    let cutoff = now - Duration::hours(STALE_AFTER_HOURS);
    for key in storage.list(LOCK_PREFIX)? {
        let Some(Some(data)) = storage.get(&key).ok() else {
            continue;
        };
        if let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) {
            if entry.time < cutoff {
                tracing::warn!("removing stale lock {key} held by {}", entry.hostname);
                storage.delete(&key)?;
            }
        }
    }
    Ok(())
}

/// Acquire the repository lock or fail with [`CaissonError::Locked`].
pub fn acquire_lock(storage: &dyn StorageBackend) -> Result<LockGuard> {
    let now = Utc::now();
    remove_stale_locks(storage, now)?;

    // An already-granted lock always wins over new contenders; the
    // oldest-key tiebreak below only settles near-simultaneous races.
    if let Some(existing) = storage.list(LOCK_PREFIX)?.first() {
        return Err(CaissonError::Locked(holder_description(storage, existing)));
    }

    let key = lock_key(now);
    let entry = LockEntry {
        hostname: hostname(),
        pid: std::process::id(),
        time: now,
    };
    let data = serde_json::to_vec(&entry)
        .map_err(|e| CaissonError::Other(format!("lock serialization: {e}")))?;
    storage.put(&key, &data)?;

    let mut contenders = storage.list(LOCK_PREFIX)?;
    contenders.sort();
    match contenders.first() {
        Some(winner) if *winner == key => Ok(LockGuard { key }),
        Some(winner) => {
            let holder = holder_description(storage, winner);
            storage.delete(&key)?;
            Err(CaissonError::Locked(holder))
        }
        // Our own object vanished between put and list.
        None => Err(CaissonError::Locked("unknown".into())),
    }
}

pub fn release_lock(storage: &dyn StorageBackend, guard: LockGuard) -> Result<()> {
    storage.delete(&guard.key)
}

/// Delete all lock objects regardless of owner. For operator recovery after
/// a crashed run on another machine.
pub fn break_lock(storage: &dyn StorageBackend) -> Result<usize> {
    let keys = storage.list(LOCK_PREFIX)?;
    for key in &keys {
        storage.delete(key)?;
    }
    Ok(keys.len())
}

/// Run `f` under the repository lock, releasing it on both success and error.
pub fn with_lock<T>(
    storage: &dyn StorageBackend,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = acquire_lock(storage)?;
    let result = f();
    match release_lock(storage, guard) {
        Ok(()) => result,
        Err(release_err) => match result {
            // The operation's own error takes precedence.
            Err(op_err) => Err(op_err),
            Ok(_) => Err(release_err),
        },
    }
}
