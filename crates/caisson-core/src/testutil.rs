//! In-memory storage backends for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CaissonError, Result};
use crate::storage::StorageBackend;

/// In-memory key-value backend.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().unwrap();
        let Some(data) = objects.get(key) else {
            return Ok(None);
        };
        let start = (offset as usize).min(data.len());
        let end = (start + length as usize).min(data.len());
        Ok(Some(data[start..end].to_vec()))
    }
}

/// Backend wrapper that records every `put` and `delete` key, for asserting
/// on upload behavior (e.g. that a dedup run writes no new block volumes).
pub struct RecordingBackend<B> {
    inner: B,
    puts: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl<B: StorageBackend> RecordingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            puts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.puts.lock().unwrap().clear();
        self.deletes.lock().unwrap().clear();
    }
}

impl<B: StorageBackend> StorageBackend for RecordingBackend<B> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.puts.lock().unwrap().push(key.to_string());
        self.inner.put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
}

/// Backend wrapper that fails `put` calls whose key contains a configured
/// substring. Used to exercise commit atomicity under upload failures.
pub struct FailingBackend<B> {
    inner: B,
    fail_puts_containing: Mutex<Option<String>>,
}

impl<B: StorageBackend> FailingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            fail_puts_containing: Mutex::new(None),
        }
    }

    pub fn fail_puts_containing(&self, needle: &str) {
        *self.fail_puts_containing.lock().unwrap() = Some(needle.to_string());
    }

    pub fn stop_failing(&self) {
        *self.fail_puts_containing.lock().unwrap() = None;
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: StorageBackend> StorageBackend for FailingBackend<B> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if let Some(needle) = self.fail_puts_containing.lock().unwrap().as_deref() {
            if key.contains(needle) {
                return Err(CaissonError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    format!("injected failure for {key}"),
                )));
            }
        }
        self.inner.put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
}
