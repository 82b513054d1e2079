pub mod local;
pub mod retry;

pub use local::LocalBackend;
pub use retry::RetryingBackend;

use crate::error::Result;

/// Flat key-value remote storage. Keys are `/`-separated paths; values are
/// opaque byte blobs. Implementations must be safe to call from multiple
/// threads (parallel uploads and restores).
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// List all keys under `prefix` (empty prefix lists everything).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read `length` bytes starting at `offset`. Returns `None` if the key
    /// does not exist; may return fewer bytes at end of object.
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        (**self).get_range(key, offset, length)
    }
}
