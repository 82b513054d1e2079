use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{CaissonError, Result};
use crate::storage::StorageBackend;

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

fn is_retryable(err: &CaissonError) -> bool {
    match err {
        CaissonError::Io(e) => is_retryable_io(e),
        _ => false,
    }
}

/// Retry a closure on transient I/O errors with exponential backoff + jitter.
/// Integrity errors (failed decryption, bad format) are never retried.
pub fn retry_io<T>(config: &RetryConfig, op_name: &str, f: impl Fn() -> Result<T>) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable(&e) && attempt < config.max_retries => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}

/// Storage wrapper that retries transient I/O errors on every operation.
pub struct RetryingBackend {
    inner: Box<dyn StorageBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Box<dyn StorageBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

impl StorageBackend for RetryingBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        retry_io(&self.config, "get", || self.inner.get(key))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        retry_io(&self.config, "put", || self.inner.put(key, data))
    }

    fn delete(&self, key: &str) -> Result<()> {
        retry_io(&self.config, "delete", || self.inner.delete(key))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        retry_io(&self.config, "exists", || self.inner.exists(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        retry_io(&self.config, "list", || self.inner.list(prefix))
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        retry_io(&self.config, "get_range", || {
            self.inner.get_range(key, offset, length)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 5,
        }
    }

    #[test]
    fn retryable_io_error_classification() {
        let retryable = [
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::UnexpectedEof,
            std::io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted,
        ];
        for kind in retryable {
            assert!(is_retryable_io(&std::io::Error::new(kind, "x")));
        }
        let permanent = [
            std::io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidData,
        ];
        for kind in permanent {
            assert!(!is_retryable_io(&std::io::Error::new(kind, "x")));
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry_io(&fast_config(), "test", || {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CaissonError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "flaky",
                )))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_io(&fast_config(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CaissonError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "always down",
            )))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4); // initial + 3 retries
    }

    #[test]
    fn integrity_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_io(&fast_config(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CaissonError::DecryptionFailed)
        });
        assert!(matches!(result, Err(CaissonError::DecryptionFailed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
