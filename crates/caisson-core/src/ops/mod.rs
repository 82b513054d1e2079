pub mod backup;
pub mod compact;
pub mod delete;
pub mod restore;
pub mod verify;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{ChunkerConfig, EngineConfig};
use crate::crypto::{Aes256GcmEngine, CryptoEngine, EncryptedKey, MasterKey, PlaintextEngine};
use crate::error::{CaissonError, Result};
use crate::storage::{RetryingBackend, StorageBackend};
use crate::store::MetadataStore;

pub use backup::{BackupReport, BackupRequest};
pub use compact::{CompactRequest, CompactStats};
pub use delete::DeleteReport;
pub use restore::{RestoreReport, RestoreRequest};
pub use verify::{VerifyReport, VerifyRequest};

/// Remote key of the repository marker object.
pub const CONFIG_KEY: &str = "config";
/// Remote key of the passphrase-encrypted master key.
pub const REPOKEY_KEY: &str = "keys/repokey";
/// Repository format version.
pub const REPO_VERSION: u32 = 1;

/// Cap on per-file error messages carried in operation reports.
pub(crate) const MAX_REPORTED_ERRORS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    None,
    Aes256Gcm,
}

/// Plaintext repository marker stored at [`CONFIG_KEY`].
///
/// The chunker parameters live here so every client chunks identically;
/// changing them would break deduplication against existing blocks. In
/// plaintext mode the block id key is carried here as well.
#[derive(Debug, Serialize, Deserialize)]
struct RepoMarker {
    version: u32,
    repo_id: String,
    created_at: DateTime<Utc>,
    encryption: String,
    chunker: ChunkerConfig,
    block_id_key: Option<String>,
}

/// Cooperative cancellation flag checked at file and volume boundaries.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CaissonError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A handle to one repository: remote storage, crypto, and the local
/// metadata store.
pub struct Engine {
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) crypto: Arc<dyn CryptoEngine>,
    pub(crate) store: MetadataStore,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Initialize a fresh repository on the backend and create the local
    /// metadata store at `store_path`.
    pub fn init(
        backend: Box<dyn StorageBackend>,
        store_path: &Path,
        mode: EncryptionMode,
        passphrase: Option<&str>,
        config: EngineConfig,
    ) -> Result<Self> {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(RetryingBackend::new(backend, config.retry.clone()));

        if storage.exists(CONFIG_KEY)? {
            return Err(CaissonError::RepoAlreadyExists(CONFIG_KEY.into()));
        }

        let mut repo_id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut repo_id);

        let (crypto, encryption, block_id_key): (Arc<dyn CryptoEngine>, &str, Option<String>) =
            match mode {
                EncryptionMode::Aes256Gcm => {
                    let passphrase = passphrase.ok_or_else(|| {
                        CaissonError::Config("encrypted repository requires a passphrase".into())
                    })?;
                    let master = MasterKey::generate();
                    let encrypted = master.to_encrypted(passphrase)?;
                    storage.put(REPOKEY_KEY, &rmp_serde::to_vec(&encrypted)?)?;
                    let engine =
                        Aes256GcmEngine::new(&master.encryption_key, &master.block_id_key);
                    (Arc::new(engine), "aes256gcm", None)
                }
                EncryptionMode::None => {
                    let mut key = [0u8; 32];
                    rand::rngs::OsRng.fill_bytes(&mut key);
                    (
                        Arc::new(PlaintextEngine::new(&key)),
                        "none",
                        Some(hex::encode(key)),
                    )
                }
            };

        let marker = RepoMarker {
            version: REPO_VERSION,
            repo_id: hex::encode(repo_id),
            created_at: Utc::now(),
            encryption: encryption.to_string(),
            chunker: config.chunker,
            block_id_key,
        };
        storage.put(CONFIG_KEY, &rmp_serde::to_vec(&marker)?)?;

        let store = MetadataStore::create(store_path)?;
        tracing::info!("initialized repository {} ({encryption})", marker.repo_id);

        Ok(Self {
            storage,
            crypto,
            store,
            config,
        })
    }

    /// Open an existing repository. The marker's chunker parameters override
    /// whatever the caller configured, so chunk boundaries stay stable.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        store_path: &Path,
        passphrase: Option<&str>,
        mut config: EngineConfig,
    ) -> Result<Self> {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(RetryingBackend::new(backend, config.retry.clone()));

        let marker_bytes = storage
            .get(CONFIG_KEY)?
            .ok_or_else(|| CaissonError::RepoNotFound(CONFIG_KEY.into()))?;
        let marker: RepoMarker = rmp_serde::from_slice(&marker_bytes)?;
        if marker.version != REPO_VERSION {
            return Err(CaissonError::UnsupportedVersion(marker.version));
        }
        config.chunker = marker.chunker;

        let crypto: Arc<dyn CryptoEngine> = match marker.encryption.as_str() {
            "aes256gcm" => {
                let passphrase = passphrase.ok_or_else(|| {
                    CaissonError::Config("repository is encrypted; passphrase required".into())
                })?;
                let key_bytes = storage
                    .get(REPOKEY_KEY)?
                    .ok_or_else(|| CaissonError::RepoNotFound(REPOKEY_KEY.into()))?;
                let encrypted: EncryptedKey = rmp_serde::from_slice(&key_bytes)?;
                let master = MasterKey::from_encrypted(&encrypted, passphrase)?;
                Arc::new(Aes256GcmEngine::new(
                    &master.encryption_key,
                    &master.block_id_key,
                ))
            }
            "none" => {
                let key_hex = marker.block_id_key.as_deref().ok_or_else(|| {
                    CaissonError::InvalidFormat("marker is missing the block id key".into())
                })?;
                let key_vec = hex::decode(key_hex)
                    .map_err(|_| CaissonError::InvalidFormat("invalid block id key".into()))?;
                let key: [u8; 32] = key_vec
                    .try_into()
                    .map_err(|_| CaissonError::InvalidFormat("invalid block id key".into()))?;
                Arc::new(PlaintextEngine::new(&key))
            }
            other => {
                return Err(CaissonError::InvalidFormat(format!(
                    "unknown encryption mode: {other}"
                )))
            }
        };

        let store = MetadataStore::open(store_path)?;
        Ok(Self {
            storage,
            crypto,
            store,
            config,
        })
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backup(&mut self, request: BackupRequest) -> Result<BackupReport> {
        backup::run(self, request)
    }

    pub fn restore(&self, request: RestoreRequest) -> Result<RestoreReport> {
        restore::run(self, request)
    }

    pub fn compact(&mut self, request: CompactRequest) -> Result<CompactStats> {
        compact::run(self, request)
    }

    pub fn verify(&self, request: VerifyRequest) -> Result<VerifyReport> {
        verify::run(self, request)
    }

    pub fn delete_fileset(&mut self, id: &crate::store::FilesetId) -> Result<DeleteReport> {
        delete::run(self, id)
    }
}
