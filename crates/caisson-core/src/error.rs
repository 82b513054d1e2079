use thiserror::Error;

use crate::block_id::BlockId;

pub type Result<T> = std::result::Result<T, CaissonError>;

#[derive(Debug, Error)]
pub enum CaissonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("block id mismatch: expected {expected}, recomputed {actual}")]
    BlockIdMismatch { expected: BlockId, actual: BlockId },

    #[error("block not found in index: {0}")]
    BlockNotInIndex(BlockId),

    #[error("fileset not found: {0}")]
    FilesetNotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository is locked by another process (lock: {0})")]
    Locked(String),

    #[error("store/remote mismatch: {0}")]
    Consistency(String),

    #[error("transaction is no longer active")]
    InvalidTransaction,

    #[error("invalid volume state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}
