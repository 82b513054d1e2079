//! Deduplicating, encrypted backup engine.
//!
//! Files are split into content-defined blocks, identified by a keyed
//! BLAKE2b-256 hash, compressed, encrypted, and packed into fixed-target-size
//! volumes on a flat key-value storage backend. A local transactional
//! metadata store maps blocks to volumes and snapshots to blocks; every
//! backup also uploads a self-describing manifest so the remote side stands
//! on its own.

pub mod block_id;
pub mod chunker;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod lock;
pub mod ops;
pub mod storage;
pub mod store;
pub mod testutil;
pub mod volume;

pub use config::EngineConfig;
pub use error::{CaissonError, Result};
pub use ops::{CancelToken, EncryptionMode, Engine};
