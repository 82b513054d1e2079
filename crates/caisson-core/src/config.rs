use serde::{Deserialize, Serialize};

use crate::compress::Compression;

/// Content-defined chunking parameters. Every produced block length lies in
/// `[min_size, max_size]` (except the single zero-length block of empty input).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    #[serde(default = "default_avg_size")]
    pub avg_size: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            avg_size: default_avg_size(),
            max_size: default_max_size(),
        }
    }
}

fn default_min_size() -> u32 {
    128 * 1024
}

fn default_avg_size() -> u32 {
    1024 * 1024
}

fn default_max_size() -> u32 {
    8 * 1024 * 1024
}

/// Retry policy for transient storage I/O errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

/// Engine-wide tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub compression: Compression,
    /// Target size for block volumes before they are sealed and uploaded.
    #[serde(default = "default_volume_target_size")]
    pub volume_target_size: u32,
    /// Maximum number of in-flight volume uploads during backup.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            compression: Compression::default(),
            volume_target_size: default_volume_target_size(),
            upload_concurrency: default_upload_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_volume_target_size() -> u32 {
    50 * 1024 * 1024
}

fn default_upload_concurrency() -> usize {
    4
}
