pub mod aes_gcm;
pub mod key;

use crate::error::Result;

pub use aes_gcm::Aes256GcmEngine;
pub use key::{EncryptedKey, KdfParams, MasterKey};

/// Trait for encrypting and decrypting repository objects.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[12-byte nonce][ciphertext + 16-byte tag]`.
    /// `aad` is authenticated but not encrypted (type tag + object context).
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    /// `aad` must match what was passed during encryption.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    /// `PlaintextEngine` returns false; real ciphers return true.
    fn is_encrypting(&self) -> bool;

    /// The key used for computing block IDs (keyed BLAKE2b-256).
    fn block_id_key(&self) -> &[u8; 32];
}

/// No-encryption engine. Still computes deterministic block IDs.
pub struct PlaintextEngine {
    block_id_key: [u8; 32],
}

impl PlaintextEngine {
    pub fn new(block_id_key: &[u8; 32]) -> Self {
        Self {
            block_id_key: *block_id_key,
        }
    }
}

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn block_id_key(&self) -> &[u8; 32] {
        &self.block_id_key
    }
}
