use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use super::CryptoEngine;
use crate::error::{CaissonError, Result};

/// AES-256-GCM authenticated encryption engine.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
    block_id_key: [u8; 32],
}

impl Aes256GcmEngine {
    pub fn new(encryption_key: &[u8; 32], block_id_key: &[u8; 32]) -> Self {
        let cipher =
            Aes256Gcm::new_from_slice(encryption_key).expect("valid 32-byte key for AES-256-GCM");
        Self {
            cipher,
            block_id_key: *block_id_key,
        }
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CaissonError::Other(format!("AES-GCM encrypt: {e}")))?;

        // Wire format: [12-byte nonce][ciphertext with appended 16-byte tag]
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(CaissonError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CaissonError::DecryptionFailed)
    }

    fn is_encrypting(&self) -> bool {
        true
    }

    fn block_id_key(&self) -> &[u8; 32] {
        &self.block_id_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> Aes256GcmEngine {
        Aes256GcmEngine::new(&[0x11; 32], &[0x22; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let engine = test_engine();
        let ciphertext = engine.encrypt(b"secret payload", b"aad").unwrap();
        assert_ne!(&ciphertext[12..], b"secret payload");
        let plaintext = engine.decrypt(&ciphertext, b"aad").unwrap();
        assert_eq!(plaintext, b"secret payload");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let engine = test_engine();
        let mut ciphertext = engine.encrypt(b"secret payload", b"aad").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        match engine.decrypt(&ciphertext, b"aad") {
            Err(CaissonError::DecryptionFailed) => {}
            other => panic!("expected DecryptionFailed, got {other:?}"),
        }
    }

    #[test]
    fn wrong_aad_fails() {
        let engine = test_engine();
        let ciphertext = engine.encrypt(b"secret payload", b"aad-one").unwrap();
        assert!(engine.decrypt(&ciphertext, b"aad-two").is_err());
    }

    #[test]
    fn truncated_input_fails() {
        let engine = test_engine();
        assert!(engine.decrypt(&[0u8; 10], b"").is_err());
    }

    #[test]
    fn nonces_are_unique_per_call() {
        let engine = test_engine();
        let c1 = engine.encrypt(b"same", b"").unwrap();
        let c2 = engine.encrypt(b"same", b"").unwrap();
        assert_ne!(&c1[..12], &c2[..12]);
    }
}
