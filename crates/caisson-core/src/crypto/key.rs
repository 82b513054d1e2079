use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CaissonError, Result};

/// The master key material. Never stored in plaintext on disk; zeroized on
/// drop so key bytes don't linger in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; 32],
    pub block_id_key: [u8; 32],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("MasterKey")
            .field("encryption_key", &"<redacted>")
            .field("block_id_key", &"<redacted>")
            .finish()
    }
}

/// Serialized payload inside the encrypted key blob. Zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MasterKeyPayload {
    encryption_key: Vec<u8>,
    block_id_key: Vec<u8>,
}

/// KDF parameters stored alongside the encrypted key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// On-disk format stored at `keys/repokey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

impl MasterKey {
    /// Generate a new random master key using OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        let mut block_id_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        rand::rngs::OsRng.fill_bytes(&mut block_id_key);
        Self {
            encryption_key,
            block_id_key,
        }
    }

    /// Encrypt the master key with a passphrase using Argon2id + AES-256-GCM.
    pub fn to_encrypted(&self, passphrase: &str) -> Result<EncryptedKey> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt,
        };
        let wrapping_key = derive_key_from_passphrase(passphrase, &kdf)?;

        let payload = MasterKeyPayload {
            encryption_key: self.encryption_key.to_vec(),
            block_id_key: self.block_id_key.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        // The KDF parameters are bound as AAD, so they cannot be swapped
        // underneath the key blob without detection.
        let kdf_aad = kdf_params_aad(&kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| CaissonError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &kdf_aad,
                },
            )
            .map_err(|e| CaissonError::KeyDerivation(format!("encrypt: {e}")))?;

        Ok(EncryptedKey {
            kdf,
            nonce: nonce_bytes.to_vec(),
            encrypted_payload: ciphertext,
        })
    }

    /// Decrypt the master key from its on-disk format.
    pub fn from_encrypted(encrypted: &EncryptedKey, passphrase: &str) -> Result<Self> {
        let wrapping_key = derive_key_from_passphrase(passphrase, &encrypted.kdf)?;

        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|_| CaissonError::DecryptionFailed)?;
        if encrypted.nonce.len() != 12 {
            return Err(CaissonError::DecryptionFailed);
        }
        let nonce = Nonce::from_slice(&encrypted.nonce);

        let kdf_aad = kdf_params_aad(&encrypted.kdf)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    nonce,
                    Payload {
                        msg: encrypted.encrypted_payload.as_ref(),
                        aad: &kdf_aad,
                    },
                )
                .map_err(|_| CaissonError::DecryptionFailed)?,
        );

        let payload: MasterKeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| CaissonError::DecryptionFailed)?;

        if payload.encryption_key.len() != 32 || payload.block_id_key.len() != 32 {
            return Err(CaissonError::DecryptionFailed);
        }
        let mut encryption_key = [0u8; 32];
        let mut block_id_key = [0u8; 32];
        encryption_key.copy_from_slice(&payload.encryption_key);
        block_id_key.copy_from_slice(&payload.block_id_key);

        Ok(Self {
            encryption_key,
            block_id_key,
        })
    }
}

/// Deterministic AAD bytes derived from the KDF parameters.
fn kdf_params_aad(kdf: &KdfParams) -> Result<Vec<u8>> {
    rmp_serde::to_vec(kdf)
        .map_err(|e| CaissonError::KeyDerivation(format!("serialize kdf aad: {e}")))
}

/// Derive a 32-byte key from a passphrase using Argon2id.
fn derive_key_from_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CaissonError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| CaissonError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Wrap a key manually with low-cost KDF params to keep tests fast.
    fn fast_kdf_roundtrip(passphrase: &str) -> (MasterKey, EncryptedKey) {
        let key = MasterKey::generate();
        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 1,
            memory_cost: 8,
            parallelism: 1,
            salt: vec![0x5A; 32],
        };
        let wrapping_key = derive_key_from_passphrase(passphrase, &kdf).unwrap();
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref()).unwrap();
        let payload = MasterKeyPayload {
            encryption_key: key.encryption_key.to_vec(),
            block_id_key: key.block_id_key.to_vec(),
        };
        let plaintext = rmp_serde::to_vec(&payload).unwrap();
        let aad = kdf_params_aad(&kdf).unwrap();
        let nonce_bytes = [7u8; 12];
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &aad,
                },
            )
            .unwrap();
        let encrypted = EncryptedKey {
            kdf,
            nonce: nonce_bytes.to_vec(),
            encrypted_payload: ciphertext,
        };
        (key, encrypted)
    }

    #[test]
    fn roundtrip_with_correct_passphrase() {
        let (key, encrypted) = fast_kdf_roundtrip("correct horse");
        let recovered = MasterKey::from_encrypted(&encrypted, "correct horse").unwrap();
        assert_eq!(recovered.encryption_key, key.encryption_key);
        assert_eq!(recovered.block_id_key, key.block_id_key);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let (_, encrypted) = fast_kdf_roundtrip("correct horse");
        match MasterKey::from_encrypted(&encrypted, "battery staple") {
            Err(CaissonError::DecryptionFailed) => {}
            other => panic!("expected DecryptionFailed, got {other:?}"),
        }
    }

    #[test]
    fn tampered_kdf_params_fail() {
        let (_, mut encrypted) = fast_kdf_roundtrip("correct horse");
        // Weakening the stored cost parameters must break the AAD binding.
        encrypted.kdf.time_cost = 1;
        encrypted.kdf.memory_cost = 9;
        assert!(MasterKey::from_encrypted(&encrypted, "correct horse").is_err());
    }

    #[test]
    fn generated_keys_are_distinct() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a.encryption_key, b.encryption_key);
        assert_ne!(a.block_id_key, b.block_id_key);
    }
}
