use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};
use std::fmt;

type KeyedBlake2b256 = Blake2bMac<U32>;

/// A 32-byte block identifier computed as keyed BLAKE2b-256 over the
/// plaintext block contents.
///
/// The key comes from the repository master key, so an attacker who can
/// observe remote objects cannot confirm whether a known plaintext is
/// present in the repository.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    /// Compute a block ID using keyed BLAKE2b-256 (BLAKE2b-MAC, 32-byte output).
    pub fn compute(key: &[u8; 32], data: &[u8]) -> Self {
        let mut hasher =
            KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b");
        Mac::update(&mut hasher, data);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result.into_bytes());
        BlockId(out)
    }

    /// Hex-encode the full block ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
