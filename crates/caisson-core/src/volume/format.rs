use crate::crypto::CryptoEngine;
use crate::error::{CaissonError, Result};

/// Domain-separation marker for object identity binding in AEAD AAD.
const OBJECT_CONTEXT_AAD_PREFIX: &[u8] = b"caisson:object-context:v1\0";

/// Object type tags for the encrypted envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    BlockData = 1,
    VolumeTrailer = 2,
    VolumeIndex = 3,
    FileList = 4,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::BlockData),
            2 => Ok(Self::VolumeTrailer),
            3 => Ok(Self::VolumeIndex),
            4 => Ok(Self::FileList),
            _ => Err(CaissonError::UnknownObjectType(v)),
        }
    }
}

/// AAD = type tag + domain marker + object context (block id, volume id, ...).
/// Binds each sealed object to both its type and its identity, so a valid
/// ciphertext cannot be replayed as a different object.
fn contextual_aad(tag: u8, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + OBJECT_CONTEXT_AAD_PREFIX.len() + context.len());
    aad.push(tag);
    aad.extend_from_slice(OBJECT_CONTEXT_AAD_PREFIX);
    aad.extend_from_slice(context);
    aad
}

/// Serialize a typed payload into a sealed object.
///
/// Wire format (encrypted): `[1-byte type_tag][12-byte nonce][ciphertext + 16-byte tag]`
/// Wire format (plaintext engine): `[1-byte type_tag][plaintext]`
pub fn seal_object(
    obj_type: ObjectType,
    context: &[u8],
    plaintext: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let tag = obj_type as u8;
    let aad = contextual_aad(tag, context);
    let encrypted = crypto.encrypt(plaintext, &aad)?;

    let mut out = Vec::with_capacity(1 + encrypted.len());
    out.push(tag);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Open a sealed object, returning `(object_type, plaintext)`.
pub fn open_object(
    data: &[u8],
    context: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<(ObjectType, Vec<u8>)> {
    if data.is_empty() {
        return Err(CaissonError::InvalidFormat("empty object".into()));
    }
    let tag = data[0];
    let obj_type = ObjectType::from_u8(tag)?;
    let aad = contextual_aad(tag, context);
    let plaintext = crypto.decrypt(&data[1..], &aad)?;
    Ok((obj_type, plaintext))
}

/// Open a sealed object, ensuring its type tag matches.
pub fn open_object_expect(
    data: &[u8],
    expected_type: ObjectType,
    context: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let (obj_type, plaintext) = open_object(data, context, crypto)?;
    if obj_type != expected_type {
        return Err(CaissonError::InvalidFormat(format!(
            "unexpected object type: expected {expected_type:?}, got {obj_type:?}"
        )));
    }
    Ok(plaintext)
}
