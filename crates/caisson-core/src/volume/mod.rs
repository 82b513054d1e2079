pub mod format;
pub mod reader;
pub mod writer;

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CaissonError, Result};

/// Random 128-bit volume identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub [u8; 16]);

impl VolumeId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        VolumeId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| CaissonError::InvalidFormat(format!("invalid volume id: '{s}'")))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| CaissonError::InvalidFormat(format!("invalid volume id: '{s}'")))?;
        Ok(VolumeId(bytes))
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.to_hex())
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// What a remote volume holds.
///
/// `Index` volumes are companions to block volumes: they carry the same
/// hash-to-offset listing as the block volume's trailer, so readers can learn
/// a volume's contents without downloading block data. An index volume shares
/// its block volume's `VolumeId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    Block,
    Index,
    List,
}

impl VolumeKind {
    fn name_letter(self) -> char {
        match self {
            VolumeKind::Block => 'b',
            VolumeKind::Index => 'i',
            VolumeKind::List => 'l',
        }
    }

    fn extension(self) -> &'static str {
        match self {
            VolumeKind::Block => "dblock",
            VolumeKind::Index => "dindex",
            VolumeKind::List => "dlist",
        }
    }
}

/// Remote object name for a volume, e.g. `caisson-b<hex>.dblock`.
pub fn remote_name(kind: VolumeKind, id: &VolumeId) -> String {
    format!(
        "caisson-{}{}.{}",
        kind.name_letter(),
        id.to_hex(),
        kind.extension()
    )
}

/// Parse a remote object name back into `(kind, id)`.
/// Returns `None` for names that are not volumes (config, keys, locks).
pub fn parse_remote_name(name: &str) -> Option<(VolumeKind, VolumeId)> {
    let rest = name.strip_prefix("caisson-")?;
    let (body, ext) = rest.split_once('.')?;
    let mut chars = body.chars();
    let kind = match chars.next()? {
        'b' => VolumeKind::Block,
        'i' => VolumeKind::Index,
        'l' => VolumeKind::List,
        _ => return None,
    };
    if ext != kind.extension() {
        return None;
    }
    let id = VolumeId::from_hex(chars.as_str()).ok()?;
    Some((kind, id))
}

/// Lifecycle of a remote volume as tracked by the metadata store.
///
/// `Verified` is only reached after the remote write has returned success;
/// store rows that reference a volume's contents are committed strictly
/// after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Pending,
    Uploading,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    pub fn name(self) -> &'static str {
        match self {
            VolumeState::Pending => "Pending",
            VolumeState::Uploading => "Uploading",
            VolumeState::Verified => "Verified",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
        }
    }

    /// Validate and perform a state transition.
    pub fn transition(self, to: VolumeState) -> Result<VolumeState> {
        let ok = matches!(
            (self, to),
            (VolumeState::Pending, VolumeState::Uploading)
                | (VolumeState::Uploading, VolumeState::Verified)
                | (VolumeState::Verified, VolumeState::Deleting)
                | (VolumeState::Deleting, VolumeState::Deleted)
        );
        if ok {
            Ok(to)
        } else {
            Err(CaissonError::InvalidStateTransition {
                from: self.name(),
                to: to.name(),
            })
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
