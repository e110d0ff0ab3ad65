//! Shared types used across the netcache crates: slot/peer identifiers, the
//! blob key representation and its slot-routing rule, the last-writer-wins
//! timestamp triple, and the crate-wide error taxonomy.
//!
//! Kept dependency-light on purpose (see `pbs-api-types` for the pattern this
//! follows) so that every other netcache crate can depend on it without
//! pulling in I/O or concurrency primitives.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer slot identifier in `[1, MaxSlot]`. Slot `0` is never assigned to a key,
/// it is only used as a sentinel in a few places (e.g. "no slot yet").
pub type SlotId = u32;

/// Opaque identifier of a cluster peer, taken verbatim from configuration
/// (typically `host:port`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// First byte of a node-generated key's routing representation (§3, §6).
pub const NODE_GENERATED_KEY_MARKER: u8 = 0x01;

/// A blob key: either node-generated (marked by [`NODE_GENERATED_KEY_MARKER`]
/// as its first byte) or an unstructured client-supplied byte string.
///
/// The key is compared and ordered as raw bytes, matching the Key Index's
/// custom byte comparator (§4.2).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobKey(Vec<u8>);

impl BlobKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BlobKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_node_generated(&self) -> bool {
        self.0.first() == Some(&NODE_GENERATED_KEY_MARKER)
    }

    /// Build a node-generated key string `<ver>_<blob-id>_<host>_<port>_<time>_<random>`
    /// and tag it with the routing marker byte.
    pub fn new_node_generated(
        version: u32,
        blob_id: u64,
        host: &str,
        port: u16,
        time_usec: i64,
        random: u32,
    ) -> Self {
        let text = format!("{version}_{blob_id}_{host}_{port}_{time_usec}_{random}");
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.push(NODE_GENERATED_KEY_MARKER);
        buf.extend_from_slice(text.as_bytes());
        BlobKey(buf)
    }

    /// The `random` field of a node-generated key, used for slot routing.
    /// Returns `None` for client-supplied keys or malformed node-generated ones.
    pub fn node_random_field(&self) -> Option<u32> {
        if !self.is_node_generated() {
            return None;
        }
        let text = std::str::from_utf8(&self.0[1..]).ok()?;
        text.rsplit('_').next()?.parse::<u32>().ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_node_generated() {
            write!(
                f,
                "BlobKey(node:{})",
                String::from_utf8_lossy(&self.0[1..])
            )
        } else {
            write!(f, "BlobKey(client:{})", hex::encode(&self.0))
        }
    }
}

/// Deterministic `key -> slot` mapping, identical on every node (§3).
///
/// Node-generated keys route by the `random` field chosen at creation time
/// to already land in the creating node's slot range; everything else
/// routes by CRC32 of the whole key.
pub fn slot_for_key(key: &BlobKey, max_slot: SlotId) -> SlotId {
    assert!(max_slot > 0, "max_slot must be positive");
    let hashed = match key.node_random_field() {
        Some(random) => random,
        None => crc32fast::hash(key.as_bytes()),
    };
    (hashed % max_slot) + 1
}

/// Who's asking and why a [`BlobKey`] is being accessed (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// A plain client read; may share an in-flight version with other readers.
    Read,
    /// A new client-initiated write.
    Create,
    /// A write applied on behalf of a mirror/sync event from a peer.
    CopyCreate,
    /// Deletion driven by the GC/expiry walker.
    GcDelete,
}

/// On-disk record kinds (§3). `None` is padding, never addressed by a live coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    None = 0,
    Meta = 1,
    ChunkMap = 2,
    ChunkData = 3,
}

impl RecordKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecordKind::None),
            1 => Some(RecordKind::Meta),
            2 => Some(RecordKind::ChunkMap),
            3 => Some(RecordKind::ChunkData),
            _ => None,
        }
    }
}

/// Sync-log operation kind (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOp {
    Write,
    Prolong,
    Remove,
}

/// Last-writer-wins tie-breaker, kept as the verbatim triple for cross-node
/// interop rather than hashed into a single value (§9 design notes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LwwStamp {
    pub create_time: i64,
    pub create_server: u32,
    pub create_id: u64,
}

impl LwwStamp {
    pub fn new(create_time: i64, create_server: u32, create_id: u64) -> Self {
        LwwStamp {
            create_time,
            create_server,
            create_id,
        }
    }
}

/// Crate-wide error taxonomy (§7), following the `thiserror` enum idiom this
/// codebase already uses for tape I/O errors.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("no such key")]
    NotFound,

    #[error("password mismatch or disallowed admin access")]
    AuthError,

    #[error("server error: {0}")]
    ServerError(String),

    #[error("malformed request: {0}")]
    ProtocolError(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("corrupt storage: {0}")]
    CorruptStorage(String),

    #[error("unexpected record kind at {0}")]
    WrongRecordKind(String),

    #[error("reconfiguration rejected: {0}")]
    ReconfigRejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether this error must abort the process rather than be reported to
    /// a caller (§7 propagation policy).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::CorruptStorage(_) | StorageError::WrongRecordKind(_)
        )
    }

    /// Render as the single-line `ERR:<message>` the client protocol expects.
    pub fn client_line(&self) -> String {
        let code = match self {
            StorageError::NotFound => "eNotFound",
            StorageError::AuthError => "eAuthError",
            StorageError::ServerError(_) => "eServerError",
            StorageError::ProtocolError(_) => "eProtocolError",
            StorageError::Timeout(_) => "eTimeout",
            StorageError::CorruptStorage(_) => "eCorruptStorage",
            StorageError::WrongRecordKind(_) => "eWrongRecordKind",
            StorageError::ReconfigRejected(_) => "eReconfigRejected",
            StorageError::Io(_) => "eServerError",
            StorageError::Other(_) => "eServerError",
        };
        format!("ERR:{code}: {self}")
    }
}

/// Process exit codes (§6).
pub mod exit_code {
    pub const NORMAL: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const STORAGE_UNRECOVERABLE: i32 = 2;
    pub const PORT_BIND_FAILURE: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_generated_key_routes_by_random_field() {
        let key = BlobKey::new_node_generated(1, 42, "node-a", 9000, 1_700_000_000_000_000, 77);
        assert!(key.is_node_generated());
        assert_eq!(key.node_random_field(), Some(77));
        assert_eq!(slot_for_key(&key, 100), 78);
    }

    #[test]
    fn client_key_routes_by_crc32() {
        let key = BlobKey::from_bytes(b"mycache\0primary\0sub".to_vec());
        assert!(!key.is_node_generated());
        let expected = (crc32fast::hash(key.as_bytes()) % 50) + 1;
        assert_eq!(slot_for_key(&key, 50), expected);
    }

    #[test]
    fn slot_is_deterministic() {
        let key = BlobKey::from_bytes(b"same-key".to_vec());
        assert_eq!(slot_for_key(&key, 37), slot_for_key(&key, 37));
    }
}
