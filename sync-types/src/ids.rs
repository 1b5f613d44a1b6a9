//! Identity and ordering types for Tessel sync.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random id.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the hyphenated string form.
            pub fn parse(s: &str) -> Result<Self, SyncError> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| SyncError::InvalidId(s.to_string()))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifier of an entity. All triples sharing it form one entity.
    ///
    /// Ordered by UUID bytes, which matches the ordering of the lowercase
    /// hyphenated string form. Used as the final tie-break in query order.
    EntityId
);

uuid_id!(
    /// Identifier of an attribute in the schema dictionary.
    AttrId
);

uuid_id!(
    /// Client-generated identifier for a request (transaction, query, join).
    ///
    /// Server acks and errors echo it back so the client can correlate.
    ClientEventId
);

uuid_id!(
    /// Identifier of one connected session inside a room.
    PeerId
);

uuid_id!(
    /// Identifier assigned by the server to an authenticated session.
    SessionId
);

/// A server transaction id.
///
/// Monotonically increasing per app. Query results carry the highest tx id
/// they reflect, which lets the client drop stale or duplicate deltas.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(u64);

impl TxId {
    /// The zero tx id (nothing processed yet).
    pub const ZERO: TxId = TxId(0);

    /// Create a tx id from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

/// Stable hash of a query tree, used to dedup identical subscriptions.
///
/// SHA-256 over the canonical (key-sorted, whitespace-free) JSON encoding,
/// displayed as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Hash a query tree.
    pub fn of(query: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        write_canonical(query, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    /// Get the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryHash({})", &self.0[..self.0.len().min(12)])
    }
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
///
/// Does not rely on the map ordering serde_json was compiled with.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Scope of a room: `(room_type, room_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    /// Application-defined room type (e.g. `"document"`).
    pub room_type: String,
    /// Room id within the type.
    pub room_id: String,
}

impl RoomKey {
    /// Create a room key.
    pub fn new(room_type: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            room_type: room_type.into(),
            room_id: room_id.into(),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_type, self.room_id)
    }
}

/// Caller-chosen identifier of a byte stream multiplexed on the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
