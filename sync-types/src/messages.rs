//! Protocol frames for Tessel sync.
//!
//! Every frame is a JSON object tagged by `op`. One connection carries all
//! of them: handshake, query deltas, transaction acks, room traffic,
//! heartbeats and byte streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    Attribute, ClientEventId, PeerId, QueryHash, RoomKey, SessionId, StreamId, SyncError, Triple,
    TxId, TxStep,
};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// All possible protocol frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Frame {
    /// Client handshake
    Init(Init),
    /// Server response to Init
    InitOk(InitOk),
    /// Subscribe to a query
    AddQuery(AddQuery),
    /// Initial result of a query
    AddQueryOk(AddQueryOk),
    /// Unsubscribe from a query
    RemoveQuery(RemoveQuery),
    /// Server-initiated query invalidation with fresh results
    RefreshOk(RefreshOk),
    /// Submit a transaction
    Transact(Transact),
    /// Transaction confirmed
    TransactOk(TransactOk),
    /// Request failed
    Error(ErrorFrame),
    /// Join a room
    JoinRoom(JoinRoom),
    /// Room join confirmed
    JoinRoomOk(RoomRef),
    /// Leave a room
    LeaveRoom(RoomRef),
    /// Publish own presence
    SetPresence(SetPresence),
    /// Authoritative presence map of a room
    RefreshPresence(RefreshPresence),
    /// Publish a topic message
    ClientBroadcast(ClientBroadcast),
    /// Topic message from another peer
    ServerBroadcast(ServerBroadcast),
    /// Heartbeat request
    Ping(Heartbeat),
    /// Heartbeat response
    Pong(Heartbeat),
    /// Open a byte stream
    StreamOpen(StreamOpen),
    /// Chunk of a byte stream
    StreamData(StreamData),
    /// Flow-control acknowledgement for a byte stream
    StreamAck(StreamAck),
    /// Abort a byte stream
    StreamAbort(StreamAbort),
}

impl Frame {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// The wire `op` name of this frame.
    pub fn op(&self) -> &'static str {
        match self {
            Frame::Init(_) => "init",
            Frame::InitOk(_) => "init-ok",
            Frame::AddQuery(_) => "add-query",
            Frame::AddQueryOk(_) => "add-query-ok",
            Frame::RemoveQuery(_) => "remove-query",
            Frame::RefreshOk(_) => "refresh-ok",
            Frame::Transact(_) => "transact",
            Frame::TransactOk(_) => "transact-ok",
            Frame::Error(_) => "error",
            Frame::JoinRoom(_) => "join-room",
            Frame::JoinRoomOk(_) => "join-room-ok",
            Frame::LeaveRoom(_) => "leave-room",
            Frame::SetPresence(_) => "set-presence",
            Frame::RefreshPresence(_) => "refresh-presence",
            Frame::ClientBroadcast(_) => "client-broadcast",
            Frame::ServerBroadcast(_) => "server-broadcast",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::StreamOpen(_) => "stream-open",
            Frame::StreamData(_) => "stream-data",
            Frame::StreamAck(_) => "stream-ack",
            Frame::StreamAbort(_) => "stream-abort",
        }
    }
}

/// Client handshake sent right after the transport connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Init {
    /// Protocol version (currently 1)
    pub protocol_version: u8,
    /// Application id
    pub app_id: String,
    /// Refresh token of the signed-in user, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Human-readable device name
    pub device_name: String,
    /// Hash of the last known schema, so the server can skip resending it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

/// Server response to Init.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitOk {
    /// Session assigned to this connection
    pub session_id: SessionId,
    /// Full attribute dictionary
    pub attrs: Vec<Attribute>,
    /// Authenticated user record, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

/// Subscribe to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddQuery {
    /// Query tree
    pub q: Value,
    /// Correlation id
    pub client_event_id: ClientEventId,
}

/// Initial result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddQueryOk {
    /// Query tree as received
    pub q: Value,
    /// Hash of the query tree
    pub hash: QueryHash,
    /// All triples the result depends on
    pub triples: Vec<Triple>,
    /// Highest server tx reflected in the result
    pub processed_tx_id: TxId,
    /// Correlation id from AddQuery
    pub client_event_id: ClientEventId,
}

/// Unsubscribe from a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveQuery {
    /// Hash of the query to drop
    pub hash: QueryHash,
}

/// Fresh triples for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    /// Hash of the refreshed query
    pub hash: QueryHash,
    /// All triples the result depends on
    pub triples: Vec<Triple>,
}

/// Server-initiated invalidation carrying fresh results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOk {
    /// One entry per refreshed query
    pub computations: Vec<Computation>,
    /// Updated attribute dictionary, when the schema changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Vec<Attribute>>,
    /// Highest server tx reflected in these results
    pub processed_tx_id: TxId,
}

/// Submit a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transact {
    /// Ordered steps
    pub tx_steps: Vec<TxStep>,
    /// Correlation id (the mutation id)
    pub client_event_id: ClientEventId,
    /// Ask the server to skip permission checks on cascaded deletes
    #[serde(default)]
    pub cascade_bypass_permissions: bool,
    /// Permission rule parameters keyed by namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_params: Option<Value>,
}

/// Transaction confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactOk {
    /// Correlation id from Transact
    pub client_event_id: ClientEventId,
    /// Server tx id assigned to the transaction
    pub tx_id: TxId,
}

/// Category of a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Permission rules rejected the request.
    PermissionDenied,
    /// A unique attribute already holds the value.
    RecordNotUnique,
    /// A referenced entity does not exist.
    RecordNotFound,
    /// Server-side validation failed.
    ValidationFailed,
    /// Query could not be compiled.
    InvalidQuery,
    /// Credentials are missing or invalid.
    Unauthorized,
    /// Anything the client does not recognize.
    #[serde(other)]
    Unknown,
}

/// Request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// HTTP-like status code
    pub status: u16,
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Correlation id of the failed request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_event_id: Option<ClientEventId>,
    /// `op` of the failed request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_op: Option<String>,
    /// Hash of the failed query, for query errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<QueryHash>,
}

/// Join a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Room scope
    #[serde(flatten)]
    pub room: RoomKey,
    /// This session's peer id
    pub peer_id: PeerId,
    /// Initial presence
    pub data: Value,
}

/// A bare room reference (join ack, leave).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    /// Room scope
    #[serde(flatten)]
    pub room: RoomKey,
}

/// Publish own presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPresence {
    /// Room scope
    #[serde(flatten)]
    pub room: RoomKey,
    /// Full presence slice of this peer
    pub data: Value,
}

/// Authoritative presence map of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshPresence {
    /// Room scope
    #[serde(flatten)]
    pub room: RoomKey,
    /// Presence payload per peer, including this session
    pub data: BTreeMap<PeerId, Value>,
}

/// Publish a topic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientBroadcast {
    /// Room scope
    #[serde(flatten)]
    pub room: RoomKey,
    /// Topic name
    pub topic: String,
    /// Payload
    pub data: Value,
}

/// Topic message relayed from another peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerBroadcast {
    /// Room scope
    #[serde(flatten)]
    pub room: RoomKey,
    /// Topic name
    pub topic: String,
    /// Sending peer
    pub peer_id: PeerId,
    /// Payload
    pub data: Value,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender clock, milliseconds since the epoch
    pub at: u64,
}

/// Open a byte stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOpen {
    /// Caller-chosen stream id
    pub client_id: StreamId,
    /// Application metadata (file name, content type, ...)
    #[serde(default)]
    pub meta: Value,
}

/// Chunk of a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamData {
    /// Stream id
    pub client_id: StreamId,
    /// Byte offset of this chunk within the stream
    pub offset: u64,
    /// Chunk bytes, standard base64
    pub data: String,
    /// Last chunk of the stream
    #[serde(default)]
    pub done: bool,
}

/// Flow-control acknowledgement for a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAck {
    /// Stream id
    pub client_id: StreamId,
    /// All bytes before this offset were consumed
    pub offset: u64,
}

/// Abort a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAbort {
    /// Stream id
    pub client_id: StreamId,
    /// Reason
    pub reason: String,
}
