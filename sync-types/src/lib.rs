//! # sync-types
//!
//! Wire format and data model types for the Tessel local-first sync protocol.
//!
//! This crate provides the foundational types used across all Tessel crates:
//! - [`EntityId`], [`AttrId`], [`TxId`], [`QueryHash`] - Identity and ordering types
//! - [`Attribute`] - Entries of the schema dictionary
//! - [`Triple`], [`TxStep`] - Facts and the steps that change them
//! - [`Frame`] - Protocol frames (init, queries, transactions, rooms, streams)
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod attr;
mod error;
mod ids;
mod messages;
mod triple;

pub use attr::{AttrPatch, Attribute, Cardinality, Catalog, DataType, Identity, OnDelete, ValueType};
pub use error::SyncError;
pub use ids::{
    AttrId, ClientEventId, EntityId, PeerId, QueryHash, RoomKey, SessionId, StreamId, TxId,
};
pub use messages::{
    AddQuery, AddQueryOk, ClientBroadcast, Computation, ErrorFrame, ErrorKind, Frame, Heartbeat,
    Init, InitOk, JoinRoom, RefreshOk, RefreshPresence, RemoveQuery, RoomRef, ServerBroadcast,
    SetPresence, StreamAbort, StreamAck, StreamData, StreamOpen, Transact, TransactOk,
    PROTOCOL_VERSION,
};
pub use triple::{Triple, TxStep};
