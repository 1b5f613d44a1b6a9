//! # sync-core
//!
//! Pure logic for the Tessel sync reactor (no I/O, instant tests).
//!
//! This crate implements the data structures, algorithms and state machines
//! of the reactor without any network or disk I/O:
//!
//! - [`Store`] - copy-on-write triple store and its indexes
//! - [`Query`] / [`evaluate`] - nested query compilation and evaluation
//! - [`pagination`] - sort keys, cursors and windows
//! - [`MutationQueue`] - the optimistic mutation log
//! - [`transact`] - the transaction builder
//! - [`SubscriptionManager`] / [`QueryCache`] - query dedup and result cache
//! - [`ConnectionState`] / [`HeartbeatMonitor`] - connection lifecycle
//! - [`RoomHub`] - rooms, presence and topics
//! - [`streams`] - per-stream flow control
//!
//! The actual I/O (network, disk) is performed by `sync-client`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod callback;
pub mod coerce;
pub mod error;
pub mod heartbeat;
pub mod merge;
pub mod pagination;
pub mod query;
pub mod queue;
pub mod rooms;
pub mod schema;
pub mod state;
pub mod store;
pub mod streams;
pub mod subscriptions;
pub mod transact;

pub use cache::{CachedQuery, QueryCache, DEFAULT_QUERY_CACHE_LIMIT};
pub use callback::CallbackSlot;
pub use error::{MutationError, QueryError, RejectionKind, SchemaError, ValidationError};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use pagination::{Direction, PageAccumulator, PageCursor, PageInfo};
pub use query::{evaluate, Query, QueryResult};
pub use queue::{Mutation, MutationQueue, MutationStatus};
pub use rooms::{JoinOutcome, PresenceOpts, PresenceView, RoomHub};
pub use schema::{LinkDirection, Schema};
pub use state::{Action, BackoffConfig, ConnectionState, ConnectionStatus, Event};
pub use store::{ChangeSet, Store};
pub use streams::{InboundStream, OutboundStream, ReceivedChunk, StreamError};
pub use subscriptions::{ListenerId, QueryState, Subscription, SubscriptionManager};
pub use transact::{compile, CompiledTx, TxChunk, TxOptions};
