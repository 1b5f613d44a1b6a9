//! # sync-client
//!
//! Client library for the Tessel local-first sync protocol.
//!
//! This is the library applications use to read and write synced data.
//!
//! ## Features
//!
//! - **Optimistic writes**: transactions apply locally at once and reconcile
//!   with the server's acks and rejections
//! - **Live queries**: deduplicated subscriptions with cached results
//! - **Offline first**: pending mutations and query results persist locally
//!   (SQLite or memory) and replay on reconnect
//! - **Rooms**: refcounted joins, presence and topic broadcasts
//! - **Streams**: flow-controlled byte streams on the same connection
//! - **Transport abstraction**: WebSocket and mock transports
//! - **Pure state machines**: protocol logic lives in sync-core
//!
//! ## Example
//!
//! ```ignore
//! use tessel_sync_client::{Client, ClientConfig, WebSocketTransport};
//!
//! let config = ClientConfig::from_file("tessel.toml".as_ref())?;
//! let client = Client::open(config, WebSocketTransport::new()).await?;
//!
//! let _todos = client.subscribe_query(json!({"todos": {}}), |state| {
//!     if let Some(data) = &state.data {
//!         render(data);
//!     }
//! });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
mod connection;
pub mod error;
mod notify;
mod reactor;
pub mod registry;
pub mod storage;
pub mod streams;
pub mod transport;

pub use client::{
    Client, InfiniteQuery, InfiniteState, ListenerHandle, RoomMembership, TopicMessage,
    TransactOptions, TransactionHandle,
};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use registry::ClientRegistry;
pub use storage::{MemoryStorage, Persister, SqliteStorage, StorageError};
pub use streams::StreamEvent;
pub use transport::{MockTransport, Transport, TransportError, WebSocketTransport, MAX_FRAME_SIZE};
