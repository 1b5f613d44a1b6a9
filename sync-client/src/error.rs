//! Client errors.

use tessel_sync_core::{SchemaError, StreamError, ValidationError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Errors returned by [`Client`](crate::Client) operations.
///
/// Query and mutation failures are not here: queries report errors in
/// their state, transactions through [`MutationError`](tessel_sync_core::MutationError).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation needs a live connection.
    #[error("not connected: {0}")]
    Connection(String),

    /// Input rejected locally.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Query does not match the schema.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Byte stream protocol violation.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// The room is not joined by this client.
    #[error("room {0} is not joined")]
    RoomNotJoined(String),

    /// The client was shut down.
    #[error("client closed")]
    Closed,
}
