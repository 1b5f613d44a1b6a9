//! Transport abstraction for Tessel sync.
//!
//! The client speaks JSON frames over one duplex connection. The transport
//! only moves bytes; framing and the protocol live in the reactor.
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection
//! - `send()` transmits one encoded frame
//! - `recv()` waits for the next frame
//! - `close()` gracefully terminates
//!
//! `send()` and `recv()` may run concurrently: the client keeps one reader
//! and one writer task per connection.

mod mock;
mod websocket;

pub use mock::MockTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Largest frame accepted from the server.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Transport trait for sending and receiving protocol frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the sync server at `address`.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one encoded frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one encoded frame.
    ///
    /// Waits until data is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
