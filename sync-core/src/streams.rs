//! Byte streams multiplexed on the connection.
//!
//! Each stream is flow-controlled independently: the sender may have at most
//! `window` unacknowledged bytes in flight, and the receiver acknowledges
//! offsets as it consumes data. Chunks must arrive in offset order.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;
use tessel_sync_types::{StreamAck, StreamData, StreamId};
use thiserror::Error;

/// Default in-flight window per stream.
pub const DEFAULT_STREAM_WINDOW: u64 = 256 * 1024;

/// Stream protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A chunk skipped ahead of the expected offset.
    #[error("stream {stream}: expected offset {expected}, got {got}")]
    OutOfOrder {
        /// Stream id.
        stream: String,
        /// Next expected offset.
        expected: u64,
        /// Offset received.
        got: u64,
    },
    /// Chunk payload is not valid base64.
    #[error("stream {stream}: invalid chunk encoding: {reason}")]
    InvalidData {
        /// Stream id.
        stream: String,
        /// Decoder message.
        reason: String,
    },
    /// Data after the stream finished.
    #[error("stream {0} already finished")]
    Finished(String),
    /// No open stream has this id.
    #[error("unknown stream {0}")]
    Unknown(String),
    /// A stream with this id is already open.
    #[error("stream {0} is already open")]
    AlreadyOpen(String),
    /// The window does not allow sending this chunk yet.
    #[error("stream {stream}: window full ({in_flight} bytes in flight)")]
    WindowFull {
        /// Stream id.
        stream: String,
        /// Unacknowledged bytes.
        in_flight: u64,
    },
}

/// Sending side of a stream.
#[derive(Debug, Clone)]
pub struct OutboundStream {
    id: StreamId,
    window: u64,
    sent: u64,
    acked: u64,
    done: bool,
}

impl OutboundStream {
    /// Open a stream with the given window.
    pub fn new(id: StreamId, window: u64) -> Self {
        Self {
            id,
            window,
            sent: 0,
            acked: 0,
            done: false,
        }
    }

    /// Stream id.
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Unacknowledged bytes.
    pub fn in_flight(&self) -> u64 {
        self.sent - self.acked
    }

    /// Whether a chunk of `len` bytes fits the window. An empty window
    /// always accepts one chunk so oversized chunks still make progress.
    pub fn can_send(&self, len: usize) -> bool {
        !self.done && (self.in_flight() == 0 || self.in_flight() + len as u64 <= self.window)
    }

    /// Build the next `stream-data` frame.
    pub fn next_chunk(&mut self, bytes: &[u8], done: bool) -> Result<StreamData, StreamError> {
        if self.done {
            return Err(StreamError::Finished(self.id.as_str().to_string()));
        }
        if !self.can_send(bytes.len()) {
            return Err(StreamError::WindowFull {
                stream: self.id.as_str().to_string(),
                in_flight: self.in_flight(),
            });
        }
        let frame = StreamData {
            client_id: self.id.clone(),
            offset: self.sent,
            data: STANDARD.encode(bytes),
            done,
        };
        self.sent += bytes.len() as u64;
        self.done = done;
        Ok(frame)
    }

    /// Peer acknowledged everything below `offset`.
    pub fn on_ack(&mut self, offset: u64) {
        self.acked = self.acked.max(offset.min(self.sent));
    }

    /// All data sent and acknowledged.
    pub fn is_complete(&self) -> bool {
        self.done && self.acked == self.sent
    }
}

/// Bytes delivered to the application.
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedChunk {
    /// Stream id.
    pub stream: StreamId,
    /// Offset of the first byte.
    pub offset: u64,
    /// Payload.
    pub bytes: Vec<u8>,
    /// Last chunk of the stream.
    pub done: bool,
}

impl fmt::Debug for ReceivedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedChunk")
            .field("stream", &self.stream)
            .field("offset", &self.offset)
            .field("bytes", &format!("[{} bytes REDACTED]", self.bytes.len()))
            .field("done", &self.done)
            .finish()
    }
}

/// Receiving side of a stream.
#[derive(Debug, Clone)]
pub struct InboundStream {
    id: StreamId,
    received: u64,
    acked: u64,
    ack_every: u64,
    done: bool,
}

impl InboundStream {
    /// Track a stream, acknowledging after every `ack_every` bytes.
    pub fn new(id: StreamId, ack_every: u64) -> Self {
        Self {
            id,
            received: 0,
            acked: 0,
            ack_every: ack_every.max(1),
            done: false,
        }
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether the final chunk arrived.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Process a chunk. Duplicates of already-received data yield `None`.
    #[allow(clippy::type_complexity)]
    pub fn on_data(
        &mut self,
        frame: &StreamData,
    ) -> Result<Option<(ReceivedChunk, Option<StreamAck>)>, StreamError> {
        let stream = self.id.as_str().to_string();
        if frame.offset < self.received {
            return Ok(None);
        }
        if self.done {
            return Err(StreamError::Finished(stream));
        }
        if frame.offset > self.received {
            return Err(StreamError::OutOfOrder {
                stream,
                expected: self.received,
                got: frame.offset,
            });
        }
        let bytes = STANDARD
            .decode(frame.data.as_bytes())
            .map_err(|e| StreamError::InvalidData {
                stream,
                reason: e.to_string(),
            })?;

        self.received += bytes.len() as u64;
        self.done = frame.done;

        let ack = if self.done || self.received - self.acked >= self.ack_every {
            self.acked = self.received;
            Some(StreamAck {
                client_id: self.id.clone(),
                offset: self.received,
            })
        } else {
            None
        };

        Ok(Some((
            ReceivedChunk {
                stream: self.id.clone(),
                offset: frame.offset,
                bytes,
                done: frame.done,
            },
            ack,
        )))
    }
}
