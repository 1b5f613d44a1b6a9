//! Byte streams of the current connection.
//!
//! Streams live and die with a connection: a reconnect aborts every open
//! stream and the application reopens what it still needs.

use serde_json::Value;
use std::collections::HashMap;
use tessel_sync_core::{InboundStream, OutboundStream, ReceivedChunk, StreamError};
use tessel_sync_types::{StreamAbort, StreamAck, StreamData, StreamId, StreamOpen};

/// Inbound stream activity delivered to stream listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The server opened a stream.
    Opened {
        /// Stream id.
        stream: StreamId,
        /// Application metadata.
        meta: Value,
    },
    /// Bytes arrived, in order.
    Data(ReceivedChunk),
    /// A stream ended abnormally (peer abort, protocol error or disconnect).
    Aborted {
        /// Stream id.
        stream: StreamId,
        /// Why.
        reason: String,
    },
}

/// What the reactor should do after an inbound stream frame.
#[derive(Debug, Default)]
pub(crate) struct StreamReply {
    pub(crate) event: Option<StreamEvent>,
    pub(crate) ack: Option<StreamAck>,
    pub(crate) abort: Option<StreamAbort>,
}

#[derive(Debug)]
pub(crate) struct StreamTable {
    window: u64,
    outbound: HashMap<StreamId, OutboundStream>,
    inbound: HashMap<StreamId, InboundStream>,
}

impl StreamTable {
    pub(crate) fn new(window: u64) -> Self {
        Self {
            window,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    pub(crate) fn open(&mut self, id: StreamId, meta: Value) -> Result<StreamOpen, StreamError> {
        if self.outbound.contains_key(&id) {
            return Err(StreamError::AlreadyOpen(id.to_string()));
        }
        self.outbound
            .insert(id.clone(), OutboundStream::new(id.clone(), self.window));
        Ok(StreamOpen {
            client_id: id,
            meta,
        })
    }

    pub(crate) fn can_send(&self, id: &StreamId, len: usize) -> bool {
        self.outbound.get(id).is_some_and(|s| s.can_send(len))
    }

    pub(crate) fn write(
        &mut self,
        id: &StreamId,
        bytes: &[u8],
        done: bool,
    ) -> Result<StreamData, StreamError> {
        self.outbound
            .get_mut(id)
            .ok_or_else(|| StreamError::Unknown(id.to_string()))?
            .next_chunk(bytes, done)
    }

    /// Drop a stream locally; returns the abort frame when it was open.
    pub(crate) fn abort(&mut self, id: &StreamId, reason: &str) -> Option<StreamAbort> {
        let known = self.outbound.remove(id).is_some() | self.inbound.remove(id).is_some();
        known.then(|| StreamAbort {
            client_id: id.clone(),
            reason: reason.to_string(),
        })
    }

    pub(crate) fn on_ack(&mut self, ack: &StreamAck) {
        if let Some(out) = self.outbound.get_mut(&ack.client_id) {
            out.on_ack(ack.offset);
            if out.is_complete() {
                self.outbound.remove(&ack.client_id);
            }
        }
    }

    pub(crate) fn on_open(&mut self, open: StreamOpen) -> StreamReply {
        let ack_every = (self.window / 2).max(1);
        self.inbound.insert(
            open.client_id.clone(),
            InboundStream::new(open.client_id.clone(), ack_every),
        );
        StreamReply {
            event: Some(StreamEvent::Opened {
                stream: open.client_id,
                meta: open.meta,
            }),
            ..StreamReply::default()
        }
    }

    pub(crate) fn on_data(&mut self, data: &StreamData) -> StreamReply {
        let id = &data.client_id;
        let result = match self.inbound.get_mut(id) {
            Some(stream) => stream.on_data(data),
            None => Err(StreamError::Unknown(id.to_string())),
        };
        match result {
            Ok(Some((chunk, ack))) => {
                if chunk.done {
                    self.inbound.remove(id);
                }
                StreamReply {
                    event: Some(StreamEvent::Data(chunk)),
                    ack,
                    abort: None,
                }
            }
            Ok(None) => StreamReply::default(),
            Err(e) => {
                self.inbound.remove(id);
                let reason = e.to_string();
                StreamReply {
                    event: Some(StreamEvent::Aborted {
                        stream: id.clone(),
                        reason: reason.clone(),
                    }),
                    ack: None,
                    abort: Some(StreamAbort {
                        client_id: id.clone(),
                        reason,
                    }),
                }
            }
        }
    }

    pub(crate) fn on_abort(&mut self, abort: StreamAbort) -> Option<StreamEvent> {
        let known = self.outbound.remove(&abort.client_id).is_some()
            | self.inbound.remove(&abort.client_id).is_some();
        known.then_some(StreamEvent::Aborted {
            stream: abort.client_id,
            reason: abort.reason,
        })
    }

    /// The connection dropped: every stream is gone.
    pub(crate) fn reset(&mut self, reason: &str) -> Vec<StreamEvent> {
        let mut ids: Vec<StreamId> = self
            .outbound
            .drain()
            .map(|(id, _)| id)
            .chain(self.inbound.drain().map(|(id, _)| id))
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|stream| StreamEvent::Aborted {
                stream,
                reason: reason.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> StreamId {
        StreamId::new(s)
    }

    #[test]
    fn outbound_lifecycle() {
        let mut table = StreamTable::new(8);
        let open = table.open(id("up"), json!({"name": "a.txt"})).unwrap();
        assert_eq!(open.client_id, id("up"));
        assert!(matches!(
            table.open(id("up"), Value::Null),
            Err(StreamError::AlreadyOpen(_))
        ));

        let chunk = table.write(&id("up"), b"12345678", false).unwrap();
        assert_eq!(chunk.offset, 0);
        assert!(!table.can_send(&id("up"), 1));
        table.on_ack(&StreamAck {
            client_id: id("up"),
            offset: 8,
        });
        table.write(&id("up"), b"9", true).unwrap();
        table.on_ack(&StreamAck {
            client_id: id("up"),
            offset: 9,
        });
        // Complete streams are forgotten.
        assert!(matches!(
            table.write(&id("up"), b"x", false),
            Err(StreamError::Unknown(_))
        ));
    }

    #[test]
    fn inbound_data_for_unknown_stream_aborts() {
        let mut table = StreamTable::new(8);
        let reply = table.on_data(&StreamData {
            client_id: id("ghost"),
            offset: 0,
            data: String::new(),
            done: false,
        });
        assert!(reply.abort.is_some());
        assert!(matches!(reply.event, Some(StreamEvent::Aborted { .. })));
    }

    #[test]
    fn inbound_chunks_are_acked_and_finish() {
        let mut table = StreamTable::new(4);
        table.on_open(StreamOpen {
            client_id: id("down"),
            meta: Value::Null,
        });
        let mut sender = OutboundStream::new(id("down"), 100);
        let reply = table.on_data(&sender.next_chunk(b"ab", false).unwrap());
        assert!(matches!(reply.event, Some(StreamEvent::Data(_))));
        assert_eq!(reply.ack.map(|a| a.offset), Some(2));

        let reply = table.on_data(&sender.next_chunk(b"c", true).unwrap());
        match reply.event {
            Some(StreamEvent::Data(chunk)) => assert!(chunk.done),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn reset_aborts_everything() {
        let mut table = StreamTable::new(4);
        table.open(id("a"), Value::Null).unwrap();
        table.on_open(StreamOpen {
            client_id: id("b"),
            meta: Value::Null,
        });
        let events = table.reset("connection lost");
        assert_eq!(events.len(), 2);
        assert!(table.reset("again").is_empty());
        assert!(table.abort(&id("a"), "x").is_none());
    }
}
