//! Mock transport for testing.
//!
//! Scripted inbound frames, captured outbound frames, forced failures and a
//! server-side hang-up, all shared between clones.

use super::{Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tessel_sync_types::Frame;
use tokio::sync::Notify;

/// Mock transport for testing.
///
/// Clones share state, so a test keeps one handle while the client owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    wake: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_count: usize,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    init_reply: Option<Vec<u8>>,
    fail_next_connect: Option<String>,
    fail_connects: usize,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes to be returned by `recv()`.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.inner.lock().receive_queue.push_back(data);
        self.wake.notify_waiters();
    }

    /// Queue a frame to be returned by `recv()`.
    pub fn queue_frame(&self, frame: &Frame) {
        match frame.to_bytes() {
            Ok(bytes) => self.queue_response(bytes),
            Err(e) => tracing::warn!(error = %e, "mock transport could not encode frame"),
        }
    }

    /// Answer every `init` with `reply` (typically an `init-ok`).
    pub fn reply_to_init(&self, reply: &Frame) {
        self.inner.lock().init_reply = reply.to_bytes().ok();
    }

    /// Stop answering `init`.
    pub fn clear_init_reply(&self) {
        self.inner.lock().init_reply = None;
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.inner.lock().sent_messages.clone()
    }

    /// Sent messages decoded as frames; undecodable ones are skipped.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner
            .lock()
            .sent_messages
            .iter()
            .filter_map(|bytes| Frame::from_bytes(bytes).ok())
            .collect()
    }

    /// Take and clear the sent frames.
    pub fn take_sent_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut self.inner.lock().sent_messages)
            .iter()
            .filter_map(|bytes| Frame::from_bytes(bytes).ok())
            .collect()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.inner.lock().sent_messages.last().cloned()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        self.inner.lock().connected_address.clone()
    }

    /// Number of successful `connect()` calls.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.inner.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next `n` connect() calls to fail.
    pub fn fail_connects(&self, n: usize) {
        self.inner.lock().fail_connects = n;
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.inner.lock().fail_next_recv = Some(error.to_string());
        self.wake.notify_waiters();
    }

    /// Simulate the server hanging up. Pending and future `recv()` calls
    /// fail until the next `connect()`.
    pub fn drop_connection(&self) {
        {
            let mut inner = self.inner.lock();
            inner.connected = false;
            inner.receive_queue.clear();
        }
        self.wake.notify_waiters();
    }

    /// Clear all state (messages, queue, connection).
    pub fn reset(&self) {
        *self.inner.lock() = MockTransportInner::default();
        self.wake.notify_waiters();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();

        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(TransportError::ConnectionFailed("connection refused".into()));
        }

        inner.connected = true;
        inner.connect_count += 1;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }
            if let Some(error) = inner.fail_next_send.take() {
                return Err(TransportError::SendFailed(error));
            }

            inner.sent_messages.push(data.to_vec());
            let is_init = matches!(Frame::from_bytes(data), Ok(Frame::Init(_)));
            match inner.init_reply.clone() {
                Some(reply) if is_init => inner.receive_queue.push_back(reply),
                _ => return Ok(()),
            }
        }
        self.wake.notify_waiters();
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut first = true;
        loop {
            // Registered before inspecting the queue so no wakeup is lost.
            let woken = self.wake.notified();
            {
                let mut inner = self.inner.lock();

                if !inner.connected {
                    return Err(if first {
                        TransportError::NotConnected
                    } else {
                        TransportError::ConnectionClosed
                    });
                }
                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }
                if let Some(data) = inner.receive_queue.pop_front() {
                    return Ok(data);
                }
            }
            first = false;
            woken.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.lock().connected = false;
        self.wake.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessel_sync_types::Heartbeat;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("ws://test").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.connected_address(), Some("ws://test".to_string()));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_sends_messages() {
        let transport = MockTransport::new();
        transport.connect("ws").await.unwrap();

        transport.send(b"message 1").await.unwrap();
        transport.send(b"message 2").await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"message 1");
        assert_eq!(transport.last_sent(), Some(b"message 2".to_vec()));
    }

    #[tokio::test]
    async fn recv_waits_for_queued_frame() {
        let transport = MockTransport::new();
        transport.connect("ws").await.unwrap();

        let reader = transport.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.queue_frame(&Frame::Pong(Heartbeat { at: 1 }));

        let bytes = pending.await.unwrap().unwrap();
        assert_eq!(
            Frame::from_bytes(&bytes).unwrap(),
            Frame::Pong(Heartbeat { at: 1 })
        );
    }

    #[tokio::test]
    async fn drop_connection_wakes_reader() {
        let transport = MockTransport::new();
        transport.connect("ws").await.unwrap();

        let reader = transport.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.drop_connection();

        assert!(matches!(
            pending.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn init_is_answered_when_scripted() {
        let transport = MockTransport::new();
        transport.reply_to_init(&Frame::Pong(Heartbeat { at: 9 }));
        transport.connect("ws").await.unwrap();

        let init = Frame::Init(tessel_sync_types::Init {
            protocol_version: 1,
            app_id: "app".into(),
            refresh_token: None,
            device_name: "test".into(),
            schema_hash: None,
        });
        transport.send(&init.to_bytes().unwrap()).await.unwrap();

        let reply = transport.recv().await.unwrap();
        assert_eq!(
            Frame::from_bytes(&reply).unwrap(),
            Frame::Pong(Heartbeat { at: 9 })
        );
        assert_eq!(transport.sent_frames(), vec![init]);
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failures() {
        let transport = MockTransport::new();
        transport.fail_next_connect("network unreachable");
        assert!(matches!(
            transport.connect("ws").await,
            Err(TransportError::ConnectionFailed(_))
        ));

        transport.fail_connects(2);
        assert!(transport.connect("ws").await.is_err());
        assert!(transport.connect("ws").await.is_err());
        assert!(transport.connect("ws").await.is_ok());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect("ws").await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        transport.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn forced_recv_failure() {
        let transport = MockTransport::new();
        transport.connect("ws").await.unwrap();
        transport.queue_response(b"data".to_vec());
        transport.fail_next_recv("timeout");

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));

        let data = transport.recv().await.unwrap();
        assert_eq!(data, b"data");
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.connect("ws").await.unwrap();
        assert!(transport2.is_connected());

        transport1.send(b"from t1").await.unwrap();
        transport2.send(b"from t2").await.unwrap();

        assert_eq!(transport1.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn mock_transport_reset_clears_all() {
        let transport = MockTransport::new();
        transport.connect("ws").await.unwrap();
        transport.send(b"data").await.unwrap();
        transport.queue_response(b"response".to_vec());

        transport.reset();

        assert!(!transport.is_connected());
        assert!(transport.sent_messages().is_empty());
        assert!(transport.connected_address().is_none());
    }
}
