//! Client - the main interface for Tessel sync.
//!
//! This module provides [`Client`], the handle applications use to query,
//! transact, join rooms and stream bytes.
//!
//! # Architecture
//!
//! Every operation runs against the reactor under one lock and returns
//! immediately. A background task drives the connection and feeds server
//! frames into the same reactor.
//!
//! ```text
//! Application → Client → ReactorState (sync-core logic) → outbox → Transport
//!                             ↑                                      │
//!                             └──────── connection driver ←──────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tessel_sync_client::{Client, ClientConfig, WebSocketTransport};
//! use tessel_sync_core::TxChunk;
//! use tessel_sync_types::EntityId;
//! use serde_json::json;
//!
//! let config = ClientConfig::new("my-app", "wss://sync.example.com/runtime/session");
//! let client = Client::open(config, WebSocketTransport::new()).await?;
//!
//! let goals = client.subscribe_query(json!({"goals": {}}), |state| {
//!     println!("{:?}", state.data);
//! });
//! let tx_id = client
//!     .transact(vec![TxChunk::new("goals", EntityId::new()).create(json!({"title": "a"}))])
//!     .await?;
//! ```

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tessel_sync_core::{
    CallbackSlot, ConnectionStatus, ListenerId, MutationError, PageAccumulator, PresenceOpts,
    PresenceView, QueryError, QueryState, SchemaError, TxChunk,
};
use tessel_sync_types::{ClientEventId, PeerId, QueryHash, RoomKey, StreamId, TxId};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection;
use crate::error::ClientError;
use crate::notify::{deliver_all, Gate};
use crate::reactor::{Listener, ReactorState};
use crate::storage::{load_snapshot, spawn_writer, MemoryStorage, Persister, SqliteStorage};
use crate::streams::StreamEvent;
use crate::transport::Transport;

/// A message published on a room topic by another peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    /// Room the message was published in.
    pub room: RoomKey,
    /// Topic name.
    pub topic: String,
    /// Sender.
    pub peer_id: PeerId,
    /// Payload.
    pub data: Value,
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactOptions {
    /// Let cascaded deletes skip permission checks on the server.
    pub cascade_bypass_permissions: bool,
}

/// State shared by the client handle, its listener handles and the
/// connection driver.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) restart: Notify,
    reactor: Mutex<ReactorState>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Run `f` under the reactor lock, then deliver what it queued.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ReactorState) -> R) -> R {
        let (out, notes) = {
            let mut reactor = self.reactor.lock();
            let out = f(&mut reactor);
            (out, reactor.take_notifications())
        };
        deliver_all(notes);
        out
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.reactor.lock().is_closed()
    }

    pub(crate) fn session_alive(&self) -> bool {
        self.reactor.lock().session_alive()
    }
}

/// Handle to one app's sync client.
///
/// Cheap to clone; clones share the same connection and store. Call
/// [`Client::shutdown`] to stop the background connection task.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("app_id", &self.shared.config.app_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Open a client with the storage named by the config: SQLite when
    /// `database_path` is set, memory otherwise.
    pub async fn open(
        config: ClientConfig,
        transport: impl Transport + 'static,
    ) -> Result<Self, ClientError> {
        let persister: Arc<dyn Persister> = match &config.database_path {
            Some(path) => Arc::new(SqliteStorage::new(path).await?),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::with_persister(config, transport, persister).await
    }

    /// Open a client over an explicit persister.
    ///
    /// Persisted state is loaded first: pending mutations are applied
    /// optimistically and cached query results answer new subscriptions
    /// before the server does.
    pub async fn with_persister(
        config: ClientConfig,
        transport: impl Transport + 'static,
        persister: Arc<dyn Persister>,
    ) -> Result<Self, ClientError> {
        let snapshot = load_snapshot(persister.as_ref(), &config.app_id).await?;
        let mut reactor = ReactorState::new(&config, snapshot);
        reactor.set_persistence(spawn_writer(persister, config.app_id.clone()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            transport: Arc::new(transport),
            restart: Notify::new(),
            reactor: Mutex::new(reactor),
            shutdown,
            driver: Mutex::new(None),
        });

        let driver = tokio::spawn(connection::run(shared.clone(), shutdown_rx));
        *shared.driver.lock() = Some(driver);
        info!(
            app_id = %shared.config.app_id,
            uri = %shared.config.websocket_uri,
            "client started"
        );
        Ok(Self { shared })
    }

    /// Whether two handles refer to the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The configuration this client was opened with.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.reactor.lock().status()
    }

    /// This client's peer id in rooms.
    pub fn peer_id(&self) -> PeerId {
        self.shared.reactor.lock().peer_id()
    }

    /// Mutations not yet pruned from the log.
    pub fn pending_mutations(&self) -> usize {
        self.shared.reactor.lock().pending_mutations()
    }

    // ===========================================
    // Connection
    // ===========================================

    /// Watch connection status. The current status is delivered right away.
    pub fn subscribe_connection_status(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> ListenerHandle<ConnectionStatus> {
        let (slot, gate) = (CallbackSlot::new(callback), Gate::new());
        let listener = Listener::new(slot.clone(), gate.clone());
        let id = self.shared.update(|r| r.subscribe_status(listener));
        self.handle(ListenerKind::Status(id), slot, gate)
    }

    /// Retry after an error that stopped reconnection (e.g. an expired
    /// token). No-op while connected or retrying.
    pub fn restart(&self) {
        if matches!(self.status(), ConnectionStatus::Errored { retrying: false, .. }) {
            info!(app_id = %self.shared.config.app_id, "restarting connection");
            self.shared.restart.notify_one();
        }
    }

    /// Replace the refresh token used by the next handshake and restart a
    /// stopped connection.
    pub fn set_refresh_token(&self, token: Option<String>) {
        self.shared.update(|r| r.set_refresh_token(token));
        self.restart();
    }

    /// Wait until every persistence write issued so far is durable.
    pub async fn flush(&self) {
        let wait = self.shared.reactor.lock().flush_persistence();
        if let Some(wait) = wait {
            let _ = wait.await;
        }
    }

    /// Close the connection and stop the driver.
    ///
    /// Outstanding transaction futures resolve with
    /// [`MutationError::Cancelled`]; their mutations stay in the durable
    /// log and are replayed by the next client opened for this app.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        let driver = self.shared.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.shared.update(|r| {
            r.on_conn_event(tessel_sync_core::Event::Shutdown);
            r.cancel_waiters();
        });
        self.flush().await;
        info!(app_id = %self.shared.config.app_id, "client shut down");
    }

    // ===========================================
    // Queries
    // ===========================================

    /// Subscribe to a query.
    ///
    /// The callback gets the current state synchronously (cached or
    /// optimistic data, or `is_loading`), then every change.
    pub fn subscribe_query(
        &self,
        q: Value,
        callback: impl Fn(&QueryState) + Send + Sync + 'static,
    ) -> ListenerHandle<QueryState> {
        let (slot, gate) = (CallbackSlot::new(callback), Gate::new());
        let listener = Listener::new(slot.clone(), gate.clone());
        let (hash, id) = self.shared.update(|r| r.subscribe_query(q, listener));
        self.handle(ListenerKind::Query(hash, id), slot, gate)
    }

    /// Subscribe to an infinitely scrolling query.
    ///
    /// `q` must have one top-level namespace whose `$` block sets `first`
    /// (the page size) and usually `order`. [`InfiniteQuery::load_more`]
    /// appends the next window after the last `endCursor`.
    pub fn subscribe_infinite(
        &self,
        q: Value,
        callback: impl Fn(&InfiniteState) + Send + Sync + 'static,
    ) -> Result<InfiniteQuery, ClientError> {
        let namespace = single_namespace(&q).ok_or_else(|| SchemaError::InvalidQuery {
            path: String::new(),
            reason: "an infinite query needs exactly one top-level namespace".into(),
        })?;
        let query = InfiniteQuery {
            client: self.clone(),
            inner: Arc::new(Mutex::new(InfiniteInner {
                base: q,
                namespace,
                pages: PageAccumulator::new(),
                windows: Vec::new(),
                last: Vec::new(),
            })),
            slot: CallbackSlot::new(callback),
        };
        query.open_window(None);
        Ok(query)
    }

    // ===========================================
    // Transactions
    // ===========================================

    /// Apply a transaction optimistically and send it.
    ///
    /// The returned future resolves when the server confirms or rejects
    /// it. Local validation failures resolve it immediately. Dropping the
    /// future does not cancel the transaction.
    pub fn transact(&self, chunks: Vec<TxChunk>) -> TransactionHandle {
        self.transact_with(chunks, TransactOptions::default())
    }

    /// [`Client::transact`] with options.
    pub fn transact_with(&self, chunks: Vec<TxChunk>, opts: TransactOptions) -> TransactionHandle {
        let result = self
            .shared
            .update(|r| r.transact(&chunks, opts.cascade_bypass_permissions));
        match result {
            Ok((id, wait)) => TransactionHandle {
                id: Some(id),
                state: TxState::Waiting(wait),
            },
            Err(e) => {
                debug!(error = %e, "transaction rejected locally");
                TransactionHandle {
                    id: None,
                    state: TxState::Failed(Some(e)),
                }
            }
        }
    }

    // ===========================================
    // Rooms
    // ===========================================

    /// Join a room. Joins are refcounted: the membership is shared with
    /// other joins of the same room and left when the last one leaves.
    pub fn join_room(&self, key: RoomKey, initial_presence: Option<Value>) -> RoomMembership {
        self.shared.update(|r| r.join_room(&key, initial_presence));
        RoomMembership {
            shared: Arc::downgrade(&self.shared),
            key,
            left: AtomicBool::new(false),
        }
    }

    /// Shallow-merge into this client's presence in a joined room.
    pub fn publish_presence(&self, key: &RoomKey, partial: Value) -> Result<(), ClientError> {
        self.shared.update(|r| r.publish_presence(key, partial))
    }

    /// Watch the presence of a room.
    pub fn subscribe_presence(
        &self,
        key: &RoomKey,
        opts: PresenceOpts,
        callback: impl Fn(&PresenceView) + Send + Sync + 'static,
    ) -> ListenerHandle<PresenceView> {
        let (slot, gate) = (CallbackSlot::new(callback), Gate::new());
        let listener = Listener::new(slot.clone(), gate.clone());
        let id = self.shared.update(|r| r.subscribe_presence(key, opts, listener));
        self.handle(ListenerKind::Presence(id), slot, gate)
    }

    /// Broadcast to the other members of a joined room. Fire-and-forget:
    /// messages published while offline are dropped.
    pub fn publish_topic(&self, key: &RoomKey, topic: &str, data: Value) -> Result<(), ClientError> {
        self.shared.update(|r| r.publish_topic(key, topic, data))
    }

    /// Receive messages other peers publish on `topic`.
    pub fn subscribe_topic(
        &self,
        key: &RoomKey,
        topic: &str,
        callback: impl Fn(&TopicMessage) + Send + Sync + 'static,
    ) -> ListenerHandle<TopicMessage> {
        let (slot, gate) = (CallbackSlot::new(callback), Gate::new());
        let listener = Listener::new(slot.clone(), gate.clone());
        let id = self.shared.update(|r| r.subscribe_topic(key, topic, listener));
        self.handle(ListenerKind::Topic(id), slot, gate)
    }

    // ===========================================
    // Streams
    // ===========================================

    /// Open an outbound byte stream.
    pub fn open_stream(&self, id: StreamId, meta: Value) -> Result<(), ClientError> {
        self.shared.update(|r| r.open_stream(id, meta))
    }

    /// Whether `len` more bytes fit in the stream's flow-control window.
    pub fn stream_can_send(&self, id: &StreamId, len: usize) -> bool {
        self.shared.reactor.lock().stream_can_send(id, len)
    }

    /// Send the next chunk. Fails when the window is exhausted; wait for
    /// acks (see [`Client::stream_can_send`]) and retry.
    pub fn write_stream(&self, id: &StreamId, bytes: &[u8], done: bool) -> Result<(), ClientError> {
        self.shared.update(|r| r.write_stream(id, bytes, done))
    }

    /// Abort a stream in either direction.
    pub fn abort_stream(&self, id: &StreamId, reason: &str) {
        self.shared.update(|r| r.abort_stream(id, reason));
    }

    /// Receive inbound stream events.
    pub fn subscribe_streams(
        &self,
        callback: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> ListenerHandle<StreamEvent> {
        let (slot, gate) = (CallbackSlot::new(callback), Gate::new());
        let listener = Listener::new(slot.clone(), gate.clone());
        let id = self.shared.update(|r| r.subscribe_streams(listener));
        self.handle(ListenerKind::Stream(id), slot, gate)
    }

    fn handle<T>(&self, kind: ListenerKind, slot: CallbackSlot<T>, gate: Arc<Gate>) -> ListenerHandle<T> {
        ListenerHandle {
            shared: Arc::downgrade(&self.shared),
            kind,
            slot,
            gate,
        }
    }
}

// ===========================================
// Handles
// ===========================================

#[derive(Debug, Clone)]
enum ListenerKind {
    Query(QueryHash, ListenerId),
    Presence(u64),
    Topic(u64),
    Status(u64),
    Stream(u64),
}

/// A registered callback.
///
/// Dropping the handle unsubscribes. After [`ListenerHandle::unsubscribe`]
/// returns nothing more is delivered, even for frames already in flight.
#[must_use = "dropping the handle unsubscribes"]
pub struct ListenerHandle<T> {
    shared: Weak<Shared>,
    kind: ListenerKind,
    slot: CallbackSlot<T>,
    gate: Arc<Gate>,
}

impl<T> fmt::Debug for ListenerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<T> ListenerHandle<T> {
    /// Swap the callback. Later deliveries reach the new one.
    pub fn set_callback(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        self.slot.set(callback);
    }

    /// Whether the listener still receives values.
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Stop delivery. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.gate.is_open() {
            return;
        }
        self.gate.close();
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match &self.kind {
            ListenerKind::Query(hash, id) => shared.update(|r| r.unsubscribe_query(hash, *id)),
            ListenerKind::Presence(id) => shared.update(|r| r.unsubscribe_presence(*id)),
            ListenerKind::Topic(id) => shared.update(|r| r.unsubscribe_topic(*id)),
            ListenerKind::Status(id) => shared.update(|r| r.unsubscribe_status(*id)),
            ListenerKind::Stream(id) => shared.update(|r| r.unsubscribe_streams(*id)),
        }
    }
}

impl<T> Drop for ListenerHandle<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum TxState {
    Waiting(oneshot::Receiver<Result<TxId, MutationError>>),
    Failed(Option<MutationError>),
}

/// Future of a transaction's outcome.
#[must_use = "a transaction outcome should be checked"]
pub struct TransactionHandle {
    id: Option<ClientEventId>,
    state: TxState,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl TransactionHandle {
    /// Correlation id of the mutation; `None` when validation failed.
    pub fn id(&self) -> Option<ClientEventId> {
        self.id
    }
}

impl Future for TransactionHandle {
    type Output = Result<TxId, MutationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            TxState::Waiting(wait) => Pin::new(wait)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or(Err(MutationError::Cancelled))),
            TxState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(MutationError::Cancelled)))
            }
        }
    }
}

/// A local join of a room. Dropping it leaves.
#[must_use = "dropping the membership leaves the room"]
pub struct RoomMembership {
    shared: Weak<Shared>,
    key: RoomKey,
    left: AtomicBool,
}

impl fmt::Debug for RoomMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomMembership")
            .field("room", &self.key)
            .field("left", &self.left.load(Ordering::Relaxed))
            .finish()
    }
}

impl RoomMembership {
    /// The room.
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Shallow-merge into this client's presence.
    pub fn publish_presence(&self, partial: Value) -> Result<(), ClientError> {
        let shared = self.shared.upgrade().ok_or(ClientError::Closed)?;
        shared.update(|r| r.publish_presence(&self.key, partial))
    }

    /// Publish on a topic of this room.
    pub fn publish_topic(&self, topic: &str, data: Value) -> Result<(), ClientError> {
        let shared = self.shared.upgrade().ok_or(ClientError::Closed)?;
        shared.update(|r| r.publish_topic(&self.key, topic, data))
    }

    /// Drop this join. Idempotent.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.update(|r| r.leave_room(&self.key));
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.leave();
    }
}

// ===========================================
// Infinite queries
// ===========================================

/// Accumulated rows of an infinite query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfiniteState {
    /// Rows of every loaded window, deduplicated by id.
    pub items: Vec<Value>,
    /// Whether [`InfiniteQuery::load_more`] can fetch another window.
    pub has_next_page: bool,
    /// True while any window is still loading.
    pub is_loading: bool,
    /// First error reported by a window.
    pub error: Option<QueryError>,
}

struct InfiniteInner {
    base: Value,
    namespace: String,
    pages: PageAccumulator,
    windows: Vec<ListenerHandle<QueryState>>,
    last: Vec<QueryState>,
}

impl InfiniteInner {
    fn state(&self) -> InfiniteState {
        let tail = self.last.last();
        InfiniteState {
            items: self.pages.items(),
            has_next_page: tail
                .and_then(|s| s.page_info.get(&self.namespace))
                .is_some_and(|p| p.has_next_page),
            is_loading: self.last.iter().any(|s| s.is_loading),
            error: self.last.iter().find_map(|s| s.error.clone()),
        }
    }

    fn end_cursor(&self) -> Option<String> {
        self.last
            .last()?
            .page_info
            .get(&self.namespace)?
            .end_cursor
            .clone()
    }
}

/// An infinitely scrolling query. Dropping it unsubscribes every window.
pub struct InfiniteQuery {
    client: Client,
    inner: Arc<Mutex<InfiniteInner>>,
    slot: CallbackSlot<InfiniteState>,
}

impl fmt::Debug for InfiniteQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQuery")
            .field("windows", &self.inner.lock().windows.len())
            .finish_non_exhaustive()
    }
}

impl InfiniteQuery {
    /// Current accumulated state.
    pub fn state(&self) -> InfiniteState {
        self.inner.lock().state()
    }

    /// Subscribe the window after the last `endCursor`. Returns false when
    /// there is no next page (or the last window has not loaded yet).
    pub fn load_more(&self) -> bool {
        let cursor = {
            let inner = self.inner.lock();
            let state = inner.state();
            if !state.has_next_page {
                return false;
            }
            inner.end_cursor()
        };
        match cursor {
            Some(cursor) => {
                self.open_window(Some(cursor));
                true
            }
            None => false,
        }
    }

    fn open_window(&self, after: Option<String>) {
        let (q, index) = {
            let mut inner = self.inner.lock();
            let q = window_query(&inner.base, &inner.namespace, after.as_deref());
            let index = inner.pages.push_window(Vec::new());
            inner.last.push(QueryState::loading());
            (q, index)
        };

        let weak = Arc::downgrade(&self.inner);
        let slot = self.slot.clone();
        let handle = self.client.subscribe_query(q, move |state: &QueryState| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let snapshot = {
                let mut inner = inner.lock();
                let rows = state
                    .data
                    .as_ref()
                    .and_then(|d| d.get(&inner.namespace))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                inner.pages.set_window(index, rows);
                if let Some(last) = inner.last.get_mut(index) {
                    *last = state.clone();
                }
                inner.state()
            };
            slot.call(&snapshot);
        });
        self.inner.lock().windows.push(handle);
    }
}

fn single_namespace(q: &Value) -> Option<String> {
    let map = q.as_object()?;
    let mut keys = map.keys().filter(|k| k.as_str() != "$");
    let first = keys.next()?;
    keys.next().is_none().then(|| first.clone())
}

fn window_query(base: &Value, namespace: &str, after: Option<&str>) -> Value {
    let mut q = base.clone();
    if let (Some(after), Some(node)) = (after, q.get_mut(namespace)) {
        if !node.is_object() {
            *node = json!({});
        }
        if let Some(node) = node.as_object_mut() {
            let opts = node.entry("$").or_insert_with(|| json!({}));
            if let Some(opts) = opts.as_object_mut() {
                opts.insert("after".into(), Value::String(after.to_string()));
            }
        }
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Infinite query helpers
    // ===========================================

    #[test]
    fn single_namespace_requires_exactly_one() {
        assert_eq!(single_namespace(&json!({"goals": {}})), Some("goals".into()));
        assert_eq!(single_namespace(&json!({"goals": {}, "todos": {}})), None);
        assert_eq!(single_namespace(&json!({})), None);
        assert_eq!(single_namespace(&json!([])), None);
    }

    #[test]
    fn window_query_sets_after() {
        let base = json!({"goals": {"$": {"first": 2, "order": {"title": "asc"}}}});
        assert_eq!(window_query(&base, "goals", None), base);

        let next = window_query(&base, "goals", Some("abc"));
        assert_eq!(next["goals"]["$"]["after"], json!("abc"));
        assert_eq!(next["goals"]["$"]["first"], json!(2));
    }

    #[test]
    fn transact_options_default_to_no_bypass() {
        assert!(!TransactOptions::default().cascade_bypass_permissions);
    }

    #[tokio::test]
    async fn failed_handle_resolves_immediately() {
        let handle = TransactionHandle {
            id: None,
            state: TxState::Failed(Some(MutationError::Cancelled)),
        };
        assert!(handle.id().is_none());
        assert_eq!(handle.await, Err(MutationError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_waiter_resolves_cancelled() {
        let (tx, rx) = oneshot::channel();
        let handle = TransactionHandle {
            id: Some(ClientEventId::new()),
            state: TxState::Waiting(rx),
        };
        drop(tx);
        assert_eq!(handle.await, Err(MutationError::Cancelled));
    }
}
