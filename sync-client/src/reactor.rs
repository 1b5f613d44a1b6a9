//! The single-writer reactor.
//!
//! Every state change of a client (optimistic applies, server deltas, room
//! traffic, connection transitions) runs against one [`ReactorState`] under
//! one lock. Handlers never perform I/O directly: outbound frames go to the
//! connection's writer channel, durable writes to the persistence channel,
//! and listener callbacks are queued as notifications for delivery after
//! the lock is released.
//!
//! The optimistic snapshot is always `base ⊕ overlay`:
//! - base: the union of every subscription's last server result
//! - overlay: the mutation log, applied in enqueue order
//!
//! A query whose server result already covers a confirmed mutation's tx-id
//! is evaluated without that mutation, so newer server data wins over the
//! stale local write.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tessel_sync_core::queue::DEFAULT_QUEUE_CAPACITY;
use tessel_sync_core::state::Action;
use tessel_sync_core::{
    compile, CachedQuery, CallbackSlot, ConnectionState, ConnectionStatus, Event, JoinOutcome,
    ListenerId, Mutation, MutationError, MutationQueue, PresenceOpts, PresenceView, QueryCache,
    QueryError, QueryState, RejectionKind, RoomHub, Schema, Store, Subscription,
    SubscriptionManager, TxChunk, TxOptions,
};
use tessel_sync_types::{
    AddQueryOk, Attribute, ClientBroadcast, ClientEventId, ErrorFrame, ErrorKind, Frame, Heartbeat,
    Init, InitOk, PeerId, QueryHash, RefreshOk, RemoveQuery, RoomKey, ServerBroadcast, StreamId,
    Triple, TxId, PROTOCOL_VERSION,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::notify::{Delivery, Gate, Notification};
use crate::storage::{PersistOp, Snapshot};
use crate::streams::{StreamEvent, StreamReply, StreamTable};
use crate::TopicMessage;

/// Resolves a transaction future.
pub(crate) type Waiter = oneshot::Sender<Result<TxId, MutationError>>;

/// A registered callback and its delivery gate.
pub(crate) struct Listener<T> {
    pub(crate) slot: CallbackSlot<T>,
    pub(crate) gate: Arc<Gate>,
}

impl<T> Listener<T> {
    pub(crate) fn new(slot: CallbackSlot<T>, gate: Arc<Gate>) -> Self {
        Self { slot, gate }
    }

    fn delivery(&self, version: u64, value: T) -> Delivery<T> {
        Delivery {
            slot: self.slot.clone(),
            gate: self.gate.clone(),
            version,
            value,
        }
    }
}

struct PresenceListener {
    key: RoomKey,
    opts: PresenceOpts,
    last: Option<PresenceView>,
    listener: Listener<PresenceView>,
}

struct TopicListener {
    key: RoomKey,
    topic: String,
    listener: Listener<TopicMessage>,
}

pub(crate) struct ReactorState {
    app_id: String,
    device_name: String,
    refresh_token: Option<String>,
    strict_schema: bool,

    conn: ConnectionState,
    outbox: Option<mpsc::UnboundedSender<Frame>>,
    persist: Option<mpsc::UnboundedSender<PersistOp>>,

    server_schema: Schema,
    base: Store,
    snapshot: Store,
    subs: SubscriptionManager,
    cache: QueryCache,
    queue: MutationQueue,
    waiters: HashMap<ClientEventId, Waiter>,
    query_events: HashMap<ClientEventId, QueryHash>,
    results: HashMap<QueryHash, QueryState>,
    query_listeners: HashMap<ListenerId, Listener<QueryState>>,

    rooms: RoomHub,
    presence_listeners: HashMap<u64, PresenceListener>,
    topic_listeners: HashMap<u64, TopicListener>,
    status_listeners: HashMap<u64, Listener<ConnectionStatus>>,
    stream_listeners: HashMap<u64, Listener<StreamEvent>>,
    streams: StreamTable,

    next_listener: u64,
    version: u64,
    pending: Vec<Notification>,
}

impl ReactorState {
    /// Build the reactor from persisted state. Restored mutations are
    /// applied optimistically right away and replayed on connect.
    pub(crate) fn new(config: &ClientConfig, restored: Snapshot) -> Self {
        let server_schema = restored
            .schema
            .map(Schema::from_attrs)
            .unwrap_or_default();

        let mut cache = QueryCache::new(config.query_cache_limit);
        for entry in restored.queries {
            cache.put(QueryHash::of(&entry.q), entry);
        }

        if !restored.mutations.is_empty() {
            info!(
                app_id = %config.app_id,
                count = restored.mutations.len(),
                "restored pending mutations"
            );
        }
        let queue = MutationQueue::restore(DEFAULT_QUEUE_CAPACITY, restored.mutations);
        let base = Store::new(server_schema.clone());
        let snapshot = queue.optimistic(&base);

        Self {
            app_id: config.app_id.clone(),
            device_name: config.device_name.clone(),
            refresh_token: config.refresh_token.clone(),
            strict_schema: config.strict_schema,
            conn: ConnectionState::new(),
            outbox: None,
            persist: None,
            server_schema,
            base,
            snapshot,
            subs: SubscriptionManager::new(),
            cache,
            queue,
            waiters: HashMap::new(),
            query_events: HashMap::new(),
            results: HashMap::new(),
            query_listeners: HashMap::new(),
            rooms: RoomHub::new(PeerId::new()),
            presence_listeners: HashMap::new(),
            topic_listeners: HashMap::new(),
            status_listeners: HashMap::new(),
            stream_listeners: HashMap::new(),
            streams: StreamTable::new(config.stream_window),
            next_listener: 0,
            version: 0,
            pending: Vec::new(),
        }
    }

    /// Notifications queued since the last call.
    pub(crate) fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn set_persistence(&mut self, tx: mpsc::UnboundedSender<PersistOp>) {
        self.persist = Some(tx);
    }

    pub(crate) fn flush_persistence(&self) -> Option<oneshot::Receiver<()>> {
        let tx = self.persist.as_ref()?;
        let (done, wait) = oneshot::channel();
        tx.send(PersistOp::Flush(done)).ok()?;
        Some(wait)
    }

    pub(crate) fn snapshot(&self) -> &Store {
        &self.snapshot
    }

    pub(crate) fn peer_id(&self) -> PeerId {
        self.rooms.self_peer()
    }

    pub(crate) fn pending_mutations(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn set_refresh_token(&mut self, token: Option<String>) {
        self.refresh_token = token;
    }

    fn next_listener_id(&mut self) -> u64 {
        self.next_listener += 1;
        self.next_listener
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn persist(&self, op: PersistOp) {
        if let Some(tx) = &self.persist {
            if let Err(e) = tx.send(op) {
                warn!(
                    app_id = %self.app_id,
                    op = e.0.name(),
                    "persistence writer stopped; write dropped"
                );
            }
        }
    }

    fn send(&self, frame: Frame) -> bool {
        self.outbox
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    fn is_live(&self) -> bool {
        self.conn.is_connected()
    }

    // ===========================================
    // Connection lifecycle
    // ===========================================

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Whether the current transport session should keep reading.
    pub(crate) fn session_alive(&self) -> bool {
        matches!(
            self.conn,
            ConnectionState::Authenticating { .. } | ConnectionState::Connected { .. }
        )
    }

    /// Attach the writer channel of a freshly opened transport.
    pub(crate) fn install_outbox(&mut self, tx: mpsc::UnboundedSender<Frame>) {
        self.outbox = Some(tx);
    }

    /// Feed the connection state machine. Protocol actions are carried out
    /// here; transport actions are returned to the driver.
    pub(crate) fn on_conn_event(&mut self, event: Event) -> Vec<Action> {
        let (next, actions) = std::mem::take(&mut self.conn).on_event(event);
        self.conn = next;

        let mut io = Vec::new();
        for action in actions {
            match action {
                Action::SendInit => self.send_init(),
                Action::Replay => self.replay(),
                Action::EmitStatus(status) => self.emit_status(status),
                other => io.push(other),
            }
        }
        if !self.session_alive() && self.outbox.is_some() {
            self.reset_connection();
        }
        io
    }

    pub(crate) fn send_ping(&self, at: u64) {
        self.send(Frame::Ping(Heartbeat { at }));
    }

    fn send_init(&mut self) {
        let schema_hash = (!self.server_schema.is_empty()).then(|| self.server_schema.fingerprint());
        self.send(Frame::Init(Init {
            protocol_version: PROTOCOL_VERSION,
            app_id: self.app_id.clone(),
            refresh_token: self.refresh_token.clone(),
            device_name: self.device_name.clone(),
            schema_hash,
        }));
    }

    /// Queries first, then the mutation log in order, then room joins.
    fn replay(&mut self) {
        let hashes = self.subs.unsent();
        for hash in &hashes {
            self.send_add_query(hash);
        }

        let frames: Vec<_> = self.queue.unsent().map(Mutation::to_frame).collect();
        let mutations = frames.len();
        for frame in frames {
            let id = frame.client_event_id;
            if self.send(Frame::Transact(frame)) {
                self.queue.mark_sent(&id);
            }
        }

        let joins = self.rooms.active_rooms();
        let rooms = joins.len();
        for join in joins {
            self.send(Frame::JoinRoom(join));
        }

        info!(
            app_id = %self.app_id,
            queries = hashes.len(),
            mutations,
            rooms,
            "replayed state after connect"
        );
    }

    fn reset_connection(&mut self) {
        self.outbox = None;
        self.subs.mark_all_unsent();
        self.queue.mark_all_unsent();
        self.query_events.clear();
        for key in self.rooms.reset_connection() {
            self.notify_presence(&key);
        }
        for event in self.streams.reset("connection lost") {
            self.emit_stream(event);
        }
    }

    fn emit_status(&mut self, status: ConnectionStatus) {
        match &status {
            ConnectionStatus::Errored { error, retrying } => {
                warn!(app_id = %self.app_id, error = %error, retrying, "connection errored")
            }
            other => info!(app_id = %self.app_id, status = ?other, "connection status"),
        }
        let version = self.next_version();
        for listener in self.status_listeners.values() {
            self.pending
                .push(Notification::Status(listener.delivery(version, status.clone())));
        }
    }

    pub(crate) fn subscribe_status(&mut self, listener: Listener<ConnectionStatus>) -> u64 {
        let id = self.next_listener_id();
        let version = self.next_version();
        self.pending
            .push(Notification::Status(listener.delivery(version, self.conn.status())));
        self.status_listeners.insert(id, listener);
        id
    }

    pub(crate) fn unsubscribe_status(&mut self, id: u64) {
        if let Some(listener) = self.status_listeners.remove(&id) {
            listener.gate.close();
        }
    }

    /// Reject every outstanding transaction future. Mutations stay in the
    /// durable log for the next start.
    pub(crate) fn cancel_waiters(&mut self) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(MutationError::Cancelled));
        }
    }

    // ===========================================
    // Inbound frames
    // ===========================================

    /// Handle one server frame. Returns transport actions when the frame
    /// ended the session (e.g. an auth failure).
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Vec<Action> {
        match frame {
            Frame::InitOk(ok) => return self.on_init_ok(ok),
            Frame::Error(err) => return self.on_error(err),
            Frame::AddQueryOk(ok) => self.on_add_query_ok(ok),
            Frame::RefreshOk(refresh) => self.on_refresh(refresh),
            Frame::TransactOk(ok) => self.on_transact_ok(ok.client_event_id, ok.tx_id),
            Frame::JoinRoomOk(r) => {
                if self.rooms.on_join_ok(&r.room) {
                    self.notify_presence(&r.room);
                }
            }
            Frame::RefreshPresence(p) => {
                if self.rooms.on_refresh_presence(&p.room, p.data) {
                    self.notify_presence(&p.room);
                }
            }
            Frame::ServerBroadcast(b) => self.on_broadcast(b),
            Frame::Ping(hb) => {
                self.send(Frame::Pong(hb));
            }
            Frame::Pong(_) => {}
            Frame::StreamOpen(open) => {
                let reply = self.streams.on_open(open);
                self.apply_stream_reply(reply);
            }
            Frame::StreamData(data) => {
                let reply = self.streams.on_data(&data);
                self.apply_stream_reply(reply);
            }
            Frame::StreamAck(ack) => self.streams.on_ack(&ack),
            Frame::StreamAbort(abort) => {
                if let Some(event) = self.streams.on_abort(abort) {
                    self.emit_stream(event);
                }
            }
            other => debug!(op = other.op(), "ignoring unexpected client-bound frame"),
        }
        Vec::new()
    }

    fn on_init_ok(&mut self, ok: InitOk) -> Vec<Action> {
        debug!(session = %ok.session_id, attrs = ok.attrs.len(), "init accepted");
        self.set_server_schema(ok.attrs);
        self.rebuild();
        self.notify_queries(None);
        self.on_conn_event(Event::InitOk {
            session_id: ok.session_id,
        })
    }

    fn set_server_schema(&mut self, attrs: Vec<Attribute>) {
        self.persist(PersistOp::SaveSchema(attrs.clone()));
        self.server_schema = Schema::from_attrs(attrs);
    }

    fn on_add_query_ok(&mut self, ok: AddQueryOk) {
        let hash = self
            .query_events
            .remove(&ok.client_event_id)
            .unwrap_or(ok.hash);
        if self.accept_result(&hash, ok.triples, ok.processed_tx_id) {
            self.rebuild();
            self.notify_queries(None);
        }
    }

    fn on_refresh(&mut self, refresh: RefreshOk) {
        let mut changed = false;
        if let Some(attrs) = refresh.attrs {
            self.set_server_schema(attrs);
            changed = true;
        }
        for computation in refresh.computations {
            changed |= self.accept_result(
                &computation.hash,
                computation.triples,
                refresh.processed_tx_id,
            );
        }
        if changed {
            self.rebuild();
            self.notify_queries(None);
        }
    }

    /// Store a server result and cache it. Stale results are ignored.
    fn accept_result(&mut self, hash: &QueryHash, triples: Vec<Triple>, tx: TxId) -> bool {
        if !self.subs.on_result(hash, triples.clone(), tx) {
            debug!(query = ?hash, tx = %tx, "ignoring stale or unknown query result");
            return false;
        }
        let Some(q) = self.subs.get(hash).map(|s| s.q.clone()) else {
            return false;
        };
        let entry = CachedQuery {
            q,
            triples,
            processed_tx_id: tx,
        };
        self.persist(PersistOp::PutQuery(hash.clone(), entry.clone()));
        self.cache.put(hash.clone(), entry);
        self.evict_cache();
        true
    }

    fn evict_cache(&mut self) {
        let active: HashSet<QueryHash> = self.subs.hashes().into_iter().collect();
        let evicted = self.cache.evict(&active);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted cached query results");
            self.persist(PersistOp::DeleteQueries(evicted));
        }
    }

    fn on_transact_ok(&mut self, id: ClientEventId, tx_id: TxId) {
        if !self.queue.ack(&id, tx_id) {
            debug!(mutation = %id, "ack for unknown mutation");
            return;
        }
        debug!(mutation = %id, tx = %tx_id, "mutation confirmed");
        self.persist(PersistOp::DeleteMutation(id));
        if let Some(waiter) = self.waiters.remove(&id) {
            let _ = waiter.send(Ok(tx_id));
        }
        self.rebuild();
        self.notify_queries(None);
    }

    fn on_error(&mut self, err: ErrorFrame) -> Vec<Action> {
        if let Some(id) = err.client_event_id {
            if self.queue.get(&id).is_some() {
                self.reject_mutation(id, err.kind, err.message);
                return Vec::new();
            }
            if let Some(hash) = self.query_events.remove(&id) {
                self.fail_query(&hash, err.kind, err.message);
                return Vec::new();
            }
        }
        if let Some(hash) = err.hash.as_ref().filter(|h| self.subs.get(h).is_some()) {
            let hash = hash.clone();
            self.fail_query(&hash, err.kind, err.message);
            return Vec::new();
        }

        let during_handshake = matches!(self.conn, ConnectionState::Authenticating { .. });
        if during_handshake
            || err.kind == ErrorKind::Unauthorized
            || err.original_op.as_deref() == Some("init")
        {
            warn!(status = err.status, message = %err.message, "server refused the session");
            return self.on_conn_event(Event::AuthFailed { error: err.message });
        }

        warn!(
            status = err.status,
            kind = ?err.kind,
            op = err.original_op.as_deref().unwrap_or("?"),
            message = %err.message,
            "unhandled server error"
        );
        Vec::new()
    }

    fn reject_mutation(&mut self, id: ClientEventId, kind: ErrorKind, message: String) {
        if self.queue.reject(&id).is_none() {
            return;
        }
        warn!(mutation = %id, kind = ?kind, message = %message, "mutation rejected, rolling back");
        self.persist(PersistOp::DeleteMutation(id));
        if let Some(waiter) = self.waiters.remove(&id) {
            let _ = waiter.send(Err(MutationError::Rejected {
                kind: RejectionKind::from(kind),
                message,
            }));
        }
        self.rebuild();
        self.notify_queries(None);
    }

    fn fail_query(&mut self, hash: &QueryHash, kind: ErrorKind, message: String) {
        debug!(query = ?hash, message = %message, "query failed on the server");
        let error = QueryError::Server {
            kind: RejectionKind::from(kind),
            message,
        };
        if self.subs.on_error(hash, error) {
            self.notify_queries(Some(vec![hash.clone()]));
        }
    }

    // ===========================================
    // Snapshot maintenance
    // ===========================================

    /// Recompute `base ⊕ overlay` after the base or the log changed.
    fn rebuild(&mut self) {
        self.base = Store::from_triples(self.server_schema.clone(), self.subs.base_triples());

        // Without loaded queries nothing can show a confirmed mutation.
        let through = self
            .subs
            .min_processed_tx_id()
            .unwrap_or(TxId::new(u64::MAX));
        let pruned = self.queue.prune_confirmed(through);
        if !pruned.is_empty() {
            debug!(count = pruned.len(), through = %through, "pruned confirmed mutations");
        }

        let previous = self.snapshot.schema().clone();
        self.snapshot = self.queue.optimistic(&self.base);
        if *self.snapshot.schema() != previous {
            self.subs.recompile(self.snapshot.schema());
        }
    }

    /// Re-evaluate queries (all, or `only`) and notify listeners of those
    /// whose state changed.
    fn notify_queries(&mut self, only: Option<Vec<QueryHash>>) {
        let hashes = only.unwrap_or_else(|| self.subs.hashes());
        let mut as_of = BTreeMap::new();
        for hash in hashes {
            let Some(sub) = self.subs.get(&hash) else {
                continue;
            };
            let state = evaluate(sub, &self.queue, &self.base, &self.snapshot, &mut as_of);
            if self.results.get(&hash) == Some(&state) {
                continue;
            }
            self.version += 1;
            let version = self.version;
            for id in sub.listeners() {
                if let Some(listener) = self.query_listeners.get(&id) {
                    self.pending
                        .push(Notification::Query(listener.delivery(version, state.clone())));
                }
            }
            self.results.insert(hash, state);
        }
    }

    // ===========================================
    // Queries
    // ===========================================

    /// Register a query listener and queue its initial value.
    pub(crate) fn subscribe_query(
        &mut self,
        q: Value,
        listener: Listener<QueryState>,
    ) -> (QueryHash, ListenerId) {
        let schema = self.snapshot.schema().clone();
        let subscribed = self.subs.subscribe(q, &schema);
        let hash = subscribed.hash.clone();

        if subscribed.created {
            if let Some(cached) = self.cache.get(&hash).cloned() {
                debug!(query = ?hash, tx = %cached.processed_tx_id, "serving cached result");
                self.subs
                    .restore(&hash, cached.triples, cached.processed_tx_id);
                self.rebuild();
                self.notify_queries(None);
            }
            if self.is_live() {
                self.send_add_query(&hash);
            }
        }

        let state = self
            .subs
            .get(&hash)
            .map(|s| evaluate(s, &self.queue, &self.base, &self.snapshot, &mut BTreeMap::new()))
            .unwrap_or_else(QueryState::loading);
        self.results.entry(hash.clone()).or_insert_with(|| state.clone());
        let version = self.next_version();
        self.pending
            .push(Notification::Query(listener.delivery(version, state)));
        self.query_listeners.insert(subscribed.listener, listener);
        (hash, subscribed.listener)
    }

    /// Drop a query listener. Idempotent.
    pub(crate) fn unsubscribe_query(&mut self, hash: &QueryHash, id: ListenerId) {
        if let Some(listener) = self.query_listeners.remove(&id) {
            listener.gate.close();
        }
        let Some(sub) = self.subs.unsubscribe(hash, id) else {
            return;
        };
        self.results.remove(hash);
        self.query_events.retain(|_, h| h != hash);
        if sub.sent && self.is_live() {
            self.send(Frame::RemoveQuery(RemoveQuery { hash: hash.clone() }));
        }
        self.evict_cache();
        self.rebuild();
        self.notify_queries(None);
    }

    fn send_add_query(&mut self, hash: &QueryHash) {
        let Some(frame) = self.subs.get(hash).map(|s| s.add_query_frame()) else {
            return;
        };
        let id = frame.client_event_id;
        if self.send(Frame::AddQuery(frame)) {
            self.query_events.insert(id, hash.clone());
            self.subs.mark_sent(hash);
        }
    }

    // ===========================================
    // Transactions
    // ===========================================

    /// Validate, apply optimistically, log durably and send if connected.
    pub(crate) fn transact(
        &mut self,
        chunks: &[TxChunk],
        cascade_bypass_permissions: bool,
    ) -> Result<(ClientEventId, oneshot::Receiver<Result<TxId, MutationError>>), MutationError>
    {
        let compiled = compile(
            chunks,
            &self.snapshot,
            TxOptions {
                strict_schema: self.strict_schema,
            },
        )?;
        let mutation = Mutation::new(compiled.steps, now_millis())
            .with_cascade_bypass(cascade_bypass_permissions)
            .with_rule_params(compiled.rule_params);
        let id = mutation.id;

        self.queue.enqueue(mutation.clone())?;
        self.persist(PersistOp::PutMutation(mutation.clone()));
        let (waiter, wait) = oneshot::channel();
        self.waiters.insert(id, waiter);

        let (next, changes) = self
            .snapshot
            .apply_with_changes(&mutation.steps, mutation.created_at);
        self.snapshot = next;
        if changes.schema_changed {
            self.subs.recompile(self.snapshot.schema());
        }
        let affected = self.subs.affected(&changes);
        self.notify_queries(Some(affected));

        if self.is_live() && self.send(Frame::Transact(mutation.to_frame())) {
            self.queue.mark_sent(&id);
        }
        debug!(mutation = %id, steps = mutation.steps.len(), "mutation enqueued");
        Ok((id, wait))
    }

    // ===========================================
    // Rooms, presence and topics
    // ===========================================

    pub(crate) fn join_room(&mut self, key: &RoomKey, initial: Option<Value>) {
        if let JoinOutcome::FirstJoin(frame) = self.rooms.join(key, initial) {
            debug!(room = %key, "joining room");
            if self.is_live() {
                self.send(Frame::JoinRoom(frame));
            }
        }
        self.notify_presence(key);
    }

    pub(crate) fn leave_room(&mut self, key: &RoomKey) {
        if let Some(frame) = self.rooms.leave(key) {
            debug!(room = %key, "left room");
            if self.is_live() {
                self.send(Frame::LeaveRoom(frame));
            }
        }
    }

    pub(crate) fn publish_presence(&mut self, key: &RoomKey, partial: Value) -> Result<(), ClientError> {
        let frame = self
            .rooms
            .publish_presence(key, partial)
            .ok_or_else(|| ClientError::RoomNotJoined(key.to_string()))?;
        if self.is_live() {
            self.send(Frame::SetPresence(frame));
        }
        self.notify_presence(key);
        Ok(())
    }

    pub(crate) fn subscribe_presence(
        &mut self,
        key: &RoomKey,
        opts: PresenceOpts,
        listener: Listener<PresenceView>,
    ) -> u64 {
        let id = self.next_listener_id();
        self.presence_listeners.insert(
            id,
            PresenceListener {
                key: key.clone(),
                opts,
                last: None,
                listener,
            },
        );
        self.notify_presence(key);
        id
    }

    pub(crate) fn unsubscribe_presence(&mut self, id: u64) {
        if let Some(p) = self.presence_listeners.remove(&id) {
            p.listener.gate.close();
        }
    }

    fn notify_presence(&mut self, key: &RoomKey) {
        for p in self.presence_listeners.values_mut() {
            if p.key != *key {
                continue;
            }
            let view = self.rooms.presence(key, &p.opts).unwrap_or_else(|| PresenceView {
                is_loading: true,
                ..PresenceView::default()
            });
            if p.last.as_ref() == Some(&view) {
                continue;
            }
            p.last = Some(view.clone());
            self.version += 1;
            self.pending
                .push(Notification::Presence(p.listener.delivery(self.version, view)));
        }
    }

    pub(crate) fn publish_topic(
        &mut self,
        key: &RoomKey,
        topic: &str,
        data: Value,
    ) -> Result<(), ClientError> {
        if !self.rooms.is_joined(key) {
            return Err(ClientError::RoomNotJoined(key.to_string()));
        }
        let frame = Frame::ClientBroadcast(ClientBroadcast {
            room: key.clone(),
            topic: topic.to_string(),
            data,
        });
        if !(self.is_live() && self.send(frame)) {
            debug!(room = %key, topic, "dropping topic message while offline");
        }
        Ok(())
    }

    pub(crate) fn subscribe_topic(
        &mut self,
        key: &RoomKey,
        topic: &str,
        listener: Listener<TopicMessage>,
    ) -> u64 {
        let id = self.next_listener_id();
        self.topic_listeners.insert(
            id,
            TopicListener {
                key: key.clone(),
                topic: topic.to_string(),
                listener,
            },
        );
        id
    }

    pub(crate) fn unsubscribe_topic(&mut self, id: u64) {
        if let Some(t) = self.topic_listeners.remove(&id) {
            t.listener.gate.close();
        }
    }

    fn on_broadcast(&mut self, b: ServerBroadcast) {
        if !self.rooms.accepts_broadcast(&b.room, &b.peer_id) {
            return;
        }
        let message = TopicMessage {
            room: b.room,
            topic: b.topic,
            peer_id: b.peer_id,
            data: b.data,
        };
        let mut delivered = false;
        for t in self.topic_listeners.values() {
            if t.key == message.room && t.topic == message.topic {
                self.pending
                    .push(Notification::Topic(t.listener.delivery(0, message.clone())));
                delivered = true;
            }
        }
        if !delivered {
            debug!(room = %message.room, topic = %message.topic, "no handler for topic message");
        }
    }

    // ===========================================
    // Streams
    // ===========================================

    pub(crate) fn open_stream(&mut self, id: StreamId, meta: Value) -> Result<(), ClientError> {
        if !self.is_live() {
            return Err(ClientError::Connection("streams need a live connection".into()));
        }
        let open = self.streams.open(id, meta)?;
        self.send(Frame::StreamOpen(open));
        Ok(())
    }

    pub(crate) fn write_stream(
        &mut self,
        id: &StreamId,
        bytes: &[u8],
        done: bool,
    ) -> Result<(), ClientError> {
        if !self.is_live() {
            return Err(ClientError::Connection("streams need a live connection".into()));
        }
        let data = self.streams.write(id, bytes, done)?;
        self.send(Frame::StreamData(data));
        Ok(())
    }

    pub(crate) fn stream_can_send(&self, id: &StreamId, len: usize) -> bool {
        self.streams.can_send(id, len)
    }

    pub(crate) fn abort_stream(&mut self, id: &StreamId, reason: &str) {
        if let Some(frame) = self.streams.abort(id, reason) {
            if self.is_live() {
                self.send(Frame::StreamAbort(frame));
            }
        }
    }

    pub(crate) fn subscribe_streams(&mut self, listener: Listener<StreamEvent>) -> u64 {
        let id = self.next_listener_id();
        self.stream_listeners.insert(id, listener);
        id
    }

    pub(crate) fn unsubscribe_streams(&mut self, id: u64) {
        if let Some(listener) = self.stream_listeners.remove(&id) {
            listener.gate.close();
        }
    }

    fn apply_stream_reply(&mut self, reply: StreamReply) {
        if let Some(ack) = reply.ack {
            self.send(Frame::StreamAck(ack));
        }
        if let Some(abort) = reply.abort {
            warn!(stream = %abort.client_id, reason = %abort.reason, "aborting inbound stream");
            self.send(Frame::StreamAbort(abort));
        }
        if let Some(event) = reply.event {
            self.emit_stream(event);
        }
    }

    fn emit_stream(&mut self, event: StreamEvent) {
        for listener in self.stream_listeners.values() {
            self.pending
                .push(Notification::Stream(listener.delivery(0, event.clone())));
        }
    }
}

/// A query's state against the optimistic snapshot, minus confirmed
/// mutations its server result already reflects. `as_of` caches those
/// per-tx snapshots across one evaluation pass.
fn evaluate(
    sub: &Subscription,
    queue: &MutationQueue,
    base: &Store,
    snapshot: &Store,
    as_of: &mut BTreeMap<TxId, Store>,
) -> QueryState {
    let processed = sub.processed_tx_id;
    if !sub.is_loaded() || !queue.has_confirmed_through(processed) {
        return sub.state(snapshot);
    }
    let store = as_of
        .entry(processed)
        .or_insert_with(|| queue.optimistic_as_of(base, processed));
    sub.state(store)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
