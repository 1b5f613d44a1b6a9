//! Query subscriptions.
//!
//! Identical queries share one [`Subscription`], keyed by the hash of the
//! query tree. Each subscription keeps the triples of the last server result
//! and the tx-id it reflects; the union of those results is the base store
//! the optimistic overlay is applied to.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tessel_sync_types::{AddQuery, ClientEventId, QueryHash, Triple, TxId};

use crate::error::QueryError;
use crate::pagination::PageInfo;
use crate::query::{evaluate, Query};
use crate::schema::Schema;
use crate::store::{ChangeSet, Store};

/// Identifies one listener of a subscription.
pub type ListenerId = u64;

/// Shape delivered to query listeners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// True until a server (or cached) result is available.
    pub is_loading: bool,
    /// Result tree, when available.
    pub data: Option<Value>,
    /// Why there is no result.
    pub error: Option<QueryError>,
    /// Page metadata per top-level namespace.
    pub page_info: BTreeMap<String, PageInfo>,
}

impl QueryState {
    /// The state before anything is known.
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }
}

/// A deduplicated query and its listeners.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// The query tree as submitted.
    pub q: Value,
    /// Compiled form, absent when compilation failed.
    pub query: Option<Query>,
    /// Namespaces the query reads.
    pub etypes: BTreeSet<String>,
    /// Triples of the last accepted server result.
    pub server_triples: Option<Vec<Triple>>,
    /// Highest server transaction reflected in `server_triples`.
    pub processed_tx_id: TxId,
    /// Last error.
    pub error: Option<QueryError>,
    /// `add-query` written on the current connection.
    pub sent: bool,
    listeners: BTreeSet<ListenerId>,
}

impl Subscription {
    fn new(q: Value, schema: &Schema) -> Self {
        let mut sub = Self {
            q,
            query: None,
            etypes: BTreeSet::new(),
            server_triples: None,
            processed_tx_id: TxId::ZERO,
            error: None,
            sent: false,
            listeners: BTreeSet::new(),
        };
        sub.compile(schema);
        sub
    }

    fn compile(&mut self, schema: &Schema) {
        match Query::compile(&self.q, schema) {
            Ok(query) => {
                self.etypes = query.etypes();
                self.query = Some(query);
                if matches!(self.error, Some(QueryError::Schema(_))) {
                    self.error = None;
                }
            }
            Err(e) => {
                self.query = None;
                self.error = Some(QueryError::Schema(e));
            }
        }
    }

    /// Listener ids.
    pub fn listeners(&self) -> impl Iterator<Item = ListenerId> + '_ {
        self.listeners.iter().copied()
    }

    /// Whether the server has answered (or a cached answer was restored).
    pub fn is_loaded(&self) -> bool {
        self.server_triples.is_some()
    }

    /// Evaluate against a snapshot.
    pub fn state(&self, store: &Store) -> QueryState {
        if let Some(error) = &self.error {
            return QueryState {
                is_loading: false,
                data: None,
                error: Some(error.clone()),
                page_info: BTreeMap::new(),
            };
        }
        match (&self.query, self.is_loaded()) {
            (Some(query), true) => {
                let result = evaluate(query, store);
                QueryState {
                    is_loading: false,
                    data: Some(result.data),
                    error: None,
                    page_info: result.page_info,
                }
            }
            _ => QueryState::loading(),
        }
    }

    /// The `add-query` frame.
    pub fn add_query_frame(&self) -> AddQuery {
        AddQuery {
            q: self.q.clone(),
            client_event_id: ClientEventId::new(),
        }
    }
}

/// Result of [`SubscriptionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribed {
    /// Query hash.
    pub hash: QueryHash,
    /// The new listener.
    pub listener: ListenerId,
    /// This listener created the subscription.
    pub created: bool,
}

/// All active subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    subs: HashMap<QueryHash, Subscription>,
    next_listener: ListenerId,
}

impl SubscriptionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `q`, creating the subscription if needed.
    pub fn subscribe(&mut self, q: Value, schema: &Schema) -> Subscribed {
        let hash = QueryHash::of(&q);
        self.next_listener += 1;
        let listener = self.next_listener;

        let created = !self.subs.contains_key(&hash);
        let sub = self
            .subs
            .entry(hash.clone())
            .or_insert_with(|| Subscription::new(q, schema));
        sub.listeners.insert(listener);
        Subscribed {
            hash,
            listener,
            created,
        }
    }

    /// Remove a listener. Returns the subscription when it was the last one.
    /// Idempotent.
    pub fn unsubscribe(&mut self, hash: &QueryHash, listener: ListenerId) -> Option<Subscription> {
        let sub = self.subs.get_mut(hash)?;
        if !sub.listeners.remove(&listener) || !sub.listeners.is_empty() {
            return None;
        }
        self.subs.remove(hash)
    }

    /// Seed a new subscription with a cached result.
    pub fn restore(&mut self, hash: &QueryHash, triples: Vec<Triple>, tx: TxId) {
        if let Some(sub) = self.subs.get_mut(hash) {
            if sub.server_triples.is_none() {
                sub.server_triples = Some(triples);
                sub.processed_tx_id = tx;
            }
        }
    }

    /// Accept a server result. Results older than (or equal to) the one
    /// already held are ignored so updates never regress.
    pub fn on_result(&mut self, hash: &QueryHash, triples: Vec<Triple>, tx: TxId) -> bool {
        let Some(sub) = self.subs.get_mut(hash) else {
            return false;
        };
        if sub.server_triples.is_some() && tx <= sub.processed_tx_id {
            return false;
        }
        sub.server_triples = Some(triples);
        sub.processed_tx_id = tx;
        if matches!(sub.error, Some(QueryError::Server { .. })) {
            sub.error = None;
        }
        true
    }

    /// Record a server-side query error.
    pub fn on_error(&mut self, hash: &QueryHash, error: QueryError) -> bool {
        match self.subs.get_mut(hash) {
            Some(sub) => {
                sub.error = Some(error);
                true
            }
            None => false,
        }
    }

    /// Recompile every query after a schema change.
    pub fn recompile(&mut self, schema: &Schema) {
        for sub in self.subs.values_mut() {
            sub.compile(schema);
        }
    }

    /// Hashes whose result may have changed.
    pub fn affected(&self, changes: &ChangeSet) -> Vec<QueryHash> {
        let mut out: Vec<QueryHash> = self
            .subs
            .iter()
            .filter(|(_, s)| changes.touches(&s.etypes))
            .map(|(h, _)| h.clone())
            .collect();
        out.sort();
        out
    }

    /// Lowest processed tx-id among loaded subscriptions; `None` when no
    /// subscription has a result.
    pub fn min_processed_tx_id(&self) -> Option<TxId> {
        self.subs
            .values()
            .filter(|s| s.is_loaded())
            .map(|s| s.processed_tx_id)
            .min()
    }

    /// Union of all server results, oldest first so newer results win.
    pub fn base_triples(&self) -> Vec<&Triple> {
        let mut loaded: Vec<&Subscription> = self.subs.values().filter(|s| s.is_loaded()).collect();
        loaded.sort_by_key(|s| s.processed_tx_id);
        loaded
            .into_iter()
            .flat_map(|s| s.server_triples.iter().flatten())
            .collect()
    }

    /// Subscriptions that still need an `add-query` on this connection.
    pub fn unsent(&self) -> Vec<QueryHash> {
        let mut out: Vec<QueryHash> = self
            .subs
            .iter()
            .filter(|(_, s)| !s.sent && s.query.is_some())
            .map(|(h, _)| h.clone())
            .collect();
        out.sort();
        out
    }

    /// Record that `add-query` was written.
    pub fn mark_sent(&mut self, hash: &QueryHash) {
        if let Some(sub) = self.subs.get_mut(hash) {
            sub.sent = true;
        }
    }

    /// The connection dropped.
    pub fn mark_all_unsent(&mut self) {
        for sub in self.subs.values_mut() {
            sub.sent = false;
        }
    }

    /// Look up a subscription.
    pub fn get(&self, hash: &QueryHash) -> Option<&Subscription> {
        self.subs.get(hash)
    }

    /// All hashes.
    pub fn hashes(&self) -> Vec<QueryHash> {
        self.subs.keys().cloned().collect()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// True when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
