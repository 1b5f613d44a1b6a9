//! Shared helpers for the client integration tests.
//!
//! Every test drives a real [`Client`] against a [`MockTransport`] that
//! plays the server: it answers `init`, and the test queues the remaining
//! server frames by hand.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tessel_sync_client::{Client, ClientConfig, MockTransport};
use tessel_sync_core::{BackoffConfig, ConnectionStatus, QueryState};
use tessel_sync_types::{
    AddQuery, AddQueryOk, Attribute, ClientEventId, EntityId, Frame, InitOk, QueryHash,
    SessionId, Transact, Triple, TxId,
};
use tokio::time::{sleep, Instant};

/// How long `eventually` waits before failing the test.
const PATIENCE: Duration = Duration::from_secs(3);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast reconnects, slow heartbeats.
pub fn test_config(app_id: &str) -> ClientConfig {
    ClientConfig::new(app_id, "ws://mock/runtime/session")
        .with_heartbeat(Duration::from_secs(30), Duration::from_secs(60))
        .with_reconnect(BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
            jitter: Duration::ZERO,
        })
}

/// The server's `goals` namespace.
pub struct Goals {
    pub id_attr: Attribute,
    pub title: Attribute,
}

impl Goals {
    pub fn new() -> Self {
        Self {
            id_attr: Attribute::id_attr("goals"),
            title: Attribute::blob("goals", "title"),
        }
    }

    pub fn init_ok(&self) -> Frame {
        Frame::InitOk(InitOk {
            session_id: SessionId::new(),
            attrs: vec![self.id_attr.clone(), self.title.clone()],
            user: None,
        })
    }

    /// Server-side triples of one goal.
    pub fn triples(&self, e: EntityId, title: &str, stamp: u64) -> Vec<Triple> {
        vec![
            Triple::new(e, self.id_attr.id, json!(e.to_string()), stamp),
            Triple::new(e, self.title.id, json!(title), stamp),
        ]
    }
}

/// A client that completed the handshake, and the mock server behind it.
pub async fn connected(goals: &Goals, config: ClientConfig) -> (Client, MockTransport) {
    let mock = MockTransport::new();
    mock.reply_to_init(&goals.init_ok());
    let client = Client::open(config, mock.clone())
        .await
        .expect("client opens");
    wait_for_status(&client, ConnectionStatus::Connected).await;
    (client, mock)
}

/// Poll `check` until it holds or the test runs out of patience.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(client: &Client, expected: ConnectionStatus) {
    let label = format!("status {expected:?}");
    eventually(&label, || client.status() == expected).await;
}

/// Records every value a listener receives.
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |value: &T| seen.lock().unwrap().push(value.clone())
    }

    pub fn all(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<T> {
        self.seen.lock().unwrap().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Titles of the `goals` rows in a query state.
pub fn titles(state: &QueryState) -> Vec<String> {
    state
        .data
        .as_ref()
        .and_then(|data| data["goals"].as_array())
        .map(|rows| {
            rows.iter()
                .map(|g| g["title"].as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub fn add_queries(mock: &MockTransport) -> Vec<AddQuery> {
    mock.sent_frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::AddQuery(add) => Some(add),
            _ => None,
        })
        .collect()
}

pub fn transacts(mock: &MockTransport) -> Vec<Transact> {
    mock.sent_frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::Transact(t) => Some(t),
            _ => None,
        })
        .collect()
}

pub fn count_ops(mock: &MockTransport, op: &str) -> usize {
    mock.sent_frames().iter().filter(|f| f.op() == op).count()
}

/// Wait for the `add-query` of `q` and answer it.
pub async fn answer_query(mock: &MockTransport, q: &Value, triples: Vec<Triple>, tx: u64) {
    let mut id: Option<ClientEventId> = None;
    eventually("add-query", || {
        id = add_queries(mock)
            .into_iter()
            .rev()
            .find(|add| &add.q == q)
            .map(|add| add.client_event_id);
        id.is_some()
    })
    .await;
    mock.queue_frame(&Frame::AddQueryOk(AddQueryOk {
        q: q.clone(),
        hash: QueryHash::of(q),
        triples,
        processed_tx_id: TxId::new(tx),
        client_event_id: id.expect("add-query was sent"),
    }));
}
