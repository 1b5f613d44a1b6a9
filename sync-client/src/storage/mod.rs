//! Durable local state.
//!
//! Three kinds of state survive a restart, all keyed by app id:
//! - the last known schema dictionary
//! - cached query results (bounded, least-recently-used)
//! - the pending-mutation log, in enqueue order
//!
//! Writes are issued by the reactor as `PersistOp`s and applied in order by
//! a single background task, so the durable log order equals enqueue order.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::sync::Arc;
use tessel_sync_core::{CachedQuery, Mutation};
use tessel_sync_types::{Attribute, ClientEventId, QueryHash};
use tokio::sync::{mpsc, oneshot};

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt {table} row: {source}")]
    Corrupt {
        /// Table the row came from.
        table: &'static str,
        /// Decoder error.
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// What was being stored.
        what: &'static str,
        /// Encoder error.
        source: serde_json::Error,
    },
}

/// Trait for local persistence backends.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Last saved schema dictionary.
    async fn load_schema(&self, app_id: &str) -> Result<Option<Vec<Attribute>>, StorageError>;

    /// Replace the saved schema dictionary.
    async fn save_schema(&self, app_id: &str, attrs: &[Attribute]) -> Result<(), StorageError>;

    /// Cached query results, least recently used first.
    async fn load_queries(&self, app_id: &str) -> Result<Vec<CachedQuery>, StorageError>;

    /// Insert or refresh a cached result.
    async fn put_query(
        &self,
        app_id: &str,
        hash: &QueryHash,
        entry: &CachedQuery,
    ) -> Result<(), StorageError>;

    /// Drop cached results.
    async fn delete_queries(&self, app_id: &str, hashes: &[QueryHash])
        -> Result<(), StorageError>;

    /// The pending-mutation log, in enqueue order.
    async fn load_mutations(&self, app_id: &str) -> Result<Vec<Mutation>, StorageError>;

    /// Append a mutation to the log.
    async fn put_mutation(&self, app_id: &str, mutation: &Mutation) -> Result<(), StorageError>;

    /// Remove a mutation (acked or rejected).
    async fn delete_mutation(&self, app_id: &str, id: &ClientEventId) -> Result<(), StorageError>;
}

/// Everything loaded at startup.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Schema dictionary, if one was saved.
    pub schema: Option<Vec<Attribute>>,
    /// Cached results, least recently used first.
    pub queries: Vec<CachedQuery>,
    /// Pending mutations in enqueue order.
    pub mutations: Vec<Mutation>,
}

/// Load all persisted state for an app.
pub async fn load_snapshot(
    persister: &dyn Persister,
    app_id: &str,
) -> Result<Snapshot, StorageError> {
    Ok(Snapshot {
        schema: persister.load_schema(app_id).await?,
        queries: persister.load_queries(app_id).await?,
        mutations: persister.load_mutations(app_id).await?,
    })
}

/// A write issued by the reactor.
#[derive(Debug)]
pub(crate) enum PersistOp {
    SaveSchema(Vec<Attribute>),
    PutQuery(QueryHash, CachedQuery),
    DeleteQueries(Vec<QueryHash>),
    PutMutation(Mutation),
    DeleteMutation(ClientEventId),
    /// Resolves once every earlier op was applied.
    Flush(oneshot::Sender<()>),
}

impl PersistOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            PersistOp::SaveSchema(_) => "save-schema",
            PersistOp::PutQuery(..) => "put-query",
            PersistOp::DeleteQueries(_) => "delete-queries",
            PersistOp::PutMutation(_) => "put-mutation",
            PersistOp::DeleteMutation(_) => "delete-mutation",
            PersistOp::Flush(_) => "flush",
        }
    }
}

/// Spawn the ordered writer. It stops when every sender is dropped.
pub(crate) fn spawn_writer(
    persister: Arc<dyn Persister>,
    app_id: String,
) -> mpsc::UnboundedSender<PersistOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let result = match op {
                PersistOp::SaveSchema(attrs) => persister.save_schema(&app_id, &attrs).await,
                PersistOp::PutQuery(hash, entry) => {
                    persister.put_query(&app_id, &hash, &entry).await
                }
                PersistOp::DeleteQueries(hashes) => {
                    persister.delete_queries(&app_id, &hashes).await
                }
                PersistOp::PutMutation(m) => persister.put_mutation(&app_id, &m).await,
                PersistOp::DeleteMutation(id) => persister.delete_mutation(&app_id, &id).await,
                PersistOp::Flush(done) => {
                    let _ = done.send(());
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(app_id = %app_id, error = %e, "persistence write failed");
            }
        }
        tracing::debug!(app_id = %app_id, "persistence writer stopped");
    });
    tx
}
