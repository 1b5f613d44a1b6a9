//! In-memory persistence, used when no database path is configured.

use super::{Persister, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tessel_sync_core::{CachedQuery, Mutation};
use tessel_sync_types::{Attribute, ClientEventId, QueryHash};

#[derive(Debug, Default)]
struct AppState {
    schema: Option<Vec<Attribute>>,
    /// (hash, entry, last-used tick)
    queries: Vec<(QueryHash, CachedQuery, u64)>,
    mutations: Vec<Mutation>,
}

/// Process-local storage. Survives client restarts within one process,
/// which is what tests use it for.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    apps: Mutex<HashMap<String, AppState>>,
    tick: Mutex<u64>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tick(&self) -> u64 {
        let mut tick = self.tick.lock();
        *tick += 1;
        *tick
    }
}

#[async_trait]
impl Persister for MemoryStorage {
    async fn load_schema(&self, app_id: &str) -> Result<Option<Vec<Attribute>>, StorageError> {
        Ok(self
            .apps
            .lock()
            .get(app_id)
            .and_then(|app| app.schema.clone()))
    }

    async fn save_schema(&self, app_id: &str, attrs: &[Attribute]) -> Result<(), StorageError> {
        self.apps.lock().entry(app_id.to_string()).or_default().schema = Some(attrs.to_vec());
        Ok(())
    }

    async fn load_queries(&self, app_id: &str) -> Result<Vec<CachedQuery>, StorageError> {
        let apps = self.apps.lock();
        let Some(app) = apps.get(app_id) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<&(QueryHash, CachedQuery, u64)> = app.queries.iter().collect();
        rows.sort_by_key(|(_, _, used)| *used);
        Ok(rows.into_iter().map(|(_, entry, _)| entry.clone()).collect())
    }

    async fn put_query(
        &self,
        app_id: &str,
        hash: &QueryHash,
        entry: &CachedQuery,
    ) -> Result<(), StorageError> {
        let tick = self.next_tick();
        let mut apps = self.apps.lock();
        let app = apps.entry(app_id.to_string()).or_default();
        app.queries.retain(|(h, _, _)| h != hash);
        app.queries.push((hash.clone(), entry.clone(), tick));
        Ok(())
    }

    async fn delete_queries(
        &self,
        app_id: &str,
        hashes: &[QueryHash],
    ) -> Result<(), StorageError> {
        if let Some(app) = self.apps.lock().get_mut(app_id) {
            app.queries.retain(|(h, _, _)| !hashes.contains(h));
        }
        Ok(())
    }

    async fn load_mutations(&self, app_id: &str) -> Result<Vec<Mutation>, StorageError> {
        Ok(self
            .apps
            .lock()
            .get(app_id)
            .map(|app| app.mutations.clone())
            .unwrap_or_default())
    }

    async fn put_mutation(&self, app_id: &str, mutation: &Mutation) -> Result<(), StorageError> {
        self.apps
            .lock()
            .entry(app_id.to_string())
            .or_default()
            .mutations
            .push(mutation.clone());
        Ok(())
    }

    async fn delete_mutation(&self, app_id: &str, id: &ClientEventId) -> Result<(), StorageError> {
        if let Some(app) = self.apps.lock().get_mut(app_id) {
            app.mutations.retain(|m| m.id != *id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessel_sync_types::TxId;

    fn cached(n: u64) -> (QueryHash, CachedQuery) {
        let q = json!({"goals": {"$": {"limit": n}}});
        (
            QueryHash::of(&q),
            CachedQuery {
                q,
                triples: vec![],
                processed_tx_id: TxId::new(n),
            },
        )
    }

    #[tokio::test]
    async fn apps_are_isolated() {
        let storage = MemoryStorage::new();
        storage
            .save_schema("a", &[Attribute::id_attr("goals")])
            .await
            .unwrap();
        assert!(storage.load_schema("a").await.unwrap().is_some());
        assert!(storage.load_schema("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queries_load_least_recent_first() {
        let storage = MemoryStorage::new();
        let (h1, e1) = cached(1);
        let (h2, e2) = cached(2);
        storage.put_query("a", &h1, &e1).await.unwrap();
        storage.put_query("a", &h2, &e2).await.unwrap();
        storage.put_query("a", &h1, &e1).await.unwrap();

        let loaded = storage.load_queries("a").await.unwrap();
        assert_eq!(loaded, vec![e2.clone(), e1]);

        storage.delete_queries("a", &[h1]).await.unwrap();
        assert_eq!(storage.load_queries("a").await.unwrap(), vec![e2]);
    }
}
