//! SQLite persistence backend.

use super::{Persister, StorageError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tessel_sync_core::{CachedQuery, Mutation};
use tessel_sync_types::{Attribute, ClientEventId, QueryHash};

/// SQLite-based local storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a database file.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // One connection: every connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_snapshots (
                app_id TEXT PRIMARY KEY,
                attrs TEXT NOT NULL,
                saved_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS query_cache (
                app_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                entry TEXT NOT NULL,
                last_used INTEGER NOT NULL,
                PRIMARY KEY (app_id, hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_mutations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id TEXT NOT NULL,
                mutation_id TEXT NOT NULL,
                body TEXT NOT NULL,
                UNIQUE(app_id, mutation_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_app_seq ON pending_mutations(app_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Next value of the recency counter for `app_id`.
    async fn next_use(&self, app_id: &str) -> Result<i64, StorageError> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(last_used), 0) + 1 FROM query_cache WHERE app_id = ?1",
        )
        .bind(app_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }
}

#[async_trait]
impl Persister for SqliteStorage {
    async fn load_schema(&self, app_id: &str) -> Result<Option<Vec<Attribute>>, StorageError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT attrs FROM schema_snapshots WHERE app_id = ?1")
                .bind(app_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|json| {
            serde_json::from_str(&json).map_err(|e| StorageError::Corrupt {
                table: "schema_snapshots",
                source: e,
            })
        })
        .transpose()
    }

    async fn save_schema(&self, app_id: &str, attrs: &[Attribute]) -> Result<(), StorageError> {
        let json = serde_json::to_string(attrs).map_err(|e| StorageError::Encode {
            what: "schema",
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO schema_snapshots (app_id, attrs) VALUES (?1, ?2)
            ON CONFLICT(app_id) DO UPDATE SET attrs = excluded.attrs,
                saved_at = strftime('%s', 'now')
            "#,
        )
        .bind(app_id)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_queries(&self, app_id: &str) -> Result<Vec<CachedQuery>, StorageError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT entry FROM query_cache WHERE app_id = ?1 ORDER BY last_used ASC",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| StorageError::Corrupt {
                    table: "query_cache",
                    source: e,
                })
            })
            .collect()
    }

    async fn put_query(
        &self,
        app_id: &str,
        hash: &QueryHash,
        entry: &CachedQuery,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(entry).map_err(|e| StorageError::Encode {
            what: "cached query",
            source: e,
        })?;
        let used = self.next_use(app_id).await?;
        sqlx::query(
            r#"
            INSERT INTO query_cache (app_id, hash, entry, last_used) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(app_id, hash) DO UPDATE SET entry = excluded.entry,
                last_used = excluded.last_used
            "#,
        )
        .bind(app_id)
        .bind(hash.as_str())
        .bind(json)
        .bind(used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_queries(
        &self,
        app_id: &str,
        hashes: &[QueryHash],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for hash in hashes {
            sqlx::query("DELETE FROM query_cache WHERE app_id = ?1 AND hash = ?2")
                .bind(app_id)
                .bind(hash.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_mutations(&self, app_id: &str) -> Result<Vec<Mutation>, StorageError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM pending_mutations WHERE app_id = ?1 ORDER BY seq ASC",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| StorageError::Corrupt {
                    table: "pending_mutations",
                    source: e,
                })
            })
            .collect()
    }

    async fn put_mutation(&self, app_id: &str, mutation: &Mutation) -> Result<(), StorageError> {
        let json = serde_json::to_string(mutation).map_err(|e| StorageError::Encode {
            what: "mutation",
            source: e,
        })?;
        sqlx::query(
            "INSERT OR IGNORE INTO pending_mutations (app_id, mutation_id, body) VALUES (?1, ?2, ?3)",
        )
        .bind(app_id)
        .bind(mutation.id.to_string())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_mutation(&self, app_id: &str, id: &ClientEventId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_mutations WHERE app_id = ?1 AND mutation_id = ?2")
            .bind(app_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessel_sync_types::{EntityId, TxId, TxStep};

    fn mutation(n: u64) -> Mutation {
        Mutation::new(
            vec![TxStep::DeleteEntity {
                e: EntityId::new(),
                etype: format!("ns{n}"),
            }],
            n,
        )
    }

    // ===========================================
    // Schema
    // ===========================================

    #[tokio::test]
    async fn schema_roundtrip_and_replace() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.load_schema("app").await.unwrap().is_none());

        let v1 = vec![Attribute::id_attr("goals")];
        storage.save_schema("app", &v1).await.unwrap();
        let v2 = vec![Attribute::id_attr("goals"), Attribute::blob("goals", "title")];
        storage.save_schema("app", &v2).await.unwrap();

        assert_eq!(storage.load_schema("app").await.unwrap(), Some(v2));
        assert!(storage.load_schema("other").await.unwrap().is_none());
    }

    // ===========================================
    // Query cache
    // ===========================================

    #[tokio::test]
    async fn query_cache_orders_by_recency() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let entry = |n: u64| {
            let q = json!({"goals": {"$": {"limit": n}}});
            (
                QueryHash::of(&q),
                CachedQuery {
                    q,
                    triples: vec![],
                    processed_tx_id: TxId::new(n),
                },
            )
        };
        let (h1, e1) = entry(1);
        let (h2, e2) = entry(2);
        storage.put_query("app", &h1, &e1).await.unwrap();
        storage.put_query("app", &h2, &e2).await.unwrap();
        storage.put_query("app", &h1, &e1).await.unwrap();

        assert_eq!(
            storage.load_queries("app").await.unwrap(),
            vec![e2.clone(), e1.clone()]
        );

        storage.delete_queries("app", &[h2]).await.unwrap();
        assert_eq!(storage.load_queries("app").await.unwrap(), vec![e1]);
    }

    // ===========================================
    // Pending mutations
    // ===========================================

    #[tokio::test]
    async fn mutation_log_keeps_enqueue_order() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let (m1, m2, m3) = (mutation(1), mutation(2), mutation(3));
        for m in [&m1, &m2, &m3] {
            storage.put_mutation("app", m).await.unwrap();
        }
        storage.delete_mutation("app", &m2.id).await.unwrap();

        let loaded = storage.load_mutations("app").await.unwrap();
        assert_eq!(loaded, vec![m1, m3]);
        assert!(storage.load_mutations("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        let m = mutation(7);
        {
            let storage = SqliteStorage::new(&path).await.unwrap();
            storage.put_mutation("app", &m).await.unwrap();
            storage.pool.close().await;
        }
        let storage = SqliteStorage::new(&path).await.unwrap();
        assert_eq!(storage.load_mutations("app").await.unwrap(), vec![m]);
    }
}
