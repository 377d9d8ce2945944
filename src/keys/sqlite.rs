/// SQLite-backed key database
use crate::{
    error::{ServerKeyError, ServerKeyResult},
    keys::{
        KeyDatabase, KeyIdentifier, KeyLookupResult, LookupRequests, LookupResults, Timestamp,
        VerifyKey,
    },
};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

/// Identifiers per SELECT, keeps us well under SQLite's bound parameter limit
const LOOKUP_CHUNK_SIZE: usize = 200;

const SERVER_KEYS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS server_keys (
    server_name TEXT NOT NULL,
    key_id TEXT NOT NULL,
    verify_key TEXT NOT NULL,
    valid_until_ts INTEGER NOT NULL,
    expired_ts INTEGER,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (server_name, key_id)
)
"#;

/// SQLite integers are signed, clamp anything larger
fn to_column(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

/// Key database persisting lookup results in a `server_keys` table
#[derive(Clone)]
pub struct SqliteKeyDatabase {
    db: SqlitePool,
}

impl SqliteKeyDatabase {
    /// Create a key database and make sure its table exists
    pub async fn new(db: SqlitePool) -> ServerKeyResult<Self> {
        let database = Self { db };
        database.prepare().await?;
        Ok(database)
    }

    /// Create the schema if missing
    pub async fn prepare(&self) -> ServerKeyResult<()> {
        sqlx::query(SERVER_KEYS_SCHEMA).execute(&self.db).await?;
        Ok(())
    }

    /// Number of stored keys
    pub async fn count(&self) -> ServerKeyResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM server_keys")
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn fetch_chunk(
        &self,
        identifiers: &[&KeyIdentifier],
        results: &mut LookupResults,
    ) -> ServerKeyResult<()> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT server_name, key_id, verify_key, valid_until_ts, expired_ts FROM server_keys WHERE ",
        );

        for (i, id) in identifiers.iter().enumerate() {
            if i > 0 {
                query.push(" OR ");
            }
            query
                .push("(server_name = ")
                .push_bind(id.server_name.as_str())
                .push(" AND key_id = ")
                .push_bind(id.key_id.as_str())
                .push(")");
        }

        let rows = query.build().fetch_all(&self.db).await?;

        for row in rows {
            let id = KeyIdentifier::new(
                row.try_get::<String, _>("server_name")?,
                row.try_get::<String, _>("key_id")?,
            );
            let encoded: String = row.try_get("verify_key")?;
            let verify_key = VerifyKey::from_base64(&encoded).map_err(|e| {
                ServerKeyError::Internal(format!("Invalid stored key for {}: {}", id, e))
            })?;

            results.insert(
                id,
                KeyLookupResult {
                    verify_key,
                    valid_until_ts: Timestamp::from_millis(row.try_get("valid_until_ts")?),
                    expired_ts: row
                        .try_get::<Option<i64>, _>("expired_ts")?
                        .map(Timestamp::from_millis),
                },
            );
        }

        Ok(())
    }
}

#[async_trait]
impl KeyDatabase for SqliteKeyDatabase {
    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        let mut results = LookupResults::new();
        let identifiers: Vec<&KeyIdentifier> = requests.keys().collect();

        for chunk in identifiers.chunks(LOOKUP_CHUNK_SIZE) {
            self.fetch_chunk(chunk, &mut results).await?;
        }

        debug!(
            "Key database returned {} of {} requested keys",
            results.len(),
            requests.len()
        );
        Ok(results)
    }

    async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()> {
        if results.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| ServerKeyError::StorePersistence(e.to_string()))?;

        for (id, result) in results {
            sqlx::query(
                r#"
                INSERT INTO server_keys (server_name, key_id, verify_key, valid_until_ts, expired_ts, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(server_name, key_id) DO UPDATE SET
                    verify_key = excluded.verify_key,
                    valid_until_ts = excluded.valid_until_ts,
                    expired_ts = excluded.expired_ts,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id.server_name)
            .bind(&id.key_id)
            .bind(result.verify_key.to_base64())
            .bind(to_column(result.valid_until_ts))
            .bind(result.expired_ts.map(to_column))
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                ServerKeyError::StorePersistence(format!("Failed to upsert key {}: {}", id, e))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| ServerKeyError::StorePersistence(e.to_string()))?;

        debug!("Stored {} keys", results.len());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// In-memory database; a single connection so every query sees the same schema
    pub(crate) async fn create_test_database() -> SqliteKeyDatabase {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        SqliteKeyDatabase::new(db).await.unwrap()
    }

    fn lookup(valid_until: u64, expired: Option<u64>) -> KeyLookupResult {
        KeyLookupResult {
            verify_key: VerifyKey(vec![7; 32]),
            valid_until_ts: Timestamp(valid_until),
            expired_ts: expired.map(Timestamp),
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch_keys() {
        let database = create_test_database().await;
        let id = KeyIdentifier::new("remote.example", "ed25519:a1");

        let mut results = LookupResults::new();
        results.insert(id.clone(), lookup(1_000, None));
        database.store_keys(&results).await.unwrap();

        let mut requests = LookupRequests::new();
        requests.insert(id.clone(), Timestamp(0));
        let fetched = database.fetch_keys(&requests).await.unwrap();

        assert_eq!(fetched.get(&id), Some(&lookup(1_000, None)));
    }

    #[tokio::test]
    async fn test_store_is_upsert() {
        let database = create_test_database().await;
        let id = KeyIdentifier::new("remote.example", "ed25519:a1");
        let other = KeyIdentifier::new("other.example", "ed25519:b2");

        let mut first = LookupResults::new();
        first.insert(id.clone(), lookup(1_000, None));
        first.insert(other.clone(), lookup(5_000, None));
        database.store_keys(&first).await.unwrap();

        let mut second = LookupResults::new();
        second.insert(id.clone(), lookup(2_000, Some(1_500)));
        database.store_keys(&second).await.unwrap();

        let mut requests = LookupRequests::new();
        requests.insert(id.clone(), Timestamp(0));
        requests.insert(other.clone(), Timestamp(0));
        let fetched = database.fetch_keys(&requests).await.unwrap();

        // Latest write wins, untouched identifiers survive
        assert_eq!(fetched.get(&id), Some(&lookup(2_000, Some(1_500))));
        assert_eq!(fetched.get(&other), Some(&lookup(5_000, None)));
        assert_eq!(database.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fetch_unknown_keys_returns_nothing() {
        let database = create_test_database().await;

        let mut requests = LookupRequests::new();
        requests.insert(KeyIdentifier::new("nobody.example", "ed25519:x"), Timestamp(0));

        let fetched = database.fetch_keys(&requests).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_large_batch_spans_chunks() {
        let database = create_test_database().await;

        let mut results = LookupResults::new();
        let mut requests = LookupRequests::new();
        for i in 0..(LOOKUP_CHUNK_SIZE * 2 + 5) {
            let id = KeyIdentifier::new(format!("server{}.example", i), "ed25519:k");
            results.insert(id.clone(), lookup(1_000 + i as u64, None));
            requests.insert(id, Timestamp(0));
        }
        database.store_keys(&results).await.unwrap();

        let fetched = database.fetch_keys(&requests).await.unwrap();
        assert_eq!(fetched, results);
    }
}
