//! `PostgreSQL` storage backend.
//!
//! Every tenant database holds a single `locker_records` table. Keys are
//! UTF-8 paths, values are encrypted bytes produced by the barrier. The
//! `updated_at` column is maintained for operators; Locker never reads it.
//!
//! Feature-gated behind `postgres-backend`.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::{Record, StorageBackend, StorageError};

/// Default connection pool size per tenant database.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// A storage backend backed by a `PostgreSQL` database.
///
/// # Examples
///
/// ```no_run
/// # use locker_storage::PostgresBackend;
/// # #[tokio::main]
/// # async fn main() {
/// let backend = PostgresBackend::connect("postgres://localhost/locker", None).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Connect to `PostgreSQL` and create the records table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or schema setup fails.
    /// The connection string is never included in the error.
    pub async fn connect(
        database_url: &str,
        max_connections: Option<u32>,
    ) -> Result<Self, StorageError> {
        let open_err = |reason: String| StorageError::Open {
            target: "postgres".to_owned(),
            reason,
        };

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .connect(database_url)
            .await
            .map_err(|e| open_err(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS locker_records (\
                key        TEXT        PRIMARY KEY, \
                value      BYTEA       NOT NULL, \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| open_err(format!("schema setup failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_locker_records_prefix \
             ON locker_records (key text_pattern_ops)",
        )
        .execute(&pool)
        .await
        .map_err(|e| open_err(format!("index creation failed: {e}")))?;

        tracing::debug!("postgres records table ready");

        Ok(Self { pool })
    }
}

/// Escape `LIKE` metacharacters so a key prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len().saturating_add(1));
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM locker_records WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO locker_records (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM locker_records WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM locker_records WHERE key LIKE $1 ESCAPE '\\' ORDER BY key",
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::List {
            prefix: prefix.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StorageError> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT key, value FROM locker_records WHERE key LIKE $1 ESCAPE '\\' ORDER BY key",
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::List {
            prefix: prefix.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(rows)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let (found,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM locker_records WHERE key = $1)")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::like_prefix;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("users/"), "users/%");
        assert_eq!(like_prefix("relay/a_b%"), "relay/a\\_b\\%%");
    }
}
