//! SQLite-backed [`KeyValueStore`] via sqlx.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::{backend::KeyValueStore, error::VaultError};

/// Durable record store.  Cheap to clone (pool is Arc internally).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection options, not in a migration:
    /// SQLite refuses to change `journal_mode` inside a transaction.
    pub async fn open(db_path: &Path) -> Result<Self, VaultError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| VaultError::Migration(e.to_string()))?;

        tracing::debug!(path = %db_path.display(), "vault database opened");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM vault_records WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), VaultError> {
        sqlx::query(
            "INSERT INTO vault_records (key, value, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, VaultError> {
        let result = sqlx::query("DELETE FROM vault_records WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        // Filtered here rather than with LIKE so '%' and '_' in keys need no escaping.
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM vault_records ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
    }

    async fn clear(&self) -> Result<(), VaultError> {
        sqlx::query("DELETE FROM vault_records")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
