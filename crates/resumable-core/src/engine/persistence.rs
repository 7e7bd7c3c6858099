//! SQLite-backed progress store
//!
//! Keeps one row per transfer plus its received chunks so that a transfer
//! survives process restarts. Several transfers can share one database file
//! as long as each uses its own key.

use crate::error::TransferError;
use crate::storage::{check_key, ProgressStore, ReceivedWindow, StoreKey, StoreValue};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use resumable_types::{ByteRange, TransferState};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::path::Path;
use tracing::debug;

/// Durable [`ProgressStore`] for a single transfer key
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    key: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and bind the store to `transfer_key`
    pub async fn open<P: AsRef<Path>>(
        db_path: P,
        transfer_key: &str,
    ) -> Result<Self, TransferError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                key TEXT PRIMARY KEY,
                state TEXT,
                identity TEXT,
                size INTEGER,
                range_start INTEGER,
                range_end INTEGER,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transfer_chunks (
                transfer_key TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (transfer_key, seq)
            );
            "#,
        )
        .execute(&pool)
        .await?;

        let store = Self {
            pool,
            key: transfer_key.to_string(),
        };
        store.ensure_row().await?;
        debug!("Opened progress store {} for {}", path.display(), transfer_key);

        Ok(store)
    }

    /// Look up a stored transfer without creating the database or a row.
    ///
    /// The returned store is read-only.
    pub async fn find<P: AsRef<Path>>(
        db_path: P,
        transfer_key: &str,
    ) -> Result<Option<Self>, TransferError> {
        let path = db_path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }

        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePool::connect_with(options).await?;

        let tables = sqlx::query(
            r#"
            SELECT COUNT(*) AS tables FROM sqlite_master
            WHERE type = 'table' AND name = 'transfers'
            "#,
        )
        .fetch_one(&pool)
        .await?
        .get::<i64, _>("tables");
        if tables == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT key FROM transfers WHERE key = ?")
            .bind(transfer_key)
            .fetch_optional(&pool)
            .await?;

        Ok(row.map(|_| Self {
            pool,
            key: transfer_key.to_string(),
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn ensure_row(&self) -> Result<(), TransferError> {
        sqlx::query(
            "INSERT INTO transfers (key, updated_at) VALUES (?, ?) ON CONFLICT(key) DO NOTHING",
        )
        .bind(&self.key)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total bytes currently held in the accumulator
    pub async fn received_bytes(&self) -> Result<u64, TransferError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(LENGTH(data)), 0) AS total
            FROM transfer_chunks WHERE transfer_key = ?
            "#,
        )
        .bind(&self.key)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    /// When the transfer row last changed
    pub async fn updated_at(&self) -> Result<Option<DateTime<Utc>>, TransferError> {
        let row = sqlx::query("SELECT updated_at FROM transfers WHERE key = ?")
            .bind(&self.key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .and_then(|row| {
                DateTime::parse_from_rfc3339(row.get::<String, _>("updated_at").as_str()).ok()
            })
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Remove the transfer row and its chunks
    pub async fn forget(self) -> Result<(), TransferError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM transfer_chunks WHERE transfer_key = ?")
            .bind(&self.key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transfers WHERE key = ?")
            .bind(&self.key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Forgot transfer {}", self.key);
        Ok(())
    }
}

impl ProgressStore for SqliteStore {
    async fn get(&self, key: StoreKey) -> Result<Option<StoreValue>, TransferError> {
        let row = sqlx::query(
            "SELECT state, identity, size, range_start, range_end FROM transfers WHERE key = ?",
        )
        .bind(&self.key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value = match key {
            StoreKey::State => match row.get::<Option<String>, _>("state") {
                None => None,
                Some(text) => Some(StoreValue::State(
                    TransferState::parse(&text).ok_or(TransferError::InvalidState(text))?,
                )),
            },
            StoreKey::Identity => row
                .get::<Option<String>, _>("identity")
                .map(StoreValue::Identity),
            StoreKey::Size => row
                .get::<Option<i64>, _>("size")
                .map(|size| StoreValue::Size(size as u64)),
            StoreKey::Range => {
                let start = row.get::<Option<i64>, _>("range_start");
                let end = row.get::<Option<i64>, _>("range_end");
                match (start, end) {
                    (Some(start), Some(end)) => Some(StoreValue::Range(
                        ByteRange::new(start as u64, end as u64).ok_or_else(|| {
                            TransferError::Store(format!(
                                "stored range {}-{} is inverted",
                                start, end
                            ))
                        })?,
                    )),
                    _ => None,
                }
            }
        };

        Ok(value)
    }

    async fn set(&self, key: StoreKey, value: StoreValue) -> Result<(), TransferError> {
        check_key(key, &value)?;
        let now = Utc::now().to_rfc3339();

        let query = match &value {
            StoreValue::State(state) => {
                sqlx::query("UPDATE transfers SET state = ?, updated_at = ? WHERE key = ?")
                    .bind(state.as_str())
            }
            StoreValue::Identity(tag) => {
                sqlx::query("UPDATE transfers SET identity = ?, updated_at = ? WHERE key = ?")
                    .bind(tag.as_str())
            }
            StoreValue::Size(size) => {
                sqlx::query("UPDATE transfers SET size = ?, updated_at = ? WHERE key = ?")
                    .bind(*size as i64)
            }
            StoreValue::Range(range) => sqlx::query(
                "UPDATE transfers SET range_start = ?, range_end = ?, updated_at = ? WHERE key = ?",
            )
            .bind(range.start as i64)
            .bind(range.end as i64),
        };

        query.bind(now).bind(&self.key).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<(), TransferError> {
        let sql = match key {
            StoreKey::State => "UPDATE transfers SET state = NULL, updated_at = ? WHERE key = ?",
            StoreKey::Identity => {
                "UPDATE transfers SET identity = NULL, updated_at = ? WHERE key = ?"
            }
            StoreKey::Size => "UPDATE transfers SET size = NULL, updated_at = ? WHERE key = ?",
            StoreKey::Range => {
                r#"
                UPDATE transfers SET range_start = NULL, range_end = NULL, updated_at = ?
                WHERE key = ?
                "#
            }
        };

        sqlx::query(sql)
            .bind(Utc::now().to_rfc3339())
            .bind(&self.key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransferError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM transfer_chunks WHERE transfer_key = ?")
            .bind(&self.key)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE transfers
            SET state = NULL, identity = NULL, size = NULL,
                range_start = NULL, range_end = NULL, updated_at = ?
            WHERE key = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&self.key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_window(&self, window: ReceivedWindow) -> Result<(), TransferError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        if window.replaces_payload {
            sqlx::query("DELETE FROM transfer_chunks WHERE transfer_key = ?")
                .bind(&self.key)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                UPDATE transfers
                SET state = NULL, size = NULL, range_start = NULL, range_end = NULL
                WHERE key = ?
                "#,
            )
            .bind(&self.key)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO transfer_chunks (transfer_key, seq, data)
            SELECT ?, COALESCE(MAX(seq) + 1, 0), ? FROM transfer_chunks WHERE transfer_key = ?
            "#,
        )
        .bind(&self.key)
        .bind(window.body.as_ref())
        .bind(&self.key)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE transfers
            SET identity = ?,
                size = COALESCE(?, size),
                range_start = COALESCE(?, range_start),
                range_end = COALESCE(?, range_end),
                updated_at = ?
            WHERE key = ?
            "#,
        )
        .bind(window.identity.as_deref())
        .bind(window.total_size.map(|size| size as i64))
        .bind(window.range.map(|range| range.start as i64))
        .bind(window.range.map(|range| range.end as i64))
        .bind(now)
        .bind(&self.key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn append(&self, chunk: Bytes) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            INSERT INTO transfer_chunks (transfer_key, seq, data)
            SELECT ?, COALESCE(MAX(seq) + 1, 0), ? FROM transfer_chunks WHERE transfer_key = ?
            "#,
        )
        .bind(&self.key)
        .bind(chunk.as_ref())
        .bind(&self.key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn assemble(&self) -> Result<Bytes, TransferError> {
        let rows =
            sqlx::query("SELECT data FROM transfer_chunks WHERE transfer_key = ? ORDER BY seq")
                .bind(&self.key)
                .fetch_all(&self.pool)
                .await?;

        let mut payload = BytesMut::new();
        for row in rows {
            payload.extend_from_slice(&row.get::<Vec<u8>, _>("data"));
        }
        Ok(payload.freeze())
    }
}
