use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;

use super::history::{ConversationTurn, HistoryError, Role, TurnRecord, TurnStore};
use super::quota::{
    PeriodKey, QuotaDecision, QuotaStore, QuotaStoreError, apply_adjustment, counter_id,
};
use super::{Clock, SystemClock, now_millis};

/// Durable backend for the quota ledger and the conversation log.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl From<SqliteStoreError> for QuotaStoreError {
    fn from(err: SqliteStoreError) -> Self {
        QuotaStoreError::unavailable(err.to_string())
    }
}

impl From<SqliteStoreError> for HistoryError {
    fn from(err: SqliteStoreError) -> Self {
        HistoryError::durable(err.to_string())
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Adds `delta` to a counter inside one `IMMEDIATE` transaction, so concurrent
    /// writers serialize on the database lock. Counters of ended periods are deleted in
    /// the same transaction.
    pub async fn adjust_counter(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
        limit: i64,
        now_epoch_seconds: u64,
    ) -> Result<QuotaDecision, SqliteStoreError> {
        let path = self.path.clone();
        let counter = counter_id(user, period);
        let expires_at = epoch_to_i64(period.expires_at);
        let now = epoch_to_i64(now_epoch_seconds);

        tokio::task::spawn_blocking(move || -> Result<QuotaDecision, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            delete_expired_counters(&tx, now)?;

            let existing: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT used, expires_at FROM quota_counters WHERE counter_id=?1",
                    rusqlite::params![counter],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (before, row_expires_at) = match existing {
                Some((used, row_expires_at)) if row_expires_at > now => (used, row_expires_at),
                _ => (0, expires_at),
            };

            // The expiry is only armed when the row is created (or replaced after expiry).
            let (after, allowed) = apply_adjustment(before, delta, limit);
            tx.execute(
                "INSERT INTO quota_counters (counter_id, used, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(counter_id) DO UPDATE SET used=excluded.used, expires_at=excluded.expires_at",
                rusqlite::params![counter, after, row_expires_at],
            )?;
            tx.commit()?;
            Ok(QuotaDecision::new(allowed, after, limit))
        })
        .await?
    }

    pub async fn counter_used(
        &self,
        user: &str,
        period: &PeriodKey,
        now_epoch_seconds: u64,
    ) -> Result<i64, SqliteStoreError> {
        let path = self.path.clone();
        let counter = counter_id(user, period);
        let now = epoch_to_i64(now_epoch_seconds);

        tokio::task::spawn_blocking(move || -> Result<i64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let used: Option<i64> = conn
                .query_row(
                    "SELECT used FROM quota_counters WHERE counter_id=?1 AND expires_at > ?2",
                    rusqlite::params![counter, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(used.unwrap_or(0))
        })
        .await?
    }

    /// Deletes counters whose period ended at or before `now_epoch_seconds`.
    pub async fn reap_expired_quota_counters(
        &self,
        now_epoch_seconds: u64,
    ) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let now = epoch_to_i64(now_epoch_seconds);

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let deleted = delete_expired_counters(&conn, now)?;
            Ok(deleted as u64)
        })
        .await?
    }

    pub async fn insert_turn(
        &self,
        user: &str,
        role: Role,
        text: &str,
    ) -> Result<TurnRecord, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user.to_string();
        let text = text.to_string();
        let created_at_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<TurnRecord, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO chat_history (user_id, role, text, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user_id, role.as_str(), text, created_at_ms],
            )?;
            Ok(TurnRecord {
                seq: conn.last_insert_rowid(),
                user_id,
                role,
                text,
                created_at_ms,
            })
        })
        .await?
    }

    pub async fn recent_turns(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<ConversationTurn>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT role, text FROM chat_history WHERE user_id=?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (role, text) = row?;
                let role = Role::from_str(&role)
                    .map_err(|err| SqliteStoreError::InvalidRow(err.to_string()))?;
                out.push(ConversationTurn { role, text });
            }
            Ok(out)
        })
        .await?
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn adjust(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
        limit: i64,
    ) -> Result<QuotaDecision, QuotaStoreError> {
        let now = SystemClock.now_epoch_seconds();
        Ok(self.adjust_counter(user, period, delta, limit, now).await?)
    }

    async fn used(&self, user: &str, period: &PeriodKey) -> Result<i64, QuotaStoreError> {
        let now = SystemClock.now_epoch_seconds();
        Ok(self.counter_used(user, period, now).await?)
    }
}

#[async_trait]
impl TurnStore for SqliteStore {
    async fn append(
        &self,
        user: &str,
        role: Role,
        text: &str,
    ) -> Result<TurnRecord, HistoryError> {
        Ok(self.insert_turn(user, role, text).await?)
    }

    async fn recent(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        Ok(self.recent_turns(user, limit).await?)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quota_counters (
            counter_id TEXT PRIMARY KEY NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_quota_counters_expires_at
            ON quota_counters(expires_at);

        CREATE TABLE IF NOT EXISTS chat_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_history_user_id
            ON chat_history(user_id, id);",
    )
}

fn delete_expired_counters(
    conn: &rusqlite::Connection,
    now: i64,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM quota_counters WHERE expires_at <= ?1",
        rusqlite::params![now],
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn epoch_to_i64(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX)
}
