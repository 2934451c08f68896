/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::delivery_queue::QueueSettings;
use crate::error::{is_busy, Result, StoreError};
use rand::{thread_rng, Rng};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tracing::warn;

/// Retry policy for transactions that hit SQLITE_BUSY/SQLITE_LOCKED.
/// Backoff doubles from `base_backoff_ms` up to `max_backoff_ms`; once
/// `max_attempts` is spent the write fails with `StoreError::Overloaded`.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            base_backoff_ms: 2,
            max_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub queue: QueueSettings,
}

#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    retry: RetryPolicy,
    queue: QueueSettings,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, EngineConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            retry: config.retry,
            queue: config.queue,
        };
        let conn = store.connect()?;
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn queue_settings(&self) -> QueueSettings {
        self.queue
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    /// Runs `work` inside a single IMMEDIATE transaction. The closure must
    /// not perform non-idempotent side effects outside the transaction: on a
    /// busy/locked failure the whole closure is re-executed against a fresh
    /// transaction, not replayed statement by statement.
    pub fn with_tx<T, F>(&self, mut work: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        let mut conn = self.connect()?;
        for attempt in 0..self.retry.max_attempts {
            let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
                Ok(tx) => tx,
                Err(e) if is_busy(&e) => {
                    self.backoff(attempt);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match work(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) if is_busy(&e) => {
                        self.backoff(attempt);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(StoreError::Sqlite(e)) if is_busy(&e) => {
                    drop(tx);
                    self.backoff(attempt);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            attempts = self.retry.max_attempts,
            "transaction abandoned: busy retry budget exhausted"
        );
        Err(StoreError::Overloaded {
            attempts: self.retry.max_attempts,
        })
    }

    fn backoff(&self, attempt: u32) {
        let base = self.retry.base_backoff_ms.max(1);
        let pow = attempt.min(16);
        let mut ms = base.saturating_mul(1u64 << pow);
        if ms > self.retry.max_backoff_ms {
            ms = self.retry.max_backoff_ms;
        }
        let jitter = thread_rng().gen_range(0..=base);
        thread::sleep(Duration::from_millis(ms + jitter));
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

/// True when `table` already carries a unique index over exactly `columns`
/// (inline UNIQUE constraints show up here as auto-indexes).
pub(crate) fn table_has_unique_index(
    conn: &Connection,
    table: &str,
    columns: &[&str],
) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({table})"))?;
    let indexes = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut want: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    want.sort();
    for (name, unique) in indexes {
        if unique == 0 {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info(\"{name}\")"))?;
        let mut cols = info
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        cols.sort();
        if cols == want {
            return Ok(true);
        }
    }
    Ok(false)
}

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL,
  display_name TEXT NOT NULL DEFAULT '',
  public_key_pem TEXT NULL,
  private_key_pem TEXT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS local_posts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id INTEGER NOT NULL,
  body TEXT NOT NULL,
  object_uri TEXT NULL,
  parent_uri TEXT NOT NULL DEFAULT '',
  reply_count INTEGER NOT NULL DEFAULT 0,
  like_count INTEGER NOT NULL DEFAULT 0,
  boost_count INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  edited_at_ms INTEGER NULL
);

CREATE TABLE IF NOT EXISTS remote_posts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  remote_account_id INTEGER NOT NULL,
  activity_type TEXT NOT NULL DEFAULT 'Create',
  object_uri TEXT NULL,
  parent_uri TEXT NOT NULL DEFAULT '',
  activity_json BLOB NOT NULL,
  content_preview TEXT NOT NULL DEFAULT '',
  reply_count INTEGER NOT NULL DEFAULT 0,
  like_count INTEGER NOT NULL DEFAULT 0,
  boost_count INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  edited_at_ms INTEGER NULL
);

-- The UNIQUE(follower, target) constraint is installed by the
-- dedupe-follows repair (table rebuild), so legacy duplicate edges can be
-- resolved before the constraint exists.
CREATE TABLE IF NOT EXISTS follows (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  follower TEXT NOT NULL,
  target TEXT NOT NULL,
  accepted INTEGER NOT NULL DEFAULT 0,
  is_local INTEGER NOT NULL DEFAULT 0,
  uri TEXT NOT NULL DEFAULT '',
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS remote_accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  actor_uri TEXT NOT NULL UNIQUE,
  inbox TEXT NOT NULL DEFAULT '',
  outbox TEXT NOT NULL DEFAULT '',
  shared_inbox TEXT NOT NULL DEFAULT '',
  public_key_pem TEXT NULL,
  username TEXT NOT NULL DEFAULT '',
  host TEXT NOT NULL DEFAULT '',
  display_name TEXT NOT NULL DEFAULT '',
  summary TEXT NOT NULL DEFAULT '',
  refreshed_at_ms INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS likes (
  account_id INTEGER NOT NULL,
  post_key INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL,
  UNIQUE(account_id, post_key)
);

CREATE TABLE IF NOT EXISTS boosts (
  account_id INTEGER NOT NULL,
  post_key INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL,
  UNIQUE(account_id, post_key)
);

CREATE TABLE IF NOT EXISTS delivery_queue (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  inbox TEXT NOT NULL,
  payload BLOB NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  next_attempt_at_ms INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL,
  status INTEGER NOT NULL DEFAULT 0,
  last_error TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_due ON delivery_queue(status, next_attempt_at_ms);

CREATE TABLE IF NOT EXISTS relay_subscriptions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  actor_uri TEXT NOT NULL UNIQUE,
  inbox_uri TEXT NOT NULL DEFAULT '',
  follow_request_uri TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'pending',
  paused INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  accepted_at_ms INTEGER NULL
);

CREATE TABLE IF NOT EXISTS notifications (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  recipient_id INTEGER NOT NULL,
  kind TEXT NOT NULL,
  actor_ref TEXT NOT NULL DEFAULT '',
  post_id INTEGER NULL,
  read INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS repair_history (
  name TEXT PRIMARY KEY,
  completed_at_ms INTEGER NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use rusqlite::params;

    #[test]
    fn with_tx_commits_on_ok() {
        let (_dir, store) = crate::testutil::open_store();
        store
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO accounts(username, created_at_ms) VALUES (?1, ?2)",
                    params!["mira", now_ms()],
                )?;
                Ok(())
            })
            .expect("commit");
        let conn = store.connect().expect("connect");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let (_dir, store) = crate::testutil::open_store();
        let res: crate::error::Result<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO accounts(username, created_at_ms) VALUES (?1, ?2)",
                params!["mira", now_ms()],
            )?;
            Err(StoreError::NotFound)
        });
        assert!(res.is_err());
        let conn = store.connect().expect("connect");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn unique_index_detection_sees_inline_constraints() {
        let (_dir, store) = crate::testutil::open_store();
        let conn = store.connect().expect("connect");
        assert!(table_has_unique_index(&conn, "likes", &["account_id", "post_key"]).expect("probe"));
        assert!(!table_has_unique_index(&conn, "follows", &["follower", "target"]).expect("probe"));
    }

    #[test]
    fn ensure_columns_is_additive_and_idempotent() {
        let (_dir, store) = crate::testutil::open_store();
        let conn = store.connect().expect("connect");
        ensure_columns(&conn, "accounts", &[("pronouns", "TEXT NULL")]).expect("add");
        ensure_columns(&conn, "accounts", &[("pronouns", "TEXT NULL")]).expect("again");
        conn.execute(
            "INSERT INTO accounts(username, pronouns, created_at_ms) VALUES ('mira', 'she/her', 1)",
            [],
        )
        .expect("insert with new column");
    }
}
