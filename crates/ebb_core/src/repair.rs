/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::engagement::propagate_reply_delta;
use crate::error::{is_busy, Result, StoreError};
use crate::payload;
use crate::posts::{is_duplicate_echo, remote_post_from_row, Post, REMOTE_POST_COLS};
use crate::store::{ensure_columns, now_ms, table_has_unique_index, Store};

pub(crate) const USERNAME_MAX_BYTES: usize = 32;

type RepairFn = fn(&Connection) -> Result<()>;

struct RepairStep {
    name: &'static str,
    /// Run-once steps are skipped when `repair_history` records them.
    once: bool,
    run: RepairFn,
}

// Order matters: object URIs must be backfilled before the orphaned-Update
// repair (it groups by canonical URI) and before the counter backfill (echo
// detection needs URIs).
const REPAIR_STEPS: &[RepairStep] = &[
    RepairStep {
        name: "ensure-columns",
        once: false,
        run: ensure_schema_columns,
    },
    RepairStep {
        name: "dedupe-usernames",
        once: false,
        run: dedupe_usernames,
    },
    RepairStep {
        name: "dedupe-follows",
        once: false,
        run: dedupe_follows,
    },
    RepairStep {
        name: "backfill-object-uris",
        once: false,
        run: backfill_object_uris,
    },
    RepairStep {
        name: "repair-orphaned-updates",
        once: false,
        run: repair_orphaned_updates,
    },
    RepairStep {
        name: "backfill-reply-counts",
        once: true,
        run: backfill_reply_counts,
    },
];

fn repair_completed(conn: &Connection, name: &str) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT completed_at_ms FROM repair_history WHERE name=?1",
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

fn record_repair(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO repair_history(name, completed_at_ms) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET completed_at_ms=excluded.completed_at_ms",
        params![name, now_ms()],
    )?;
    Ok(())
}

impl Store {
    /// Runs the ordered repair pass. Safe to call on every boot: every step
    /// is idempotent and runs under its own savepoint, so a failing step
    /// rolls back alone, gets logged, and never blocks server startup.
    pub fn run_migrations(&self) -> Result<()> {
        self.with_tx(|tx| {
            for step in REPAIR_STEPS {
                if step.once && repair_completed(tx, step.name)? {
                    continue;
                }
                tx.execute_batch(&format!("SAVEPOINT \"{}\"", step.name))?;
                match (step.run)(tx) {
                    Ok(()) => {
                        record_repair(tx, step.name)?;
                        tx.execute_batch(&format!("RELEASE \"{}\"", step.name))?;
                    }
                    Err(e) => {
                        if let StoreError::Sqlite(se) = &e {
                            if is_busy(se) {
                                return Err(e);
                            }
                        }
                        warn!(step = step.name, "repair step failed: {e}");
                        tx.execute_batch(&format!(
                            "ROLLBACK TO \"{name}\"; RELEASE \"{name}\"",
                            name = step.name
                        ))?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Installs the hot-path indexes. Split out of the repair pass so
    /// operators can run it on demand against large databases.
    pub fn run_performance_index_migration(&self) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_local_posts_parent ON local_posts(parent_uri);
                 CREATE INDEX IF NOT EXISTS idx_local_posts_uri ON local_posts(object_uri);
                 CREATE INDEX IF NOT EXISTS idx_remote_posts_parent ON remote_posts(parent_uri);
                 CREATE INDEX IF NOT EXISTS idx_remote_posts_uri ON remote_posts(object_uri);
                 CREATE INDEX IF NOT EXISTS idx_follows_target ON follows(target);
                 CREATE INDEX IF NOT EXISTS idx_notifications_recipient \
                     ON notifications(recipient_id, created_at_ms DESC);",
            )?;
            Ok(())
        })
    }

    /// Re-encodes key material stored in the legacy PKCS#1 PEM form as
    /// PKCS#8. Rows that fail to parse are logged and left untouched.
    pub fn run_key_format_migration(&self) -> Result<()> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, private_key_pem FROM accounts \
                 WHERE private_key_pem LIKE '%BEGIN RSA PRIVATE KEY%'",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (id, pem) in rows {
                match convert_private_pem(&pem) {
                    Ok(converted) => {
                        tx.execute(
                            "UPDATE accounts SET private_key_pem=?1 WHERE id=?2",
                            params![converted, id],
                        )?;
                    }
                    Err(e) => warn!(id, "skipping unconvertible private key: {e}"),
                }
            }

            let mut stmt = tx.prepare(
                "SELECT id, public_key_pem FROM remote_accounts \
                 WHERE public_key_pem LIKE '%BEGIN RSA PUBLIC KEY%'",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (id, pem) in rows {
                match convert_public_pem(&pem) {
                    Ok(converted) => {
                        tx.execute(
                            "UPDATE remote_accounts SET public_key_pem=?1 WHERE id=?2",
                            params![converted, id],
                        )?;
                    }
                    Err(e) => warn!(id, "skipping unconvertible public key: {e}"),
                }
            }
            Ok(())
        })
    }
}

fn convert_private_pem(pem: &str) -> anyhow::Result<String> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    let key = rsa::RsaPrivateKey::from_pkcs1_pem(pem)?;
    Ok(key.to_pkcs8_pem(LineEnding::LF)?.to_string())
}

fn convert_public_pem(pem: &str) -> anyhow::Result<String> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    let key = rsa::RsaPublicKey::from_pkcs1_pem(pem)?;
    Ok(key.to_public_key_pem(LineEnding::LF)?)
}

fn ensure_schema_columns(conn: &Connection) -> Result<()> {
    ensure_columns(
        conn,
        "accounts",
        &[
            ("display_name", "TEXT NOT NULL DEFAULT ''"),
            ("public_key_pem", "TEXT NULL"),
            ("private_key_pem", "TEXT NULL"),
        ],
    )?;
    ensure_columns(
        conn,
        "remote_posts",
        &[
            ("content_preview", "TEXT NOT NULL DEFAULT ''"),
            ("edited_at_ms", "INTEGER NULL"),
        ],
    )?;
    ensure_columns(
        conn,
        "delivery_queue",
        &[
            ("status", "INTEGER NOT NULL DEFAULT 0"),
            ("last_error", "TEXT NULL"),
        ],
    )?;
    ensure_columns(
        conn,
        "relay_subscriptions",
        &[
            ("paused", "INTEGER NOT NULL DEFAULT 0"),
            ("accepted_at_ms", "INTEGER NULL"),
        ],
    )
}

/// Groups accounts case-insensitively by username; in each group the
/// earliest-created account keeps its name and the rest are renamed `_2`,
/// `_3`, … in creation order, truncating the base so the result fits the
/// storage limit. The case-insensitive unique index is installed afterwards.
fn dedupe_usernames(conn: &Connection) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT id, username FROM accounts ORDER BY created_at_ms ASC, id ASC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut groups: HashMap<String, Vec<(i64, String)>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();
    for (id, name) in rows {
        let key = name.to_lowercase();
        taken.insert(key.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push((id, name));
    }

    for key in order {
        let members = &groups[&key];
        if members.len() < 2 {
            continue;
        }
        for (n, (id, name)) in members.iter().enumerate().skip(1) {
            let mut suffix = n + 1;
            let renamed = loop {
                let candidate = suffixed_username(name, suffix);
                if taken.insert(candidate.to_lowercase()) {
                    break candidate;
                }
                suffix += 1;
            };
            conn.execute(
                "UPDATE accounts SET username=?1 WHERE id=?2",
                params![renamed, id],
            )?;
        }
    }

    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_username_nocase \
         ON accounts(username COLLATE NOCASE);",
    )?;
    Ok(())
}

fn suffixed_username(base: &str, n: usize) -> String {
    let suffix = format!("_{n}");
    let room = USERNAME_MAX_BYTES.saturating_sub(suffix.len());
    let mut end = base.len().min(room);
    while end > 0 && !base.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &base[..end], suffix)
}

/// Keeps the earliest follow edge per (follower, target) pair, drops the
/// rest, then rebuilds the table under a uniqueness constraint. Skipped
/// entirely once the constraint exists.
fn dedupe_follows(conn: &Connection) -> Result<()> {
    if table_has_unique_index(conn, "follows", &["follower", "target"])? {
        return Ok(());
    }

    let mut stmt =
        conn.prepare("SELECT id, follower, target FROM follows ORDER BY created_at_ms ASC, id ASC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut seen: HashSet<(String, String)> = HashSet::new();
    for (id, follower, target) in rows {
        if !seen.insert((follower, target)) {
            conn.execute("DELETE FROM follows WHERE id=?1", params![id])?;
        }
    }

    conn.execute_batch(
        "CREATE TABLE follows_unique (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            follower TEXT NOT NULL,
            target TEXT NOT NULL,
            accepted INTEGER NOT NULL DEFAULT 0,
            is_local INTEGER NOT NULL DEFAULT 0,
            uri TEXT NOT NULL DEFAULT '',
            created_at_ms INTEGER NOT NULL,
            UNIQUE(follower, target)
         );
         INSERT OR IGNORE INTO follows_unique(id, follower, target, accepted, is_local, uri, created_at_ms)
             SELECT id, follower, target, accepted, is_local, uri, created_at_ms
             FROM follows ORDER BY created_at_ms ASC, id ASC;
         DROP TABLE follows;
         ALTER TABLE follows_unique RENAME TO follows;",
    )?;
    Ok(())
}

/// Populates the canonical URI column for activities stored before
/// extraction existed. Malformed payloads are skipped.
fn backfill_object_uris(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT id, activity_json FROM remote_posts WHERE object_uri IS NULL OR object_uri=''")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (id, json) in rows {
        match payload::object_uri(&json) {
            Some(uri) => {
                conn.execute(
                    "UPDATE remote_posts SET object_uri=?1 WHERE id=?2",
                    params![uri, id],
                )?;
            }
            None => debug!(id, "activity payload has no extractable object uri"),
        }
    }
    Ok(())
}

/// An Update whose canonical URI never saw a Create (the peer was followed
/// after the fact) is invisible in listings; the earliest such Update per
/// URI becomes the Create.
fn repair_orphaned_updates(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, object_uri FROM remote_posts \
         WHERE activity_type='Update' AND object_uri IS NOT NULL AND object_uri<>'' \
           AND object_uri NOT IN (SELECT object_uri FROM remote_posts \
                                  WHERE activity_type='Create' AND object_uri IS NOT NULL) \
         ORDER BY created_at_ms ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut converted: HashSet<String> = HashSet::new();
    for (id, uri) in rows {
        if !converted.insert(uri) {
            continue;
        }
        conn.execute(
            "UPDATE remote_posts SET activity_type='Create' WHERE id=?1",
            params![id],
        )?;
    }
    Ok(())
}

/// First-boot counter backfill: when no post carries a positive reply count
/// yet, replay ancestor propagation for every reply edge across both
/// representations, excluding duplicate echoes.
fn backfill_reply_counts(conn: &Connection) -> Result<()> {
    let positive: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM local_posts WHERE reply_count>0) \
              + (SELECT COUNT(*) FROM remote_posts WHERE reply_count>0)",
        [],
        |r| r.get(0),
    )?;
    if positive > 0 {
        return Ok(());
    }

    let mut stmt = conn.prepare("SELECT parent_uri FROM local_posts WHERE parent_uri<>''")?;
    let local_parents = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for parent in local_parents {
        propagate_reply_delta(conn, &parent, 1)?;
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {REMOTE_POST_COLS} FROM remote_posts WHERE activity_type='Create'"
    ))?;
    let remotes = stmt
        .query_map([], remote_post_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for post in remotes {
        if is_duplicate_echo(conn, &post)? {
            continue;
        }
        let parent = Post::Remote(post).parent_uri();
        if parent.is_empty() {
            continue;
        }
        propagate_reply_delta(conn, &parent, 1)?;
    }
    Ok(())
}
