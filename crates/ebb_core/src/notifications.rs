/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection};

use crate::error::{Result, StoreError};
use crate::store::{now_ms, Store};

/// Denormalized fan-out record. Read-mostly; the only invariant is
/// recipient ownership.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: i64,
    pub recipient_id: i64,
    pub kind: String,
    pub actor_ref: String,
    pub post_id: Option<i64>,
    pub read: bool,
    pub created_at_ms: i64,
}

fn notification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        kind: row.get(2)?,
        actor_ref: row.get(3)?,
        post_id: row.get(4)?,
        read: row.get::<_, i64>(5)? != 0,
        created_at_ms: row.get(6)?,
    })
}

pub(crate) fn push_notification_tx(
    conn: &Connection,
    recipient_id: i64,
    kind: &str,
    actor_ref: &str,
    post_id: Option<i64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO notifications(recipient_id, kind, actor_ref, post_id, created_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![recipient_id, kind, actor_ref, post_id, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    pub fn push_notification(
        &self,
        recipient_id: i64,
        kind: &str,
        actor_ref: &str,
        post_id: Option<i64>,
    ) -> Result<i64> {
        self.with_tx(|tx| push_notification_tx(tx, recipient_id, kind, actor_ref, post_id))
    }

    pub fn notifications_for(&self, recipient_id: i64, limit: u32) -> Result<Vec<Notification>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, recipient_id, kind, actor_ref, post_id, read, created_at_ms \
             FROM notifications WHERE recipient_id=?1 \
             ORDER BY created_at_ms DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![recipient_id, limit.max(1)], notification_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_notification_read(&self, id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute("UPDATE notifications SET read=1 WHERE id=?1", params![id])?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn mark_all_notifications_read(&self, recipient_id: i64) -> Result<u64> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE notifications SET read=1 WHERE recipient_id=?1 AND read=0",
                params![recipient_id],
            )?;
            Ok(n as u64)
        })
    }

    pub fn unread_notification_count(&self, recipient_id: i64) -> Result<u64> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id=?1 AND read=0",
            params![recipient_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }
}
