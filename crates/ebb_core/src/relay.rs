/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{conflict_on_unique, Result, StoreError};
use crate::store::{now_ms, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Pending,
    Active,
    Rejected,
}

impl RelayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayStatus::Pending => "pending",
            RelayStatus::Active => "active",
            RelayStatus::Rejected => "rejected",
        }
    }

    /// Unknown status strings collapse into `Rejected`; the subscription is
    /// unusable either way.
    pub fn from_str(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "pending" => RelayStatus::Pending,
            "active" | "accepted" => RelayStatus::Active,
            _ => RelayStatus::Rejected,
        }
    }
}

/// A relay the node subscribes to. `paused` suppresses delivery without
/// touching the subscription status; the two axes are independent.
#[derive(Debug, Clone)]
pub struct RelaySubscription {
    pub id: i64,
    pub actor_uri: String,
    pub inbox_uri: String,
    pub follow_request_uri: String,
    pub status: RelayStatus,
    pub paused: bool,
    pub created_at_ms: i64,
    pub accepted_at_ms: Option<i64>,
}

const RELAY_COLS: &str =
    "id, actor_uri, inbox_uri, follow_request_uri, status, paused, created_at_ms, accepted_at_ms";

fn relay_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelaySubscription> {
    Ok(RelaySubscription {
        id: row.get(0)?,
        actor_uri: row.get(1)?,
        inbox_uri: row.get(2)?,
        follow_request_uri: row.get(3)?,
        status: RelayStatus::from_str(&row.get::<_, String>(4)?),
        paused: row.get::<_, i64>(5)? != 0,
        created_at_ms: row.get(6)?,
        accepted_at_ms: row.get(7)?,
    })
}

fn lookup_relay(conn: &Connection, id: i64) -> Result<Option<RelaySubscription>> {
    conn.query_row(
        &format!("SELECT {RELAY_COLS} FROM relay_subscriptions WHERE id=?1"),
        params![id],
        relay_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn list_relays(conn: &Connection, filter: &str) -> Result<Vec<RelaySubscription>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RELAY_COLS} FROM relay_subscriptions {filter} ORDER BY created_at_ms ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], relay_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl Store {
    /// Records a new relay subscription in the pending state.
    pub fn create_relay_subscription(
        &self,
        actor_uri: &str,
        inbox_uri: &str,
        follow_request_uri: &str,
    ) -> Result<RelaySubscription> {
        let actor_uri = actor_uri.trim().to_string();
        let inbox_uri = inbox_uri.trim().to_string();
        let follow_request_uri = follow_request_uri.trim().to_string();
        if actor_uri.is_empty() {
            return Err(StoreError::NotFound);
        }
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO relay_subscriptions(actor_uri, inbox_uri, follow_request_uri, \
                 status, created_at_ms) VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![actor_uri, inbox_uri, follow_request_uri, now_ms()],
            )
            .map_err(|e| conflict_on_unique(e, "relay subscription"))?;
            lookup_relay(tx, tx.last_insert_rowid())?.ok_or(StoreError::NotFound)
        })
    }

    pub fn relay_subscription(&self, id: i64) -> Result<RelaySubscription> {
        let conn = self.connect()?;
        lookup_relay(&conn, id)?.ok_or(StoreError::NotFound)
    }

    pub fn relay_subscription_by_actor(&self, actor_uri: &str) -> Result<RelaySubscription> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {RELAY_COLS} FROM relay_subscriptions WHERE actor_uri=?1"),
            params![actor_uri.trim()],
            relay_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Transitions the subscription whose follow request matches to the
    /// active state, stamping the acceptance time.
    pub fn activate_relay_subscription(&self, follow_request_uri: &str) -> Result<()> {
        let uri = follow_request_uri.trim().to_string();
        if uri.is_empty() {
            return Err(StoreError::NotFound);
        }
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE relay_subscriptions SET status='active', accepted_at_ms=?2 \
                 WHERE follow_request_uri=?1",
                params![uri, now_ms()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn update_relay_status(&self, id: i64, status: RelayStatus) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE relay_subscriptions SET status=?2 WHERE id=?1",
                params![id, status.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Pauses or resumes delivery to a relay without altering its status.
    pub fn set_relay_paused(&self, id: i64, paused: bool) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE relay_subscriptions SET paused=?2 WHERE id=?1",
                params![id, if paused { 1 } else { 0 }],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn delete_relay_subscription(&self, id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute("DELETE FROM relay_subscriptions WHERE id=?1", params![id])?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn relay_subscriptions(&self) -> Result<Vec<RelaySubscription>> {
        let conn = self.connect()?;
        list_relays(&conn, "")
    }

    pub fn active_relay_subscriptions(&self) -> Result<Vec<RelaySubscription>> {
        let conn = self.connect()?;
        list_relays(&conn, "WHERE status='active'")
    }

    /// Active subscriptions that delivery should actually fan out to.
    pub fn unpaused_active_relay_subscriptions(&self) -> Result<Vec<RelaySubscription>> {
        let conn = self.connect()?;
        list_relays(&conn, "WHERE status='active' AND paused=0")
    }
}
