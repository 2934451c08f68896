/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{rngs::OsRng, RngCore};
use reqwest::{header::CONTENT_TYPE, StatusCode};
use rusqlite::{params, OptionalExtension};
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::store::{now_ms, Store};

const STATUS_PENDING: i64 = 0;
const STATUS_DEAD: i64 = 2;

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub lease_limit: u32,
    pub idle_poll_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
            lease_limit: 40,
            idle_poll_secs: 2,
        }
    }
}

/// One outbound delivery. Rows are deleted only on acknowledge; a failed
/// delivery is rescheduled until it dead-letters at `max_attempts`.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub id: i64,
    pub inbox: String,
    pub payload: Vec<u8>,
    pub attempts: i64,
    pub next_attempt_at_ms: i64,
    pub created_at_ms: i64,
    pub last_error: Option<String>,
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryItem> {
    Ok(DeliveryItem {
        id: row.get(0)?,
        inbox: row.get(1)?,
        payload: row.get(2)?,
        attempts: row.get(3)?,
        next_attempt_at_ms: row.get(4)?,
        created_at_ms: row.get(5)?,
        last_error: row.get(6)?,
    })
}

const ITEM_COLS: &str = "id, inbox, payload, attempts, next_attempt_at_ms, created_at_ms, last_error";

impl Store {
    /// Appends a delivery due immediately.
    pub fn enqueue(&self, inbox: &str, payload: &[u8]) -> Result<i64> {
        let inbox = inbox.trim().to_string();
        if inbox.is_empty() {
            return Err(StoreError::NotFound);
        }
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO delivery_queue(inbox, payload, next_attempt_at_ms, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![inbox, payload, now_ms()],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Pending deliveries whose retry time has passed, oldest first. No
    /// priority lanes; the queue is fair by creation time.
    pub fn lease_due(&self, limit: u32) -> Result<Vec<DeliveryItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM delivery_queue \
             WHERE status=?1 AND next_attempt_at_ms<=?2 \
             ORDER BY created_at_ms ASC, id ASC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![STATUS_PENDING, now_ms(), limit.max(1)], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Counts one failed attempt and reschedules the item; once the attempt
    /// counter reaches the configured maximum the item moves to the
    /// dead-letter state instead of being retried forever.
    pub fn record_attempt(&self, id: i64, next_retry_at_ms: i64, last_error: &str) -> Result<()> {
        let max = self.queue_settings().max_attempts as i64;
        self.with_tx(|tx| {
            let attempts: Option<i64> = tx
                .query_row(
                    "SELECT attempts FROM delivery_queue WHERE id=?1 AND status=?2",
                    params![id, STATUS_PENDING],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(attempts) = attempts else {
                return Err(StoreError::NotFound);
            };
            let attempts = attempts + 1;
            if attempts >= max {
                tx.execute(
                    "UPDATE delivery_queue SET attempts=?2, status=?3, last_error=?4 WHERE id=?1",
                    params![id, attempts, STATUS_DEAD, last_error],
                )?;
                warn!(id, attempts, "delivery dead-lettered");
            } else {
                tx.execute(
                    "UPDATE delivery_queue SET attempts=?2, next_attempt_at_ms=?3, last_error=?4 \
                     WHERE id=?1",
                    params![id, attempts, next_retry_at_ms, last_error],
                )?;
            }
            Ok(())
        })
    }

    /// Deletes an item on confirmed delivery.
    pub fn acknowledge(&self, id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute("DELETE FROM delivery_queue WHERE id=?1", params![id])?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Moves an item straight to the dead-letter state, keeping the error.
    pub fn dead_letter(&self, id: i64, last_error: &str) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE delivery_queue SET status=?2, last_error=?3 WHERE id=?1",
                params![id, STATUS_DEAD, last_error],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn dead_letters(&self, limit: u32) -> Result<Vec<DeliveryItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM delivery_queue WHERE status=?1 \
             ORDER BY created_at_ms ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![STATUS_DEAD, limit.max(1)], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn pending_deliveries(&self) -> Result<u64> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM delivery_queue WHERE status=?1",
            params![STATUS_PENDING],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }
}

enum PushOutcome {
    Delivered,
    Rejected(String),
    Failed(String),
}

/// Drives the queue: leases due items, POSTs them to their destination
/// inbox, and acknowledges or reschedules. Embedders start one of these and
/// call `notify` after enqueueing to skip the idle poll interval.
#[derive(Clone)]
pub struct DeliveryWorker {
    store: Store,
    client: reqwest::Client,
    notify: Arc<Notify>,
    settings: QueueSettings,
}

impl DeliveryWorker {
    pub fn new(store: Store) -> Self {
        let settings = store.queue_settings();
        Self {
            store,
            client: reqwest::Client::new(),
            notify: Arc::new(Notify::new()),
            settings,
        }
    }

    /// Wakes the worker before its next poll tick.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run_loop(shutdown).await {
                warn!("delivery worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!("delivery worker started");
        let tick = Duration::from_secs(self.settings.idle_poll_secs.max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let items = self
                .blocking({
                    let limit = self.settings.lease_limit;
                    move |store| store.lease_due(limit)
                })
                .await?;

            if items.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for item in items {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.process_one(item).await {
                    warn!("delivery error: {e:#}");
                }
            }
        }
        Ok(())
    }

    async fn process_one(&self, item: DeliveryItem) -> anyhow::Result<()> {
        let id = item.id;
        let attempt_no = (item.attempts as u32).saturating_add(1);
        match self.push(&item).await {
            PushOutcome::Delivered => {
                debug!(id, inbox = %item.inbox, "delivered");
                self.blocking(move |store| store.acknowledge(id)).await?;
            }
            PushOutcome::Rejected(reason) => {
                info!(id, inbox = %item.inbox, %reason, "destination rejected delivery");
                let _ = self
                    .blocking(move |store| store.dead_letter(id, &reason))
                    .await;
            }
            PushOutcome::Failed(reason) => {
                let delay = next_backoff(
                    attempt_no,
                    self.settings.base_backoff_secs,
                    self.settings.max_backoff_secs,
                );
                let next = now_ms().saturating_add(delay.as_millis() as i64);
                debug!(id, attempt_no, %reason, "delivery failed; rescheduling");
                let _ = self
                    .blocking(move |store| store.record_attempt(id, next, &reason))
                    .await;
            }
        }
        Ok(())
    }

    async fn push(&self, item: &DeliveryItem) -> PushOutcome {
        let res = self
            .client
            .post(&item.inbox)
            .header(CONTENT_TYPE, "application/activity+json")
            .body(item.payload.clone())
            .send()
            .await;
        match res {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    PushOutcome::Delivered
                } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    PushOutcome::Rejected(format!("inbox gone: {status}"))
                } else {
                    PushOutcome::Failed(format!("http status {status}"))
                }
            }
            Err(e) => PushOutcome::Failed(e.to_string()),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(store)).await??)
    }
}

fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EngineConfig;
    use crate::testutil::migrated_store;

    #[test]
    fn lease_respects_due_time_and_order() {
        let (_dir, store) = migrated_store();
        let first = store
            .enqueue("https://peer.example/inbox", b"activity-1")
            .expect("enqueue");
        let second = store
            .enqueue("https://other.example/inbox", b"activity-2")
            .expect("enqueue");

        let leased = store.lease_due(1).expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, first);

        let leased = store.lease_due(10).expect("lease all");
        assert_eq!(
            leased.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![first, second]
        );
    }

    #[test]
    fn record_attempt_hides_the_item_until_due() {
        let (_dir, store) = migrated_store();
        let id = store
            .enqueue("https://peer.example/inbox", b"activity")
            .expect("enqueue");

        let leased = store.lease_due(1).expect("lease");
        assert_eq!(leased.len(), 1);

        store
            .record_attempt(id, now_ms() + 60_000, "connect refused")
            .expect("record");
        assert!(store.lease_due(10).expect("lease").is_empty());

        // rescheduling into the past makes it due again
        store
            .record_attempt(id, now_ms() - 1, "connect refused")
            .expect("record");
        let leased = store.lease_due(10).expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 2);
        assert_eq!(leased[0].last_error.as_deref(), Some("connect refused"));
    }

    #[test]
    fn acknowledge_deletes_the_row() {
        let (_dir, store) = migrated_store();
        let id = store
            .enqueue("https://peer.example/inbox", b"activity")
            .expect("enqueue");
        assert_eq!(store.pending_deliveries().expect("count"), 1);

        store.acknowledge(id).expect("ack");
        assert_eq!(store.pending_deliveries().expect("count"), 0);
        assert!(store.acknowledge(id).expect_err("gone").is_not_found());
    }

    #[test]
    fn items_dead_letter_at_max_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.queue.max_attempts = 3;
        let store = Store::open_with(dir.path().join("ebb.db"), config).expect("open");
        store.run_migrations().expect("migrations");

        let id = store
            .enqueue("https://peer.example/inbox", b"activity")
            .expect("enqueue");
        store.record_attempt(id, 0, "try 1").expect("attempt 1");
        store.record_attempt(id, 0, "try 2").expect("attempt 2");
        store
            .record_attempt(id, 0, "try 3")
            .expect("attempt 3 dead-letters");

        assert!(store.lease_due(10).expect("lease").is_empty());
        let dead = store.dead_letters(10).expect("dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].last_error.as_deref(), Some("try 3"));

        // dead items are no longer retryable
        assert!(store
            .record_attempt(id, 0, "again")
            .expect_err("dead")
            .is_not_found());
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let base = next_backoff(1, 5, 3600);
        assert!(base >= Duration::from_secs(5) && base < Duration::from_secs(7));
        let later = next_backoff(6, 5, 3600);
        assert!(later >= Duration::from_secs(160) && later < Duration::from_secs(162));
        let capped = next_backoff(30, 5, 3600);
        assert!(capped >= Duration::from_secs(3600) && capped < Duration::from_secs(3602));
    }

    #[tokio::test]
    async fn worker_exits_when_shutdown_is_set() {
        let (_dir, store) = migrated_store();
        let worker = DeliveryWorker::new(store);
        let (tx, rx) = watch::channel(true);
        worker.run_loop(rx).await.expect("run loop");
        drop(tx);
    }
}
