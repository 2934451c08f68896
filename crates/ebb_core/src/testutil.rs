/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::Store;
use tempfile::TempDir;

/// A store with the base schema only. Repair tests seed legacy data through
/// `raw` before running the migration pass themselves.
pub(crate) fn open_store() -> (TempDir, Store) {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("ebb.db")).expect("open store");
    (dir, store)
}

/// A store the way embedders boot it: schema plus the full repair pass.
pub(crate) fn migrated_store() -> (TempDir, Store) {
    let (dir, store) = open_store();
    store.run_migrations().expect("run migrations");
    (dir, store)
}

pub(crate) fn raw(store: &Store) -> rusqlite::Connection {
    store.connect().expect("connect")
}

/// A Create-Note activity payload in the shape peers actually send.
pub(crate) fn create_note_activity(id: &str, in_reply_to: Option<&str>, content: &str) -> Vec<u8> {
    let mut object = serde_json::json!({
        "id": id,
        "type": "Note",
        "content": content,
    });
    if let Some(parent) = in_reply_to {
        object["inReplyTo"] = serde_json::json!(parent);
    }
    serde_json::to_vec(&serde_json::json!({
        "id": format!("{id}/activity"),
        "type": "Create",
        "actor": "https://peer.example/users/remy",
        "object": object,
    }))
    .expect("serialize activity")
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
