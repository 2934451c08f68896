/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::payload;
use crate::store::{now_ms, Store};

/// Synthetic address form for posts that have no canonical URI yet. Replies
/// created before their parent federates reference the parent as
/// `local:<id>`, and that form stays resolvable afterwards.
pub const LOCAL_URI_PREFIX: &str = "local:";

pub fn local_uri(id: i64) -> String {
    format!("{LOCAL_URI_PREFIX}{id}")
}

pub(crate) fn local_id_from_synthetic(uri: &str) -> Option<i64> {
    uri.strip_prefix(LOCAL_URI_PREFIX)?.parse().ok()
}

/// Recognizes the `…/posts/<id>` path form under which local posts federate,
/// yielding the embedded local identifier.
pub(crate) fn embedded_local_id(uri: &str) -> Option<i64> {
    if !uri.contains("://") {
        return None;
    }
    let mut segments = uri.trim_end_matches('/').rsplit('/');
    let id: i64 = segments.next()?.parse().ok()?;
    if segments.next()? == "posts" {
        Some(id)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct LocalPost {
    pub id: i64,
    pub account_id: i64,
    pub body: String,
    pub object_uri: Option<String>,
    pub parent_uri: String,
    pub reply_count: i64,
    pub like_count: i64,
    pub boost_count: i64,
    pub created_at_ms: i64,
    pub edited_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RemotePost {
    pub id: i64,
    pub remote_account_id: i64,
    pub activity_type: String,
    pub object_uri: Option<String>,
    pub parent_uri: String,
    pub activity_json: Vec<u8>,
    pub content_preview: String,
    pub reply_count: i64,
    pub like_count: i64,
    pub boost_count: i64,
    pub created_at_ms: i64,
    pub edited_at_ms: Option<i64>,
}

/// A post, whichever physical form it is stored under. All graph traversal
/// resolves through this one view rather than consulting the two tables ad
/// hoc.
#[derive(Debug, Clone)]
pub enum Post {
    Local(LocalPost),
    Remote(RemotePost),
}

impl Post {
    pub fn object_uri(&self) -> Option<&str> {
        match self {
            Post::Local(p) => p.object_uri.as_deref(),
            Post::Remote(p) => p.object_uri.as_deref(),
        }
    }

    /// The parent reference of this post; empty when it is not a reply.
    /// Remote rows ingested before parent extraction existed fall back to
    /// the `inReplyTo` field of the stored payload.
    pub fn parent_uri(&self) -> String {
        match self {
            Post::Local(p) => p.parent_uri.clone(),
            Post::Remote(p) => {
                if !p.parent_uri.is_empty() {
                    p.parent_uri.clone()
                } else {
                    payload::parent_uri(&p.activity_json).unwrap_or_default()
                }
            }
        }
    }

    pub fn reply_count(&self) -> i64 {
        match self {
            Post::Local(p) => p.reply_count,
            Post::Remote(p) => p.reply_count,
        }
    }

    pub fn like_count(&self) -> i64 {
        match self {
            Post::Local(p) => p.like_count,
            Post::Remote(p) => p.like_count,
        }
    }

    pub fn boost_count(&self) -> i64 {
        match self {
            Post::Local(p) => p.boost_count,
            Post::Remote(p) => p.boost_count,
        }
    }

    /// Every address this post is reachable under.
    pub(crate) fn addresses(&self) -> Vec<String> {
        match self {
            Post::Local(p) => {
                let mut out = vec![local_uri(p.id)];
                if let Some(uri) = p.object_uri.as_deref() {
                    if !uri.is_empty() {
                        out.push(uri.to_string());
                    }
                }
                out
            }
            Post::Remote(p) => match p.object_uri.as_deref() {
                Some(uri) if !uri.is_empty() => vec![uri.to_string()],
                _ => Vec::new(),
            },
        }
    }

    /// Identity key for visited-set bookkeeping, stable across the several
    /// address forms a post can be reached under.
    pub(crate) fn visit_key(&self) -> String {
        match self {
            Post::Local(p) => format!("local#{}", p.id),
            Post::Remote(p) => format!("remote#{}", p.id),
        }
    }
}

pub(crate) const LOCAL_POST_COLS: &str = "id, account_id, body, object_uri, parent_uri, \
     reply_count, like_count, boost_count, created_at_ms, edited_at_ms";

pub(crate) const REMOTE_POST_COLS: &str = "id, remote_account_id, activity_type, object_uri, \
     parent_uri, activity_json, content_preview, reply_count, like_count, boost_count, \
     created_at_ms, edited_at_ms";

pub(crate) fn local_post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalPost> {
    Ok(LocalPost {
        id: row.get(0)?,
        account_id: row.get(1)?,
        body: row.get(2)?,
        object_uri: row.get(3)?,
        parent_uri: row.get(4)?,
        reply_count: row.get(5)?,
        like_count: row.get(6)?,
        boost_count: row.get(7)?,
        created_at_ms: row.get(8)?,
        edited_at_ms: row.get(9)?,
    })
}

pub(crate) fn remote_post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemotePost> {
    Ok(RemotePost {
        id: row.get(0)?,
        remote_account_id: row.get(1)?,
        activity_type: row.get(2)?,
        object_uri: row.get(3)?,
        parent_uri: row.get(4)?,
        activity_json: row.get(5)?,
        content_preview: row.get(6)?,
        reply_count: row.get(7)?,
        like_count: row.get(8)?,
        boost_count: row.get(9)?,
        created_at_ms: row.get(10)?,
        edited_at_ms: row.get(11)?,
    })
}

pub(crate) fn lookup_local_post(conn: &Connection, id: i64) -> Result<Option<LocalPost>> {
    conn.query_row(
        &format!("SELECT {LOCAL_POST_COLS} FROM local_posts WHERE id=?1"),
        params![id],
        local_post_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn lookup_local_post_by_uri(conn: &Connection, uri: &str) -> Result<Option<LocalPost>> {
    conn.query_row(
        &format!("SELECT {LOCAL_POST_COLS} FROM local_posts WHERE object_uri=?1"),
        params![uri],
        local_post_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn lookup_remote_post(conn: &Connection, id: i64) -> Result<Option<RemotePost>> {
    conn.query_row(
        &format!("SELECT {REMOTE_POST_COLS} FROM remote_posts WHERE id=?1"),
        params![id],
        remote_post_from_row,
    )
    .optional()
    .map_err(Into::into)
}

// Create rows are the post nodes; Update rows for the same URI must not
// shadow them.
pub(crate) fn lookup_remote_post_by_uri(
    conn: &Connection,
    uri: &str,
) -> Result<Option<RemotePost>> {
    conn.query_row(
        &format!(
            "SELECT {REMOTE_POST_COLS} FROM remote_posts WHERE object_uri=?1 \
             ORDER BY (activity_type='Create') DESC, created_at_ms ASC, id ASC LIMIT 1"
        ),
        params![uri],
        remote_post_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Unified post resolution. Order: synthetic `local:<id>` form, exact local
/// URI, exact remote URI, then the `…/posts/<id>` path form. Empty input
/// never resolves.
pub(crate) fn lookup_post_by_uri(conn: &Connection, uri: &str) -> Result<Option<Post>> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Ok(None);
    }
    if let Some(id) = local_id_from_synthetic(uri) {
        return Ok(lookup_local_post(conn, id)?.map(Post::Local));
    }
    if let Some(post) = lookup_local_post_by_uri(conn, uri)? {
        return Ok(Some(Post::Local(post)));
    }
    if let Some(post) = lookup_remote_post_by_uri(conn, uri)? {
        // A duplicate echo never acts as a node of its own; fall through to
        // the embedded-identifier form so the local original resolves.
        if !is_duplicate_echo(conn, &post)? {
            return Ok(Some(Post::Remote(post)));
        }
    }
    if let Some(id) = embedded_local_id(uri) {
        return Ok(lookup_local_post(conn, id)?.map(Post::Local));
    }
    Ok(None)
}

/// A remote post is a duplicate echo when its canonical URI coincides with a
/// local post's URI or embeds a local post's identifier. Echoes are stored
/// but never treated as independent nodes in the reply graph.
pub(crate) fn is_duplicate_echo(conn: &Connection, post: &RemotePost) -> Result<bool> {
    let Some(uri) = post
        .object_uri
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
    else {
        return Ok(false);
    };
    if lookup_local_post_by_uri(conn, uri)?.is_some() {
        return Ok(true);
    }
    if let Some(id) = embedded_local_id(uri) {
        return Ok(lookup_local_post(conn, id)?.is_some());
    }
    Ok(false)
}

fn remote_actor_ref(conn: &Connection, remote_account_id: i64) -> Result<String> {
    let uri: Option<String> = conn
        .query_row(
            "SELECT actor_uri FROM remote_accounts WHERE id=?1",
            params![remote_account_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(uri.unwrap_or_default())
}

impl Store {
    pub fn create_account(&self, username: &str) -> Result<i64> {
        let username = username.trim().to_string();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO accounts(username, created_at_ms) VALUES (?1, ?2)",
                params![username, now_ms()],
            )
            .map_err(|e| crate::error::conflict_on_unique(e, "username"))?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn account(&self, id: i64) -> Result<Account> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, username, display_name, created_at_ms FROM accounts WHERE id=?1",
            params![id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    created_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn account_by_username(&self, username: &str) -> Result<Account> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, username, display_name, created_at_ms FROM accounts \
             WHERE username=?1 COLLATE NOCASE ORDER BY created_at_ms ASC LIMIT 1",
            params![username.trim()],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    created_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Creates a local post. A non-empty parent reference makes it a reply:
    /// every resolvable ancestor's reply count is incremented in the same
    /// transaction, and the parent's author is notified when local.
    pub fn create_local_post(
        &self,
        account_id: i64,
        body: &str,
        parent_uri: Option<&str>,
    ) -> Result<LocalPost> {
        let parent = parent_uri.unwrap_or("").trim().to_string();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO local_posts(account_id, body, parent_uri, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![account_id, body, parent, now_ms()],
            )?;
            let id = tx.last_insert_rowid();
            if !parent.is_empty() {
                crate::engagement::propagate_reply_delta(tx, &parent, 1)?;
                if let Some(Post::Local(parent_post)) = lookup_post_by_uri(tx, &parent)? {
                    if parent_post.account_id != account_id {
                        crate::notifications::push_notification_tx(
                            tx,
                            parent_post.account_id,
                            "reply",
                            &crate::follows::local_actor_ref(account_id),
                            Some(id),
                        )?;
                    }
                }
            }
            lookup_local_post(tx, id)?.ok_or(StoreError::NotFound)
        })
    }

    /// Assigns the canonical URI a local post federates under. At most one
    /// local post may claim a URI.
    pub fn set_local_post_uri(&self, id: i64, object_uri: &str) -> Result<()> {
        let uri = object_uri.trim().to_string();
        self.with_tx(|tx| {
            if !uri.is_empty() {
                let claimed: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM local_posts WHERE object_uri=?1 AND id<>?2",
                        params![uri, id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if claimed.is_some() {
                    return Err(StoreError::Conflict("post uri"));
                }
            }
            let n = tx.execute(
                "UPDATE local_posts SET object_uri=?1 WHERE id=?2",
                params![uri, id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn edit_local_post(&self, id: i64, body: &str) -> Result<()> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE local_posts SET body=?1, edited_at_ms=?2 WHERE id=?3",
                params![body, now_ms(), id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Deletes a local post. If it was a reply, the ancestor chain's reply
    /// counts are decremented symmetrically to creation. Replies *to* the
    /// deleted post are left in place; their ancestor walks simply terminate
    /// where the parent no longer resolves.
    pub fn delete_local_post(&self, id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let Some(post) = lookup_local_post(tx, id)? else {
                return Err(StoreError::NotFound);
            };
            if !post.parent_uri.is_empty() {
                crate::engagement::propagate_reply_delta(tx, &post.parent_uri, -1)?;
            }
            tx.execute("DELETE FROM likes WHERE post_key=?1", params![id])?;
            tx.execute("DELETE FROM boosts WHERE post_key=?1", params![id])?;
            tx.execute("DELETE FROM local_posts WHERE id=?1", params![id])?;
            Ok(())
        })
    }

    pub fn local_post(&self, id: i64) -> Result<LocalPost> {
        let conn = self.connect()?;
        lookup_local_post(&conn, id)?.ok_or(StoreError::NotFound)
    }

    pub fn remote_post(&self, id: i64) -> Result<RemotePost> {
        let conn = self.connect()?;
        lookup_remote_post(&conn, id)?.ok_or(StoreError::NotFound)
    }

    pub fn post_by_uri(&self, uri: &str) -> Result<Post> {
        let conn = self.connect()?;
        lookup_post_by_uri(&conn, uri)?.ok_or(StoreError::NotFound)
    }

    /// Resolves a post and computes its deduplicated total reply count
    /// (direct and nested, duplicate echoes counted once).
    pub fn post_with_thread_stats(&self, uri: &str) -> Result<(Post, u64)> {
        let conn = self.connect()?;
        let post = lookup_post_by_uri(&conn, uri)?.ok_or(StoreError::NotFound)?;
        let total = crate::engagement::thread_reply_total(&conn, &post)?;
        Ok((post, total))
    }

    /// Stores an inbound federation activity as a remote post. The payload
    /// is parsed exactly once here: canonical URI, parent reference,
    /// activity type and content preview all become plain columns, and every
    /// later traversal reads those columns. A second Create for the same
    /// canonical URI is a Conflict; a Create echoing a local post is stored
    /// but contributes nothing to the reply graph.
    pub fn ingest_remote_post(
        &self,
        remote_account_id: i64,
        activity_json: &[u8],
    ) -> Result<RemotePost> {
        let object_uri = payload::object_uri(activity_json);
        let parent = payload::parent_uri(activity_json).unwrap_or_default();
        let activity_type =
            payload::activity_type(activity_json).unwrap_or_else(|| "Create".to_string());
        let preview = payload::content_preview(activity_json);
        self.with_tx(|tx| {
            if activity_type == "Create" {
                if let Some(uri) = object_uri.as_deref() {
                    let dup: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM remote_posts WHERE object_uri=?1 AND activity_type='Create'",
                            params![uri],
                            |r| r.get(0),
                        )
                        .optional()?;
                    if dup.is_some() {
                        return Err(StoreError::Conflict("remote post"));
                    }
                }
            }
            tx.execute(
                "INSERT INTO remote_posts(remote_account_id, activity_type, object_uri, \
                 parent_uri, activity_json, content_preview, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    remote_account_id,
                    activity_type,
                    object_uri,
                    parent,
                    activity_json,
                    preview,
                    now_ms()
                ],
            )?;
            let id = tx.last_insert_rowid();
            let post = lookup_remote_post(tx, id)?.ok_or(StoreError::NotFound)?;
            if post.activity_type == "Create" && !parent.is_empty() && !is_duplicate_echo(tx, &post)?
            {
                crate::engagement::propagate_reply_delta(tx, &parent, 1)?;
                if let Some(Post::Local(parent_post)) = lookup_post_by_uri(tx, &parent)? {
                    let actor = remote_actor_ref(tx, remote_account_id)?;
                    crate::notifications::push_notification_tx(
                        tx,
                        parent_post.account_id,
                        "reply",
                        &actor,
                        Some(id),
                    )?;
                }
            }
            Ok(post)
        })
    }

    /// Removes a remote post (e.g. on a federation Delete), decrementing the
    /// ancestor chain symmetrically to ingestion.
    pub fn delete_remote_post(&self, id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let Some(post) = lookup_remote_post(tx, id)? else {
                return Err(StoreError::NotFound);
            };
            let wrapped = Post::Remote(post.clone());
            let parent = wrapped.parent_uri();
            if post.activity_type == "Create" && !parent.is_empty() && !is_duplicate_echo(tx, &post)?
            {
                crate::engagement::propagate_reply_delta(tx, &parent, -1)?;
            }
            let key = crate::engagement::post_engagement_key(&wrapped);
            tx.execute("DELETE FROM likes WHERE post_key=?1", params![key])?;
            tx.execute("DELETE FROM boosts WHERE post_key=?1", params![key])?;
            tx.execute("DELETE FROM remote_posts WHERE id=?1", params![id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{create_note_activity, migrated_store};

    #[test]
    fn resolver_covers_every_address_form() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let post = store
            .create_local_post(mira, "first", None)
            .expect("create post");

        match store.post_by_uri(&local_uri(post.id)).expect("synthetic") {
            Post::Local(p) => assert_eq!(p.id, post.id),
            Post::Remote(_) => panic!("expected local post"),
        }

        let uri = format!("https://ebb.example/users/mira/posts/{}", post.id);
        match store.post_by_uri(&uri).expect("path form") {
            Post::Local(p) => assert_eq!(p.id, post.id),
            Post::Remote(_) => panic!("expected local post"),
        }

        store.set_local_post_uri(post.id, &uri).expect("set uri");
        match store.post_by_uri(&uri).expect("exact uri") {
            Post::Local(p) => assert_eq!(p.id, post.id),
            Post::Remote(_) => panic!("expected local post"),
        }
    }

    #[test]
    fn empty_uri_never_resolves() {
        let (_dir, store) = migrated_store();
        let err = store.post_by_uri("").expect_err("must miss");
        assert!(err.is_not_found());
        let err = store.post_by_uri("   ").expect_err("must miss");
        assert!(err.is_not_found());
    }

    #[test]
    fn remote_create_is_unique_per_canonical_uri() {
        let (_dir, store) = migrated_store();
        let peer = store
            .upsert_remote_account("https://peer.example/users/remy", &Default::default())
            .expect("remote account");
        let activity = create_note_activity("https://peer.example/notes/1", None, "hi");
        store
            .ingest_remote_post(peer, &activity)
            .expect("first ingest");
        let err = store
            .ingest_remote_post(peer, &activity)
            .expect_err("duplicate create");
        assert!(err.is_conflict());
    }

    #[test]
    fn updates_do_not_shadow_the_create_row() {
        let (_dir, store) = migrated_store();
        let peer = store
            .upsert_remote_account("https://peer.example/users/remy", &Default::default())
            .expect("remote account");
        let uri = "https://peer.example/notes/7";
        let create = create_note_activity(uri, None, "v1");
        let created = store.ingest_remote_post(peer, &create).expect("create");

        let update = serde_json::to_vec(&serde_json::json!({
            "id": format!("{uri}/update"),
            "type": "Update",
            "object": { "id": uri, "type": "Note", "content": "v2" },
        }))
        .expect("serialize");
        store.ingest_remote_post(peer, &update).expect("update");

        match store.post_by_uri(uri).expect("resolve") {
            Post::Remote(p) => {
                assert_eq!(p.id, created.id);
                assert_eq!(p.activity_type, "Create");
            }
            Post::Local(_) => panic!("expected remote post"),
        }
    }

    #[test]
    fn local_uri_claims_are_exclusive() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let a = store.create_local_post(mira, "a", None).expect("post a");
        let b = store.create_local_post(mira, "b", None).expect("post b");
        let uri = "https://ebb.example/users/mira/posts/777";
        store.set_local_post_uri(a.id, uri).expect("claim");
        let err = store.set_local_post_uri(b.id, uri).expect_err("reclaim");
        assert!(err.is_conflict());
    }

    #[test]
    fn edit_stamps_edited_at() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let post = store.create_local_post(mira, "draft", None).expect("post");
        assert!(post.edited_at_ms.is_none());
        store.edit_local_post(post.id, "final").expect("edit");
        let post = store.local_post(post.id).expect("reload");
        assert_eq!(post.body, "final");
        assert!(post.edited_at_ms.is_some());
    }

    #[test]
    fn lifecycle_misses_surface_not_found() {
        let (_dir, store) = migrated_store();
        assert!(store.local_post(999).expect_err("miss").is_not_found());
        assert!(store
            .edit_local_post(999, "x")
            .expect_err("miss")
            .is_not_found());
        assert!(store
            .delete_local_post(999)
            .expect_err("miss")
            .is_not_found());
        assert!(store.delete_remote_post(999).expect_err("miss").is_not_found());
    }

    #[test]
    fn embedded_id_requires_the_posts_segment() {
        assert_eq!(
            embedded_local_id("https://ebb.example/users/mira/posts/42"),
            Some(42)
        );
        assert_eq!(embedded_local_id("https://ebb.example/users/42"), None);
        assert_eq!(embedded_local_id("local:42"), None);
        assert_eq!(embedded_local_id("https://ebb.example/posts/abc"), None);
    }
}
