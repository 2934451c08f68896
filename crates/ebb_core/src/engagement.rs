/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use crate::error::{conflict_on_unique, Result, StoreError};
use crate::posts::{
    is_duplicate_echo, local_post_from_row, lookup_post_by_uri, remote_post_from_row, Post,
    LOCAL_POST_COLS, REMOTE_POST_COLS,
};
use crate::store::{now_ms, Store};

/// Walks the ancestor chain starting at `parent_uri`, applying `delta` to
/// the reply count of every post it reaches. Counts never drop below zero.
/// The walk stops at an empty reference, an unresolvable reference, a post
/// with no further parent, or any post/address already visited in this walk.
pub(crate) fn propagate_reply_delta(conn: &Connection, parent_uri: &str, delta: i64) -> Result<()> {
    let mut visited_uris: HashSet<String> = HashSet::new();
    let mut visited_posts: HashSet<String> = HashSet::new();
    let mut uri = parent_uri.trim().to_string();
    while !uri.is_empty() && visited_uris.insert(uri.clone()) {
        let Some(post) = lookup_post_by_uri(conn, &uri)? else {
            debug!(%uri, "reply chain ends at unresolved reference");
            break;
        };
        // A post can be reachable under several address forms; guard the
        // walk by identity as well as by address.
        if !visited_posts.insert(post.visit_key()) {
            break;
        }
        match &post {
            Post::Local(p) => {
                conn.execute(
                    "UPDATE local_posts SET reply_count=MAX(0, reply_count + ?1) WHERE id=?2",
                    params![delta, p.id],
                )?;
            }
            Post::Remote(p) => {
                conn.execute(
                    "UPDATE remote_posts SET reply_count=MAX(0, reply_count + ?1) WHERE id=?2",
                    params![delta, p.id],
                )?;
            }
        }
        uri = post.parent_uri();
    }
    Ok(())
}

/// Deduplicated total reply count for a post: direct and nested replies,
/// each logical reply counted once even when it exists in both local and
/// federated form. Does not consult the denormalized counters.
pub(crate) fn thread_reply_total(conn: &Connection, post: &Post) -> Result<u64> {
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(post.visit_key());
    count_replies_below(conn, post, &mut visited)
}

fn count_replies_below(
    conn: &Connection,
    post: &Post,
    visited: &mut HashSet<String>,
) -> Result<u64> {
    let mut total = 0u64;
    for address in post.addresses() {
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOCAL_POST_COLS} FROM local_posts WHERE parent_uri=?1 ORDER BY id ASC"
        ))?;
        let local_children = stmt
            .query_map(params![address], local_post_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for child in local_children {
            let child = Post::Local(child);
            if !visited.insert(child.visit_key()) {
                continue;
            }
            total += 1 + count_replies_below(conn, &child, visited)?;
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {REMOTE_POST_COLS} FROM remote_posts \
             WHERE parent_uri=?1 AND activity_type='Create' ORDER BY id ASC"
        ))?;
        let remote_children = stmt
            .query_map(params![address], remote_post_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for child in remote_children {
            if is_duplicate_echo(conn, &child)? {
                continue;
            }
            let child = Post::Remote(child);
            if !visited.insert(child.visit_key()) {
                continue;
            }
            total += 1 + count_replies_below(conn, &child, visited)?;
        }
    }
    Ok(total)
}

/// Stable engagement key for a post: local posts use their rowid, remote
/// posts a surrogate derived from the canonical URI, so one uniqueness
/// constraint covers both cases.
pub(crate) fn post_engagement_key(post: &Post) -> i64 {
    match post {
        Post::Local(p) => p.id,
        Post::Remote(p) => match p.object_uri.as_deref().map(str::trim) {
            Some(uri) if !uri.is_empty() => surrogate_post_key(uri),
            _ => surrogate_post_key(&post.visit_key()),
        },
    }
}

/// First 8 bytes of SHA-256 of the URI, folded to a negative i64 so
/// surrogate keys stay disjoint from local rowids.
pub(crate) fn surrogate_post_key(uri: &str) -> i64 {
    let digest = Sha256::digest(uri.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let folded = i64::from_be_bytes(bytes) & i64::MAX;
    -folded.max(1)
}

#[derive(Clone, Copy)]
enum EdgeKind {
    Like,
    Boost,
}

impl EdgeKind {
    fn table(self) -> &'static str {
        match self {
            EdgeKind::Like => "likes",
            EdgeKind::Boost => "boosts",
        }
    }

    fn counter(self) -> &'static str {
        match self {
            EdgeKind::Like => "like_count",
            EdgeKind::Boost => "boost_count",
        }
    }

    fn label(self) -> &'static str {
        match self {
            EdgeKind::Like => "like",
            EdgeKind::Boost => "boost",
        }
    }
}

fn edge_exists(conn: &Connection, kind: EdgeKind, account_id: i64, post_key: i64) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE account_id=?1 AND post_key=?2",
                kind.table()
            ),
            params![account_id, post_key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

fn bump_counter(conn: &Connection, post: &Post, kind: EdgeKind, delta: i64) -> Result<()> {
    let (table, id) = match post {
        Post::Local(p) => ("local_posts", p.id),
        Post::Remote(p) => ("remote_posts", p.id),
    };
    conn.execute(
        &format!(
            "UPDATE {table} SET {col}=MAX(0, {col} + ?1) WHERE id=?2",
            col = kind.counter()
        ),
        params![delta, id],
    )?;
    Ok(())
}

fn add_edge(conn: &Connection, kind: EdgeKind, account_id: i64, post: &Post) -> Result<()> {
    let key = post_engagement_key(post);
    if edge_exists(conn, kind, account_id, key)? {
        return Err(StoreError::Conflict(kind.label()));
    }
    conn.execute(
        &format!(
            "INSERT INTO {}(account_id, post_key, created_at_ms) VALUES (?1, ?2, ?3)",
            kind.table()
        ),
        params![account_id, key, now_ms()],
    )
    .map_err(|e| conflict_on_unique(e, kind.label()))?;
    bump_counter(conn, post, kind, 1)
}

fn remove_edge(conn: &Connection, kind: EdgeKind, account_id: i64, post: &Post) -> Result<()> {
    let key = post_engagement_key(post);
    let n = conn.execute(
        &format!(
            "DELETE FROM {} WHERE account_id=?1 AND post_key=?2",
            kind.table()
        ),
        params![account_id, key],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound);
    }
    bump_counter(conn, post, kind, -1)
}

fn resolve_local(conn: &Connection, post_id: i64) -> Result<Post> {
    crate::posts::lookup_local_post(conn, post_id)?
        .map(Post::Local)
        .ok_or(StoreError::NotFound)
}

fn resolve_uri(conn: &Connection, uri: &str) -> Result<Post> {
    lookup_post_by_uri(conn, uri)?.ok_or(StoreError::NotFound)
}

impl Store {
    /// Increments the reply count of the post at `parent_uri` and of every
    /// ancestor above it.
    pub fn increment_reply_counts(&self, parent_uri: &str) -> Result<()> {
        self.with_tx(|tx| propagate_reply_delta(tx, parent_uri, 1))
    }

    /// Decrements reply counts up the ancestor chain, never below zero.
    pub fn decrement_reply_counts(&self, parent_uri: &str) -> Result<()> {
        self.with_tx(|tx| propagate_reply_delta(tx, parent_uri, -1))
    }

    /// Deduplicated total reply count (direct + nested) for the post at
    /// `uri`, independent of the denormalized counters.
    pub fn count_thread_replies(&self, uri: &str) -> Result<u64> {
        let conn = self.connect()?;
        let post = lookup_post_by_uri(&conn, uri)?.ok_or(StoreError::NotFound)?;
        thread_reply_total(&conn, &post)
    }

    pub fn like(&self, account_id: i64, post_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_local(tx, post_id)?;
            add_edge(tx, EdgeKind::Like, account_id, &post)
        })
    }

    pub fn like_by_uri(&self, account_id: i64, uri: &str) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_uri(tx, uri)?;
            add_edge(tx, EdgeKind::Like, account_id, &post)
        })
    }

    pub fn unlike(&self, account_id: i64, post_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_local(tx, post_id)?;
            remove_edge(tx, EdgeKind::Like, account_id, &post)
        })
    }

    pub fn unlike_by_uri(&self, account_id: i64, uri: &str) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_uri(tx, uri)?;
            remove_edge(tx, EdgeKind::Like, account_id, &post)
        })
    }

    pub fn boost(&self, account_id: i64, post_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_local(tx, post_id)?;
            add_edge(tx, EdgeKind::Boost, account_id, &post)
        })
    }

    pub fn boost_by_uri(&self, account_id: i64, uri: &str) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_uri(tx, uri)?;
            add_edge(tx, EdgeKind::Boost, account_id, &post)
        })
    }

    pub fn unboost(&self, account_id: i64, post_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_local(tx, post_id)?;
            remove_edge(tx, EdgeKind::Boost, account_id, &post)
        })
    }

    pub fn unboost_by_uri(&self, account_id: i64, uri: &str) -> Result<()> {
        self.with_tx(|tx| {
            let post = resolve_uri(tx, uri)?;
            remove_edge(tx, EdgeKind::Boost, account_id, &post)
        })
    }

    pub fn has_like(&self, account_id: i64, post_id: i64) -> Result<bool> {
        let conn = self.connect()?;
        edge_exists(&conn, EdgeKind::Like, account_id, post_id)
    }

    pub fn has_boost(&self, account_id: i64, post_id: i64) -> Result<bool> {
        let conn = self.connect()?;
        edge_exists(&conn, EdgeKind::Boost, account_id, post_id)
    }

    pub fn has_like_by_uri(&self, account_id: i64, uri: &str) -> Result<bool> {
        let conn = self.connect()?;
        let post = resolve_uri(&conn, uri)?;
        edge_exists(&conn, EdgeKind::Like, account_id, post_engagement_key(&post))
    }

    pub fn has_boost_by_uri(&self, account_id: i64, uri: &str) -> Result<bool> {
        let conn = self.connect()?;
        let post = resolve_uri(&conn, uri)?;
        edge_exists(&conn, EdgeKind::Boost, account_id, post_engagement_key(&post))
    }
}
