/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{conflict_on_unique, Result, StoreError};
use crate::store::{now_ms, Store};

/// Actor reference for a local account, used on follow edges alongside
/// remote actor URIs.
pub fn local_actor_ref(account_id: i64) -> String {
    format!("local:{account_id}")
}

pub(crate) fn is_local_ref(actor_ref: &str) -> bool {
    actor_ref.starts_with("local:")
}

#[derive(Debug, Clone)]
pub struct Follow {
    pub id: i64,
    pub follower: String,
    pub target: String,
    pub accepted: bool,
    pub is_local: bool,
    pub uri: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RemoteAccount {
    pub id: i64,
    pub actor_uri: String,
    pub inbox: String,
    pub outbox: String,
    pub shared_inbox: String,
    pub public_key_pem: Option<String>,
    pub username: String,
    pub host: String,
    pub display_name: String,
    pub summary: String,
    pub refreshed_at_ms: i64,
    pub created_at_ms: i64,
}

/// Profile fields cached for a remote actor. Everything is optional at the
/// protocol level, so the whole struct defaults to empty.
#[derive(Debug, Clone, Default)]
pub struct RemoteActorProfile {
    pub inbox: String,
    pub outbox: String,
    pub shared_inbox: String,
    pub public_key_pem: Option<String>,
    pub username: String,
    pub host: String,
    pub display_name: String,
    pub summary: String,
}

const FOLLOW_COLS: &str = "id, follower, target, accepted, is_local, uri, created_at_ms";

fn follow_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Follow> {
    Ok(Follow {
        id: row.get(0)?,
        follower: row.get(1)?,
        target: row.get(2)?,
        accepted: row.get::<_, i64>(3)? != 0,
        is_local: row.get::<_, i64>(4)? != 0,
        uri: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}

const REMOTE_ACCOUNT_COLS: &str = "id, actor_uri, inbox, outbox, shared_inbox, public_key_pem, \
     username, host, display_name, summary, refreshed_at_ms, created_at_ms";

fn remote_account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteAccount> {
    Ok(RemoteAccount {
        id: row.get(0)?,
        actor_uri: row.get(1)?,
        inbox: row.get(2)?,
        outbox: row.get(3)?,
        shared_inbox: row.get(4)?,
        public_key_pem: row.get(5)?,
        username: row.get(6)?,
        host: row.get(7)?,
        display_name: row.get(8)?,
        summary: row.get(9)?,
        refreshed_at_ms: row.get(10)?,
        created_at_ms: row.get(11)?,
    })
}

fn lookup_follow(conn: &Connection, id: i64) -> Result<Option<Follow>> {
    conn.query_row(
        &format!("SELECT {FOLLOW_COLS} FROM follows WHERE id=?1"),
        params![id],
        follow_from_row,
    )
    .optional()
    .map_err(Into::into)
}

impl Store {
    /// Creates a follow edge. A duplicate (follower, target) pair fails with
    /// `Conflict` once the uniqueness constraint is installed; callers treat
    /// that as "already exists". Local-to-local edges need no acceptance
    /// round-trip and start accepted.
    pub fn create_follow(&self, follower: &str, target: &str, uri: &str) -> Result<Follow> {
        let follower = follower.trim().to_string();
        let target = target.trim().to_string();
        let uri = uri.trim().to_string();
        if follower.is_empty() || target.is_empty() {
            return Err(StoreError::NotFound);
        }
        let is_local = is_local_ref(&follower) && is_local_ref(&target);
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO follows(follower, target, accepted, is_local, uri, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    follower,
                    target,
                    if is_local { 1 } else { 0 },
                    if is_local { 1 } else { 0 },
                    uri,
                    now_ms()
                ],
            )
            .map_err(|e| conflict_on_unique(e, "follow"))?;
            lookup_follow(tx, tx.last_insert_rowid())?.ok_or(StoreError::NotFound)
        })
    }

    pub fn follow_by_uri(&self, uri: &str) -> Result<Follow> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(StoreError::NotFound);
        }
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {FOLLOW_COLS} FROM follows WHERE uri=?1"),
            params![uri],
            follow_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn follow_between(&self, follower: &str, target: &str) -> Result<Follow> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {FOLLOW_COLS} FROM follows WHERE follower=?1 AND target=?2"),
            params![follower.trim(), target.trim()],
            follow_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Flips a pending follow to accepted, keyed by its federation URI.
    pub fn accept_follow(&self, uri: &str) -> Result<()> {
        let uri = uri.trim().to_string();
        if uri.is_empty() {
            return Err(StoreError::NotFound);
        }
        self.with_tx(|tx| {
            let n = tx.execute("UPDATE follows SET accepted=1 WHERE uri=?1", params![uri])?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn delete_follow(&self, follower: &str, target: &str) -> Result<()> {
        let follower = follower.trim().to_string();
        let target = target.trim().to_string();
        self.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM follows WHERE follower=?1 AND target=?2",
                params![follower, target],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    pub fn delete_follow_by_uri(&self, uri: &str) -> Result<()> {
        let uri = uri.trim().to_string();
        if uri.is_empty() {
            return Err(StoreError::NotFound);
        }
        self.with_tx(|tx| {
            let n = tx.execute("DELETE FROM follows WHERE uri=?1", params![uri])?;
            if n == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// True when an accepted edge exists; a pending follow does not count.
    pub fn is_following(&self, follower: &str, target: &str) -> Result<bool> {
        let conn = self.connect()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM follows WHERE follower=?1 AND target=?2 AND accepted=1",
                params![follower.trim(), target.trim()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Followers of an actor, oldest first. Edges whose remote side has been
    /// orphan-cleaned are filtered out.
    pub fn followers_of(&self, target: &str) -> Result<Vec<Follow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLLOW_COLS} FROM follows WHERE target=?1 \
             AND (follower LIKE 'local:%' \
                  OR EXISTS(SELECT 1 FROM remote_accounts ra WHERE ra.actor_uri=follows.follower)) \
             ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![target.trim()], follow_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Actors an account follows, oldest first, with the same orphan
    /// filtering on the target side.
    pub fn following_of(&self, follower: &str) -> Result<Vec<Follow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLLOW_COLS} FROM follows WHERE follower=?1 \
             AND (target LIKE 'local:%' \
                  OR EXISTS(SELECT 1 FROM remote_accounts ra WHERE ra.actor_uri=follows.target)) \
             ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![follower.trim()], follow_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Creates or refreshes the cached copy of a remote actor and returns
    /// its row id.
    pub fn upsert_remote_account(
        &self,
        actor_uri: &str,
        profile: &RemoteActorProfile,
    ) -> Result<i64> {
        let actor_uri = actor_uri.trim().to_string();
        if actor_uri.is_empty() {
            return Err(StoreError::NotFound);
        }
        let profile = profile.clone();
        self.with_tx(|tx| {
            let now = now_ms();
            tx.execute(
                "INSERT INTO remote_accounts(actor_uri, inbox, outbox, shared_inbox, \
                 public_key_pem, username, host, display_name, summary, refreshed_at_ms, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
                 ON CONFLICT(actor_uri) DO UPDATE SET \
                   inbox=excluded.inbox, \
                   outbox=excluded.outbox, \
                   shared_inbox=excluded.shared_inbox, \
                   public_key_pem=COALESCE(excluded.public_key_pem, remote_accounts.public_key_pem), \
                   username=excluded.username, \
                   host=excluded.host, \
                   display_name=excluded.display_name, \
                   summary=excluded.summary, \
                   refreshed_at_ms=excluded.refreshed_at_ms",
                params![
                    actor_uri,
                    profile.inbox,
                    profile.outbox,
                    profile.shared_inbox,
                    profile.public_key_pem,
                    profile.username,
                    profile.host,
                    profile.display_name,
                    profile.summary,
                    now
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM remote_accounts WHERE actor_uri=?1",
                params![actor_uri],
                |r| r.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn remote_account(&self, id: i64) -> Result<RemoteAccount> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {REMOTE_ACCOUNT_COLS} FROM remote_accounts WHERE id=?1"),
            params![id],
            remote_account_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn remote_account_by_uri(&self, actor_uri: &str) -> Result<RemoteAccount> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {REMOTE_ACCOUNT_COLS} FROM remote_accounts WHERE actor_uri=?1"),
            params![actor_uri.trim()],
            remote_account_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Deletes cached remote actors referenced by no follow edge and no
    /// stored activity. Run opportunistically; references are not foreign-key
    /// cascades.
    pub fn cleanup_orphan_remote_accounts(&self) -> Result<u64> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM remote_accounts \
                 WHERE actor_uri NOT IN (SELECT follower FROM follows) \
                   AND actor_uri NOT IN (SELECT target FROM follows) \
                   AND id NOT IN (SELECT remote_account_id FROM remote_posts)",
                [],
            )?;
            Ok(n as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::migrated_store;

    #[test]
    fn duplicate_follow_is_a_conflict_and_leaves_the_edge_alone() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let me = local_actor_ref(mira);
        let remy = "https://peer.example/users/remy";

        let edge = store
            .create_follow(&me, remy, "https://ebb.example/follows/1")
            .expect("follow");
        assert!(!edge.accepted);
        assert!(!edge.is_local);

        let err = store
            .create_follow(&me, remy, "https://ebb.example/follows/2")
            .expect_err("duplicate");
        assert!(err.is_conflict());

        let reloaded = store.follow_between(&me, remy).expect("reload");
        assert_eq!(reloaded.id, edge.id);
        assert_eq!(reloaded.uri, "https://ebb.example/follows/1");
    }

    #[test]
    fn acceptance_is_a_state_flip_keyed_by_uri() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let me = local_actor_ref(mira);
        let remy = "https://peer.example/users/remy";
        let uri = "https://ebb.example/follows/1";

        store.create_follow(&me, remy, uri).expect("follow");
        assert!(!store.is_following(&me, remy).expect("pending"));

        store.accept_follow(uri).expect("accept");
        assert!(store.is_following(&me, remy).expect("accepted"));
        assert!(store.follow_by_uri(uri).expect("by uri").accepted);

        assert!(store
            .accept_follow("https://ebb.example/follows/404")
            .expect_err("miss")
            .is_not_found());
    }

    #[test]
    fn local_edges_start_accepted() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let noor = store.create_account("noor").expect("account");
        let edge = store
            .create_follow(&local_actor_ref(mira), &local_actor_ref(noor), "")
            .expect("follow");
        assert!(edge.accepted);
        assert!(edge.is_local);
        assert!(store
            .is_following(&local_actor_ref(mira), &local_actor_ref(noor))
            .expect("following"));
    }

    #[test]
    fn listings_filter_orphaned_remote_actors() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let me = local_actor_ref(mira);
        let remy = "https://peer.example/users/remy";
        let ghost = "https://gone.example/users/ghost";

        store
            .upsert_remote_account(remy, &Default::default())
            .expect("remy cached");
        // both followed us, but only remy still has a cached actor row
        let conn = crate::testutil::raw(&store);
        for (i, actor) in [remy, ghost].iter().enumerate() {
            conn.execute(
                "INSERT INTO follows(follower, target, accepted, is_local, uri, created_at_ms) \
                 VALUES (?1, ?2, 1, 0, ?3, ?4)",
                rusqlite::params![actor, me, format!("https://peer.example/f/{i}"), i as i64],
            )
            .expect("seed follow");
        }

        let followers = store.followers_of(&me).expect("followers");
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].follower, remy);
    }

    #[test]
    fn orphan_cleanup_spares_referenced_actors() {
        let (_dir, store) = migrated_store();
        let mira = store.create_account("mira").expect("account");
        let me = local_actor_ref(mira);

        let followed = "https://peer.example/users/followed";
        store
            .upsert_remote_account(followed, &Default::default())
            .expect("followed");
        store
            .create_follow(&me, followed, "https://ebb.example/follows/1")
            .expect("follow");

        let author = store
            .upsert_remote_account("https://peer.example/users/author", &Default::default())
            .expect("author");
        store
            .ingest_remote_post(
                author,
                &crate::testutil::create_note_activity("https://peer.example/notes/1", None, "hi"),
            )
            .expect("post");

        store
            .upsert_remote_account("https://peer.example/users/orphan", &Default::default())
            .expect("orphan");

        let removed = store.cleanup_orphan_remote_accounts().expect("cleanup");
        assert_eq!(removed, 1);
        assert!(store.remote_account_by_uri(followed).is_ok());
        assert!(store
            .remote_account_by_uri("https://peer.example/users/orphan")
            .expect_err("gone")
            .is_not_found());
    }

    #[test]
    fn upsert_refreshes_instead_of_duplicating() {
        let (_dir, store) = migrated_store();
        let uri = "https://peer.example/users/remy";
        let first = store
            .upsert_remote_account(uri, &Default::default())
            .expect("create");
        let profile = RemoteActorProfile {
            inbox: "https://peer.example/users/remy/inbox".into(),
            display_name: "Remy".into(),
            ..Default::default()
        };
        let second = store.upsert_remote_account(uri, &profile).expect("refresh");
        assert_eq!(first, second);
        let account = store.remote_account(first).expect("reload");
        assert_eq!(account.inbox, "https://peer.example/users/remy/inbox");
        assert_eq!(account.display_name, "Remy");
    }
}
