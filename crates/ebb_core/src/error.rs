/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::ErrorCode;

/// Error surface of the storage engine.
///
/// Busy/locked conditions never appear here directly: `Store::with_tx`
/// absorbs them by re-running the whole transaction and only surfaces
/// `Overloaded` once the retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("database overloaded after {attempts} busy retries")]
    Overloaded { attempts: u32 },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Maps a unique-constraint failure to `Conflict(what)`, passing every other
/// error through untouched.
pub(crate) fn conflict_on_unique(err: rusqlite::Error, what: &'static str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(what)
    } else {
        StoreError::Sqlite(err)
    }
}
