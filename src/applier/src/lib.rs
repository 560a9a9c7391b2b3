// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Applier core of an online schema-change engine for MySQL.
//!
//! Given an original table and an `ALTER` clause, a migration creates a
//! shadow ("ghost") table with the new schema, populates it by copying the
//! original in bounded chunks, replays intercepted row-level binlog events
//! onto it, and finally swaps it into place with an atomic cut-over that
//! never leaves clients without a table to talk to.
//!
//! The [`Applier`] owns every write against the migrated server. It is
//! driven by an external supervisor, which also owns the binlog streamer,
//! the migration planner, and the throttling policy; the applier only
//! consults their decisions through the shared [`MigrationContext`].
//!
//! The crate is split by concern:
//!
//! * [`query`] builds the parametric statements: range probes, the chunk
//!   `INSERT ... SELECT`, and the per-event DML rewrites.
//! * `applier` carries connection setup, the ghost/changelog/old table
//!   lifecycle, and the changelog heartbeat.
//! * `copy` walks the original table in key order, one chunk per
//!   transaction, under a shared read lock.
//! * `dml` translates a row event on the original table into one or two
//!   idempotent statements on the ghost table and batch-applies them.
//! * `cutover` runs the two-session atomic rename protocol with its sentry
//!   table, advisory lock, and rendezvous channels.
//!
//! # Error handling
//!
//! [`ApplierError`] distinguishes failures the caller may retry (connection
//! resets, deadlocks, lock-wait timeouts on non-critical paths; see
//! [`ApplierError::is_transient`]) from fatal ones: a pre-existing ghost or
//! changelog table, a configuration that must abort before any DDL, and
//! translator failures, which poison the whole migration. The cut-over has
//! its own pair (lock unavailable, lock-wait timeout) which abort the
//! attempt but leave the migration retryable by the supervisor.

mod applier;
mod context;
mod copy;
mod cutover;
mod dml;
pub mod query;
mod types;

pub use applier::Applier;
pub use context::{
    MigrationConfig, MigrationContext, ThrottleReasonHint, CHANGELOG_HEARTBEAT_ID,
    CHANGELOG_STATE_ID, CHANGELOG_THROTTLE_ID, MAX_TABLE_NAME_LENGTH,
};
pub use copy::ChunkResult;
pub use cutover::{session_lock_name, CUT_OVER_MAGIC_COMMENT};
pub use dml::DmlBuildResult;
pub use types::{BinlogDmlEvent, ColumnList, ColumnValues, DmlKind, PartitionInfo, UniqueKey};

/// A fatal error translating an intercepted row event; drops the migration.
#[derive(Debug, thiserror::Error)]
pub enum TranslatorError {
    #[error("column {column} has no ordinal in the original table")]
    MissingColumnOrdinal { column: String },
    #[error("{kind:?} event on {table} is missing its {image} row image")]
    MissingRowImage {
        kind: DmlKind,
        table: String,
        image: &'static str,
    },
}

/// An error from an applier operation. Translator and builder errors bubble
/// up through the apply transaction and cause rollback; teardown errors are
/// logged and swallowed at their call sites instead of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    /// A failure reported by the server or the connection to it.
    #[error("sql client error")]
    Sql(#[from] mysql_async::Error),
    /// A ghost, old, or changelog table is present without the
    /// initially-drop flag. Fatal: abort before touching the original.
    #[error("table {table} already exists; drop or rename it away, or enable the initially-drop flag")]
    PreexistingTable { table: String },
    /// A binlog event that cannot be applied onto the ghost table.
    #[error(transparent)]
    Translator(#[from] TranslatorError),
    /// The cut-over advisory lock is held elsewhere; a concurrent cut-over
    /// attempt is in flight.
    #[error("unable to acquire advisory lock {lock_name}")]
    LockUnavailable { lock_name: String },
    /// `lock_wait_timeout` expired during the cut-over's LOCK TABLES or
    /// RENAME. The attempt is aborted; the supervisor may retry.
    #[error("cut-over lock wait timed out during {operation}")]
    CutOverLockTimeout {
        operation: &'static str,
        #[source]
        source: mysql_async::Error,
    },
    /// Configuration that must abort the migration before any DDL.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
    /// Sentinel pushed into the cut-over rendezvous channels on exit so a
    /// blocked supervisor read is always released.
    #[error("unexpected error in {site}, injected to release blocking channel reads")]
    Injected { site: &'static str },
    #[error(transparent)]
    MySqlUtil(#[from] ghost_mysql_util::MySqlError),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl ApplierError {
    /// Whether the caller may retry the failed operation, up to the
    /// configured max-retries.
    pub fn is_transient(&self) -> bool {
        match self {
            ApplierError::Sql(mysql_async::Error::Server(server)) => matches!(
                server.code,
                ghost_mysql_util::ER_LOCK_WAIT_TIMEOUT | ghost_mysql_util::ER_LOCK_DEADLOCK
            ),
            ApplierError::Sql(mysql_async::Error::Io(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let deadlock = ApplierError::Sql(mysql_async::Error::Server(mysql_async::ServerError {
            code: ghost_mysql_util::ER_LOCK_DEADLOCK,
            message: "Deadlock found when trying to get lock".to_string(),
            state: "40001".to_string(),
        }));
        assert!(deadlock.is_transient());

        let no_such_table = ApplierError::Sql(mysql_async::Error::Server(
            mysql_async::ServerError {
                code: ghost_mysql_util::ER_NO_SUCH_TABLE,
                message: "Table 'test.missing' doesn't exist".to_string(),
                state: "42S02".to_string(),
            },
        ));
        assert!(!no_such_table.is_transient());

        let fatal = ApplierError::FatalConfig("table name too long".to_string());
        assert!(!fatal.is_transient());
    }
}
