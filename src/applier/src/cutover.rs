// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The atomic cut-over: replacing the original table with the ghost table
//! so that no client ever observes a moment where the table is missing or
//! stale.
//!
//! Two sessions cooperate. The locker acquires a named advisory lock,
//! creates the sentry table under the old-table name, and write-locks both
//! the original and the sentry. The renamer then issues the combined
//! `RENAME TABLE original -> old, ghost -> original`, which blocks behind
//! the write lock. Once the supervisor has drained the remaining event
//! backlog onto the ghost table, the locker drops the sentry and unlocks;
//! the rename proceeds inside the server with no intermediate state
//! visible.
//!
//! If the locker dies mid-protocol its connection drops, releasing every
//! lock; the rename then fails against the still-existing sentry, which is
//! exactly what makes the crash detectable at the next startup. Both
//! session functions unconditionally push sentinel errors into their
//! rendezvous channels on exit, so a supervisor blocked on a channel read
//! is always released.

use std::time::Instant;

use mysql_async::prelude::Queryable;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use ghost_mysql_util::ER_LOCK_WAIT_TIMEOUT;

use crate::query;
use crate::{Applier, ApplierError};

/// Magic comment carried by the cut-over sentry table; recognizing it is the
/// crash-recovery contract.
pub const CUT_OVER_MAGIC_COMMENT: &str = "ghost-cut-over-sentry";

/// The name of the advisory lock held by the cut-over locker session.
pub fn session_lock_name(session_id: i64) -> String {
    format!("gh-ost.{}.lock", session_id)
}

/// Lock-wait timeouts during LOCK TABLES or RENAME abort the cut-over
/// attempt specifically; everything else stays a plain sql error.
fn classify_lock_error(err: mysql_async::Error, operation: &'static str) -> ApplierError {
    let is_lock_wait_timeout = matches!(
        &err,
        mysql_async::Error::Server(server) if server.code == ER_LOCK_WAIT_TIMEOUT
    );
    if is_lock_wait_timeout {
        ApplierError::CutOverLockTimeout {
            operation,
            source: err,
        }
    } else {
        ApplierError::Sql(err)
    }
}

impl Applier {
    /// Check whether the old-table name is occupied by a leftover cut-over
    /// sentry, and drop it if so. A sentry here is proof that a previous
    /// cut-over attempt crashed after lock-acquire but before cleanup. A
    /// table under that name *without* the magic comment is an error, and
    /// nothing is dropped.
    pub async fn drop_atomic_cut_over_sentry_table_if_exists(&self) -> Result<(), ApplierError> {
        info!("looking for magic cut-over table");
        let table_name = self.context.old_table_name();
        let Some(status) = self.show_table_status(&table_name).await? else {
            return Ok(());
        };
        let comment: Option<String> = status.get("Comment");
        if comment.as_deref() != Some(CUT_OVER_MAGIC_COMMENT) {
            return Err(anyhow::anyhow!(
                "expected magic comment on {}, did not find it",
                table_name
            )
            .into());
        }
        info!("dropping magic cut-over table");
        self.drop_table(&table_name).await
    }

    /// Create the sentry: a bare table under the old-table name whose
    /// comment is the magic string. Created only while the cut-over
    /// advisory lock is held.
    pub async fn create_atomic_cut_over_sentry_table(&self) -> Result<(), ApplierError> {
        self.drop_atomic_cut_over_sentry_table_if_exists().await?;
        let table_name = self.context.old_table_name();
        let statement = format!(
            "create /* ghost */ table {} (id int auto_increment primary key) engine={} comment='{}'",
            query::qualified_name(self.context.database_name(), &table_name),
            self.context.config().table_engine,
            CUT_OVER_MAGIC_COMMENT,
        );
        info!(table = %table_name, "creating magic cut-over table");
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(statement).await?;
        info!("magic cut-over table created");
        Ok(())
    }

    /// The cut-over locker (session A). Holds the advisory lock, creates
    /// the sentry, and write-locks the original table plus the sentry; then
    /// waits to be told the backlog is drained, drops the sentry, and
    /// unlocks, letting the blocked rename through.
    ///
    /// Rendezvous: publishes its connection id, then `Ok(())` on
    /// `table_locked_tx` once the write locks are held; blocks on
    /// `ok_to_unlock_rx`; publishes `Ok(())` on `table_unlocked_tx` after
    /// `UNLOCK TABLES`. On exit, success or not, sentinel values go out on
    /// every channel so no supervisor read can block forever.
    pub async fn atomic_cut_over_lock(
        &self,
        session_id_tx: mpsc::UnboundedSender<i64>,
        table_locked_tx: mpsc::UnboundedSender<Result<(), ApplierError>>,
        ok_to_unlock_rx: oneshot::Receiver<()>,
        table_unlocked_tx: mpsc::UnboundedSender<Result<(), ApplierError>>,
    ) -> Result<(), ApplierError> {
        let result = self
            .cut_over_lock_inner(
                &session_id_tx,
                &table_locked_tx,
                ok_to_unlock_rx,
                &table_unlocked_tx,
            )
            .await;
        let _ = session_id_tx.send(-1);
        let _ = table_locked_tx.send(Err(ApplierError::Injected {
            site: "atomic_cut_over_lock",
        }));
        let _ = table_unlocked_tx.send(Err(ApplierError::Injected {
            site: "atomic_cut_over_lock",
        }));
        result
    }

    async fn cut_over_lock_inner(
        &self,
        session_id_tx: &mpsc::UnboundedSender<i64>,
        table_locked_tx: &mpsc::UnboundedSender<Result<(), ApplierError>>,
        ok_to_unlock_rx: oneshot::Receiver<()>,
        table_unlocked_tx: &mpsc::UnboundedSender<Result<(), ApplierError>>,
    ) -> Result<(), ApplierError> {
        // A dedicated connection: the advisory lock and the table locks are
        // session-scoped, and this session dying is the abort of last
        // resort.
        let mut conn = self.config.connect("cut-over locker").await?;
        let session_id = i64::from(conn.id());
        let _ = session_id_tx.send(session_id);

        let lock_name = session_lock_name(session_id);
        info!(%lock_name, "grabbing voluntary lock");
        let lock_result: Option<Option<i64>> = conn
            .exec_first("select get_lock(?, 0)", (lock_name.as_str(),))
            .await?;
        if lock_result.flatten() != Some(1) {
            return Err(ApplierError::LockUnavailable { lock_name });
        }

        let lock_timeout_seconds = self.context.config().cut_over_lock_timeout_seconds * 2;
        info!(seconds = lock_timeout_seconds, "setting LOCK timeout");
        conn.query_drop(format!(
            "set session lock_wait_timeout:={}",
            lock_timeout_seconds
        ))
        .await?;

        self.create_atomic_cut_over_sentry_table().await?;

        let original = query::qualified_name(
            self.context.database_name(),
            self.context.original_table_name(),
        );
        let old = query::qualified_name(self.context.database_name(), &self.context.old_table_name());
        info!(%original, %old, "locking tables");
        self.context.set_lock_tables_start_time(Instant::now());
        if let Err(err) = conn
            .query_drop(format!("lock /* ghost */ tables {} write, {} write", original, old))
            .await
        {
            return Err(classify_lock_error(err, "LOCK TABLES"));
        }
        info!("tables locked");
        let _ = table_locked_tx.send(Ok(()));

        // From this point on we are committed to UNLOCK TABLES: either the
        // unlock below executes, or this connection dies, which has the
        // same effect.
        let ok_to_unlock = ok_to_unlock_rx.await;
        info!("will now proceed to drop magic table and unlock tables");

        // The sentry is locked by us and only we may drop it. The drop may
        // fail; the unlock must still run.
        if let Err(err) = conn
            .query_drop(format!("drop /* ghost */ table if exists {}", old))
            .await
        {
            error!("failed dropping magic cut-over table: {err:#}");
        }

        info!(%original, %old, "releasing lock");
        conn.query_drop("unlock tables").await?;
        info!("tables unlocked");
        let _ = table_unlocked_tx.send(Ok(()));

        if ok_to_unlock.is_err() {
            return Err(anyhow::anyhow!(
                "cut-over supervisor went away before signaling ok-to-unlock"
            )
            .into());
        }
        conn.disconnect().await?;
        Ok(())
    }

    /// The cut-over renamer (session B). Issues the combined atomic rename
    /// and blocks behind the locker's write lock; when the locker unlocks,
    /// the rename finds the sentry dropped and swaps both tables in one
    /// server-side step.
    pub async fn atomic_cut_over_rename(
        &self,
        session_id_tx: mpsc::UnboundedSender<i64>,
        tables_renamed_tx: mpsc::UnboundedSender<Result<(), ApplierError>>,
    ) -> Result<(), ApplierError> {
        let result = self
            .cut_over_rename_inner(&session_id_tx, &tables_renamed_tx)
            .await;
        let _ = session_id_tx.send(-1);
        let _ = tables_renamed_tx.send(Err(ApplierError::Injected {
            site: "atomic_cut_over_rename",
        }));
        result
    }

    async fn cut_over_rename_inner(
        &self,
        session_id_tx: &mpsc::UnboundedSender<i64>,
        tables_renamed_tx: &mpsc::UnboundedSender<Result<(), ApplierError>>,
    ) -> Result<(), ApplierError> {
        let mut conn = self.config.connect("cut-over renamer").await?;
        let _ = session_id_tx.send(i64::from(conn.id()));

        let lock_timeout_seconds = self.context.config().cut_over_lock_timeout_seconds;
        info!(seconds = lock_timeout_seconds, "setting RENAME timeout");
        conn.query_drop(format!(
            "set session lock_wait_timeout:={}",
            lock_timeout_seconds
        ))
        .await?;

        let original = query::qualified_name(
            self.context.database_name(),
            self.context.original_table_name(),
        );
        let old = query::qualified_name(self.context.database_name(), &self.context.old_table_name());
        let ghost =
            query::qualified_name(self.context.database_name(), &self.context.ghost_table_name());
        let statement = format!(
            "rename /* ghost */ table {} to {}, {} to {}",
            original, old, ghost, original
        );
        info!(%statement, "issuing and expecting this to block");
        if let Err(err) = conn.query_drop(statement).await {
            let err = classify_lock_error(err, "RENAME TABLE");
            // The supervisor learns the outcome over the channel; the
            // specific error also travels back to whoever awaits us.
            let _ = tables_renamed_tx.send(Err(ApplierError::Generic(anyhow::anyhow!(
                "rename failed: {}",
                err
            ))));
            return Err(err);
        }
        let _ = tables_renamed_tx.send(Ok(()));
        info!("tables renamed");
        conn.disconnect().await?;
        Ok(())
    }

    /// Expect the cut-over advisory lock to be held by the given session.
    /// The supervisor verifies this before draining the backlog: it proves
    /// the locker is still alive and the rename is blocked on *our* lock.
    pub async fn expect_used_lock(&self, session_id: i64) -> Result<(), ApplierError> {
        let lock_name = session_lock_name(session_id);
        info!(%lock_name, "checking session lock");
        let mut conn = self.pool.get_conn().await?;
        let holder: Option<Option<i64>> = conn
            .exec_first("select is_used_lock(?)", (lock_name.as_str(),))
            .await?;
        if holder.flatten() != Some(session_id) {
            return Err(anyhow::anyhow!(
                "session lock {} expected to be found but wasn't",
                lock_name
            )
            .into());
        }
        Ok(())
    }

    /// Expect a process with the given state and info substrings in the
    /// server's processlist; how the supervisor observes the rename parked
    /// in its metadata-lock wait.
    pub async fn expect_process(
        &self,
        session_id: i64,
        state_hint: &str,
        info_hint: &str,
    ) -> Result<(), ApplierError> {
        let mut conn = self.pool.get_conn().await?;
        let found: Option<i64> = conn
            .exec_first(
                "select id from information_schema.processlist \
                 where id != connection_id() \
                 and ? in (0, id) \
                 and state like concat('%', ?, '%') \
                 and info like concat('%', ?, '%')",
                (session_id, state_hint, info_hint),
            )
            .await?;
        if found.is_none() {
            return Err(anyhow::anyhow!(
                "cannot find process. Hints: {}, {}",
                state_hint,
                info_hint
            )
            .into());
        }
        Ok(())
    }

    /// Rename both tables back: original to ghost, old to original. Used by
    /// test-on-replica. The single atomic two-table rename is preferred; if
    /// it fails, fall back to two sequential renames, recording the last
    /// error and accepting that a brief intermediate window may exist.
    pub async fn rename_tables_rollback(&self) -> Result<(), ApplierError> {
        let original = query::qualified_name(
            self.context.database_name(),
            self.context.original_table_name(),
        );
        let old = query::qualified_name(self.context.database_name(), &self.context.old_table_name());
        let ghost =
            query::qualified_name(self.context.database_name(), &self.context.ghost_table_name());

        let mut conn = self.pool.get_conn().await?;
        info!("renaming back both tables");
        let atomic = format!(
            "rename /* ghost */ table {} to {}, {} to {}",
            original, ghost, old, original
        );
        if conn.query_drop(atomic).await.is_ok() {
            return Ok(());
        }

        let mut rename_error = None;
        info!("renaming back to ghost table");
        if let Err(err) = conn
            .query_drop(format!("rename /* ghost */ table {} to {}", original, ghost))
            .await
        {
            rename_error = Some(err);
        }
        info!("renaming back to original table");
        if let Err(err) = conn
            .query_drop(format!("rename /* ghost */ table {} to {}", old, original))
            .await
        {
            rename_error = Some(err);
        }
        match rename_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
