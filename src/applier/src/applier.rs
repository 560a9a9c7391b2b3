// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures::TryStreamExt;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Pool, Row};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ghost_mysql_util::{
    ensure_full_row_binlog_format, replication_binlog_coordinates, Config,
};

use crate::context::{MigrationContext, ThrottleReasonHint};
use crate::query;
use crate::types::{ColumnList, PartitionInfo};
use crate::ApplierError;

/// Upper bound on concurrent connections the applier holds against the
/// migrated server.
const APPLIER_MAX_CONNECTIONS: usize = 100;

/// Connects and writes to the applier server: the server where the
/// migration actually happens. This is typically the primary, but may be a
/// replica under test-on-replica. The applier is the one to write row data
/// and replay binlog events onto the ghost table; it is where the ghost and
/// changelog tables get created and where the cut-over runs.
pub struct Applier {
    pub(crate) config: Config,
    pub(crate) pool: Pool,
    pub(crate) context: Arc<MigrationContext>,
}

impl Applier {
    pub fn new(config: Config, context: Arc<MigrationContext>) -> Result<Self, ApplierError> {
        let pool = config.pool(APPLIER_MAX_CONNECTIONS)?;
        Ok(Self {
            config,
            pool,
            context,
        })
    }

    pub fn context(&self) -> &Arc<MigrationContext> {
        &self.context
    }

    /// Validate the connection and record the server facts the migration
    /// depends on: the applier time zone, the replication format, and the
    /// original table's column ordinals.
    pub async fn init_db_connections(&self) -> Result<(), ApplierError> {
        let mut conn = self.pool.get_conn().await?;
        self.validate_connection(&mut conn).await?;
        self.validate_and_read_time_zone(&mut conn).await?;
        ensure_full_row_binlog_format(&mut conn).await?;
        self.read_table_columns(&mut conn).await?;
        info!(
            version = %self.context.applier_version(),
            "applier initiated"
        );
        Ok(())
    }

    async fn validate_connection(&self, conn: &mut Conn) -> Result<(), ApplierError> {
        let row: Option<(i64, String)> = conn
            .query_first("select @@global.port, @@global.version")
            .await?;
        let (port, version) =
            row.ok_or_else(|| anyhow::anyhow!("the server would not report port and version"))?;
        if port != i64::from(self.config.tcp_port()) {
            return Err(ApplierError::FatalConfig(format!(
                "unexpected database port reported: {}",
                port
            )));
        }
        self.context.set_applier_version(version);
        Ok(())
    }

    async fn validate_and_read_time_zone(&self, conn: &mut Conn) -> Result<(), ApplierError> {
        let time_zone: Option<String> = conn.query_first("select @@global.time_zone").await?;
        let time_zone =
            time_zone.ok_or_else(|| anyhow::anyhow!("the server would not report time_zone"))?;
        info!(%time_zone, "will use time_zone on applier");
        self.context.set_applier_time_zone(time_zone);
        Ok(())
    }

    /// Read the original table's columns in ordinal order and check they
    /// cover the configured iteration key.
    async fn read_table_columns(&self, conn: &mut Conn) -> Result<(), ApplierError> {
        debug!("examining table structure on applier");
        let names: Vec<String> = conn
            .exec(
                "select column_name from information_schema.columns \
                 where table_schema = ? and table_name = ? order by ordinal_position asc",
                (
                    self.context.database_name(),
                    self.context.original_table_name(),
                ),
            )
            .await?;
        if names.is_empty() {
            return Err(ApplierError::FatalConfig(format!(
                "no columns found for {}.{}; does the table exist?",
                self.context.database_name(),
                self.context.original_table_name()
            )));
        }
        let columns = ColumnList::new(names);
        for key_column in self.context.config().unique_key.columns.names() {
            if columns.ordinal(key_column).is_none() {
                return Err(ApplierError::FatalConfig(format!(
                    "iteration key column {} not found on {}.{}",
                    key_column,
                    self.context.database_name(),
                    self.context.original_table_name()
                )));
            }
        }
        self.context.set_original_table_columns_on_applier(columns);
        Ok(())
    }

    /// The row of `SHOW TABLE STATUS LIKE '<table>'`, or `None` when the
    /// table does not exist.
    pub(crate) async fn show_table_status(
        &self,
        table_name: &str,
    ) -> Result<Option<Row>, ApplierError> {
        let mut conn = self.pool.get_conn().await?;
        let statement = format!(
            "show /* ghost */ table status from {} like ?",
            query::escape_identifier(self.context.database_name())
        );
        Ok(conn.exec_first(statement, (table_name,)).await?)
    }

    pub async fn table_exists(&self, table_name: &str) -> Result<bool, ApplierError> {
        Ok(self.show_table_status(table_name).await?.is_some())
    }

    /// Verify the ghost and old tables do not exist, or drop them when the
    /// operator explicitly asked for that.
    pub async fn validate_or_drop_existing_tables(&self) -> Result<(), ApplierError> {
        self.context.validate_table_names()?;
        if self.context.config().initially_drop_ghost_table {
            self.drop_ghost_table().await?;
        }
        let ghost_table_name = self.context.ghost_table_name();
        if self.table_exists(&ghost_table_name).await? {
            return Err(ApplierError::PreexistingTable {
                table: ghost_table_name,
            });
        }
        if self.context.config().initially_drop_old_table {
            self.drop_old_table().await?;
        }
        let old_table_name = self.context.old_table_name();
        if self.table_exists(&old_table_name).await? {
            return Err(ApplierError::PreexistingTable {
                table: old_table_name,
            });
        }
        Ok(())
    }

    /// Create the ghost table with the original's schema.
    pub async fn create_ghost_table(&self) -> Result<(), ApplierError> {
        let statement = format!(
            "create /* ghost */ table {} like {}",
            query::qualified_name(self.context.database_name(), &self.context.ghost_table_name()),
            query::qualified_name(
                self.context.database_name(),
                self.context.original_table_name()
            ),
        );
        info!(table = %self.context.ghost_table_name(), "creating ghost table");
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(statement).await?;
        info!("ghost table created");
        Ok(())
    }

    /// Apply the migration's ALTER clause on the ghost table.
    pub async fn alter_ghost(&self) -> Result<(), ApplierError> {
        let statement = format!(
            "alter /* ghost */ table {} {}",
            query::qualified_name(self.context.database_name(), &self.context.ghost_table_name()),
            self.context.config().alter_statement,
        );
        info!(table = %self.context.ghost_table_name(), "altering ghost table");
        debug!(%statement, "alter statement");
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(statement).await?;
        info!("ghost table altered");
        Ok(())
    }

    /// Drop-then-create the changelog table. Ids 1..=3 are reserved for the
    /// heartbeat, state, and throttle hints; everything else auto-assigns
    /// from 256 up.
    pub async fn create_changelog_table(&self) -> Result<(), ApplierError> {
        self.drop_changelog_table().await?;
        let statement = format!(
            "create /* ghost */ table {} (\
             id bigint auto_increment, \
             last_update timestamp not null DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP, \
             hint varchar(64) charset ascii not null, \
             value varchar(4096) charset ascii not null, \
             primary key(id), \
             unique key hint_uidx(hint)\
             ) auto_increment=256",
            query::qualified_name(
                self.context.database_name(),
                &self.context.changelog_table_name()
            ),
        );
        info!(table = %self.context.changelog_table_name(), "creating changelog table");
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(statement).await?;
        info!("changelog table created");
        Ok(())
    }

    pub(crate) async fn drop_table(&self, table_name: &str) -> Result<(), ApplierError> {
        let statement = format!(
            "drop /* ghost */ table if exists {}",
            query::qualified_name(self.context.database_name(), table_name),
        );
        info!(table = %table_name, "dropping table");
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(statement).await?;
        info!("table dropped");
        Ok(())
    }

    pub async fn drop_changelog_table(&self) -> Result<(), ApplierError> {
        self.drop_table(&self.context.changelog_table_name()).await
    }

    pub async fn drop_old_table(&self) -> Result<(), ApplierError> {
        self.drop_table(&self.context.old_table_name()).await
    }

    pub async fn drop_ghost_table(&self) -> Result<(), ApplierError> {
        self.drop_table(&self.context.ghost_table_name()).await
    }

    /// Drop every helper table this migration created. Errors are logged
    /// and swallowed: teardown must not mask the migration's outcome.
    pub async fn drop_all(&self) {
        if let Err(err) = self.drop_changelog_table().await {
            warn!("teardown: failed dropping changelog table: {err:#}");
        }
        if let Err(err) = self.drop_ghost_table().await {
            warn!("teardown: failed dropping ghost table: {err:#}");
        }
    }

    /// The original table's partitions, in ordinal order. Empty for an
    /// unpartitioned table.
    pub async fn get_partition_infos(&self) -> Result<Vec<PartitionInfo>, ApplierError> {
        let mut conn = self.pool.get_conn().await?;
        let mut partitions = Vec::new();
        let mut results = conn
            .exec_stream(
                "select PARTITION_NAME, TABLE_ROWS from information_schema.partitions \
                 where TABLE_SCHEMA = ? and TABLE_NAME = ? and PARTITION_NAME is not null \
                 order by PARTITION_ORDINAL_POSITION asc",
                (
                    self.context.database_name(),
                    self.context.original_table_name(),
                ),
            )
            .await?;
        while let Some(row) = results.try_next().await? {
            let (partition_name, row_count): (String, Option<u64>) = row;
            partitions.push(PartitionInfo {
                partition_name,
                row_count: row_count.unwrap_or(0),
            });
        }
        Ok(partitions)
    }

    /// Upsert a value into the changelog table by hint.
    pub async fn write_changelog(&self, hint: &str, value: &str) -> Result<(), ApplierError> {
        let explicit_id = self.context.changelog_hint_id(hint);
        let statement = format!(
            "insert /* ghost */ into {} (id, hint, value) \
             values (NULLIF(?, 0), ?, ?) \
             on duplicate key update last_update=NOW(), value=VALUES(value)",
            query::qualified_name(
                self.context.database_name(),
                &self.context.changelog_table_name()
            ),
        );
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(statement, (explicit_id, hint, value)).await?;
        Ok(())
    }

    async fn write_and_log_changelog(&self, hint: &str, value: &str) -> Result<(), ApplierError> {
        self.write_changelog(hint, value).await?;
        let archival_hint = format!(
            "{} at {}",
            hint,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        self.write_changelog(&archival_hint, value).await
    }

    /// Publish a migration state change: the fixed state row is overwritten,
    /// and a timestamped archival row is appended.
    pub async fn write_changelog_state(&self, value: &str) -> Result<(), ApplierError> {
        self.write_and_log_changelog("state", value).await
    }

    /// Periodically write heartbeat rows into the changelog table, from
    /// which replication lag is measured. Runs until the migration finishes
    /// or the consecutive-failure streak exceeds max-retries; the heartbeat
    /// dying does not abort the migration.
    pub async fn initiate_heartbeat(&self) {
        let mut streak = HeartbeatStreak::new(self.context.config().max_retries);
        // First beat immediately, so lag measurement starts with the
        // migration rather than one interval in.
        if !self.inject_heartbeat(&mut streak).await {
            return;
        }
        let mut ticker = time::interval(self.context.config().heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; the beat above
        // already covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.context.finished_migrating() {
                return;
            }
            // A user-commanded throttle skips the write. An involuntary
            // throttle must not: lag computation depends on heartbeats being
            // present while the migration is throttled on lag itself.
            let (throttled, hint) = self.context.throttle_decision();
            if throttled && hint == ThrottleReasonHint::UserCommand {
                continue;
            }
            if !self.inject_heartbeat(&mut streak).await {
                return;
            }
        }
    }

    /// One heartbeat write. Returns false once the loop should exit.
    async fn inject_heartbeat(&self, streak: &mut HeartbeatStreak) -> bool {
        if self.context.hibernate_until() > 0 || self.context.cleanup_imminent() {
            return true;
        }
        let value = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        match self.write_changelog("heartbeat", &value).await {
            Ok(()) => streak.record(true),
            Err(err) => {
                let alive = streak.record(false);
                if !alive {
                    error!("heartbeat failed: {err:#}");
                }
                alive
            }
        }
    }

    /// Execute the operator's throttle query and return its result; 0 when
    /// none is configured.
    pub async fn execute_throttle_query(&self) -> Result<i64, ApplierError> {
        let Some(throttle_query) = self.context.config().throttle_query.clone() else {
            return Ok(0);
        };
        let mut conn = self.pool.get_conn().await?;
        let result: Option<i64> = conn.query_first(throttle_query).await?;
        Ok(result.unwrap_or(0))
    }

    pub async fn show_status_variable(&self, variable_name: &str) -> Result<i64, ApplierError> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<(String, i64)> = conn
            .query_first(format!("show global status like '{}'", variable_name))
            .await?;
        let (_, value) =
            row.ok_or_else(|| anyhow::anyhow!("unknown status variable {}", variable_name))?;
        Ok(value)
    }

    async fn replica_thread_command(&self, statement: &str, what: &str) -> Result<(), ApplierError> {
        info!("{}", what);
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(statement).await?;
        Ok(())
    }

    pub async fn stop_replica_io_thread(&self) -> Result<(), ApplierError> {
        self.replica_thread_command("stop /* ghost */ slave io_thread", "stopping replication IO thread")
            .await
    }

    pub async fn start_replica_io_thread(&self) -> Result<(), ApplierError> {
        self.replica_thread_command("start /* ghost */ slave io_thread", "starting replication IO thread")
            .await
    }

    pub async fn stop_replica_sql_thread(&self) -> Result<(), ApplierError> {
        self.replica_thread_command("stop /* ghost */ slave sql_thread", "stopping replication SQL thread")
            .await
    }

    pub async fn start_replica_sql_thread(&self) -> Result<(), ApplierError> {
        self.replica_thread_command("start /* ghost */ slave sql_thread", "starting replication SQL thread")
            .await
    }

    /// Stop replication on a test-on-replica applier. The SQL thread is
    /// stopped too; the binlog coordinates of both threads are logged.
    pub async fn stop_replication(&self) -> Result<(), ApplierError> {
        self.stop_replica_io_thread().await?;
        self.stop_replica_sql_thread().await?;
        let mut conn = self.pool.get_conn().await?;
        let (read, exec) = replication_binlog_coordinates(&mut conn).await?;
        info!(%read, %exec, "replication stopped");
        Ok(())
    }

    /// Restart replication, as on test-on-replica cut-over failure.
    pub async fn start_replication(&self) -> Result<(), ApplierError> {
        self.start_replica_io_thread().await?;
        self.start_replica_sql_thread().await?;
        info!("replication started");
        Ok(())
    }

    /// Mark the migration finished and release the pool. Errors are logged,
    /// not propagated.
    pub async fn teardown(self) {
        debug!("tearing down");
        self.context.set_finished_migrating();
        if let Err(err) = self.pool.disconnect().await {
            warn!("teardown: failed disconnecting pool: {err:#}");
        }
    }
}

/// Consecutive heartbeat failure bookkeeping: a success resets the streak,
/// and the loop exits once the streak exceeds max-retries.
#[derive(Debug)]
pub(crate) struct HeartbeatStreak {
    successive_failures: u64,
    max_retries: u64,
}

impl HeartbeatStreak {
    pub(crate) fn new(max_retries: u64) -> Self {
        Self {
            successive_failures: 0,
            max_retries,
        }
    }

    /// Record one write outcome; returns whether the heartbeat stays alive.
    pub(crate) fn record(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.successive_failures = 0;
            return true;
        }
        self.successive_failures += 1;
        self.successive_failures <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_streak_survives_up_to_max_retries() {
        let mut streak = HeartbeatStreak::new(3);
        for _ in 0..3 {
            assert!(streak.record(false));
        }
        // A success within the budget resets the streak entirely.
        assert!(streak.record(true));
        for _ in 0..3 {
            assert!(streak.record(false));
        }
        // One more failure breaches the budget.
        assert!(!streak.record(false));
    }

    #[test]
    fn test_heartbeat_streak_zero_budget() {
        let mut streak = HeartbeatStreak::new(0);
        assert!(streak.record(true));
        assert!(!streak.record(false));
    }
}
