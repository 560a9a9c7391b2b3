// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The row-copy side of the migration: walk the original table in iteration
//! key order, one bounded chunk per transaction, and bulk-insert each chunk
//! into the ghost table under a shared read lock.

use std::time::{Duration, Instant};

use mysql_async::prelude::Queryable;
use mysql_async::{Row, TxOpts};
use tracing::{debug, info};

use crate::query;
use crate::types::{ColumnValues, PartitionInfo};
use crate::{Applier, ApplierError};

/// The outcome of one row-copy step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    /// The key range is exhausted; row copy is complete.
    pub done: bool,
    pub chunk_size: u64,
    pub rows_affected: u64,
    pub duration: Duration,
}

impl Applier {
    /// Read the absolute migration range (min, max) of the iteration key.
    /// An empty table leaves the range unset, and the iterator reports done
    /// on its first call.
    pub async fn read_migration_range_values(
        &self,
        partition: Option<&PartitionInfo>,
    ) -> Result<(), ApplierError> {
        let key_columns = &self.context.config().unique_key.columns;
        debug!(key = %self.context.config().unique_key.name, "reading migration range");
        let mut conn = self.pool.get_conn().await?;
        let min: Option<Row> = conn
            .query_first(query::build_unique_key_min_values_query(
                self.context.database_name(),
                self.context.original_table_name(),
                partition,
                key_columns,
            ))
            .await?;
        let max: Option<Row> = conn
            .query_first(query::build_unique_key_max_values_query(
                self.context.database_name(),
                self.context.original_table_name(),
                partition,
                key_columns,
            ))
            .await?;
        match (min, max) {
            (Some(min), Some(max)) => {
                let min = ColumnValues::from_row(min);
                let max = ColumnValues::from_row(max);
                match partition {
                    Some(partition) => info!(
                        partition = %partition.partition_name,
                        %min, %max, "migration range"
                    ),
                    None => info!(%min, %max, "migration range"),
                }
                self.context.set_migration_range(min, max);
            }
            _ => info!("empty table; nothing to copy"),
        }
        Ok(())
    }

    /// Compute the next chunk's range end. Returns false when there is no
    /// further chunk to work through: the range is exhausted and row copy is
    /// done.
    pub async fn calculate_next_iteration_range_end(
        &self,
        partition: Option<&PartitionInfo>,
    ) -> Result<bool, ApplierError> {
        let Some(iteration_range_min) = self.context.advance_iteration_range_start() else {
            return Ok(false);
        };
        let Some(migration_range_max) = self.context.migration_range_max() else {
            return Ok(false);
        };
        let unique_key = &self.context.config().unique_key;
        let chunk_size = self.context.chunk_size();
        let include_range_start = self.context.iteration() == 0;
        let hint = format!("iteration:{}", self.context.iteration());

        let mut conn = self.pool.get_conn().await?;
        // Offset strategy first; the temptable materialization is the
        // fallback for servers that mis-plan the offset scan.
        for use_temptable in [false, true] {
            let (statement, args) = if use_temptable {
                query::build_unique_key_range_end_query_via_temptable(
                    self.context.database_name(),
                    self.context.original_table_name(),
                    partition,
                    unique_key,
                    iteration_range_min.values(),
                    migration_range_max.values(),
                    chunk_size,
                    include_range_start,
                    &hint,
                )
            } else {
                query::build_unique_key_range_end_query_via_offset(
                    self.context.database_name(),
                    self.context.original_table_name(),
                    partition,
                    unique_key,
                    iteration_range_min.values(),
                    migration_range_max.values(),
                    chunk_size,
                    include_range_start,
                    &hint,
                )
            };
            let row: Option<Row> = conn.exec_first(statement, args).await?;
            if let Some(row) = row {
                let iteration_range_max = ColumnValues::from_row(row);
                debug!(
                    iteration = self.context.iteration(),
                    range_end = %iteration_range_max,
                    "next chunk range end"
                );
                self.context.set_iteration_range_max(iteration_range_max);
                return Ok(true);
            }
        }
        if partition.is_none() {
            info!("iteration complete: no further range to iterate");
        }
        Ok(false)
    }

    /// Issue the chunk INSERT on the ghost table: this is where data
    /// actually gets copied from the original table. The SELECT holds a
    /// shared lock on the copied range so that every concurrent change to
    /// those rows produces a binlog event the streamer observes.
    pub async fn apply_iteration_insert(
        &self,
        partition: Option<&PartitionInfo>,
    ) -> Result<(u64, u64, Duration), ApplierError> {
        let start_time = Instant::now();
        let chunk_size = self.context.chunk_size();
        let config = self.context.config();
        let iteration_range_min = self
            .context
            .iteration_range_min()
            .ok_or_else(|| anyhow::anyhow!("no iteration range start to copy from"))?;
        let iteration_range_max = self
            .context
            .iteration_range_max()
            .ok_or_else(|| anyhow::anyhow!("no iteration range end to copy to"))?;
        let (statement, args) = query::build_range_insert_query(
            self.context.database_name(),
            self.context.original_table_name(),
            &self.context.ghost_table_name(),
            partition,
            config.row_copy_filter.as_deref(),
            &config.shared_columns,
            &config.mapped_shared_columns,
            &config.unique_key,
            iteration_range_min.values(),
            iteration_range_max.values(),
            self.context.iteration() == 0,
            config.transactional_table,
        );

        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        // Session scope for this transaction only: copy in the applier's
        // recorded time zone, with strict sql_mode. The pooled connection
        // comes back clean either way.
        tx.query_drop(format!(
            "SET SESSION time_zone = '{}', \
             sql_mode = CONCAT(@@session.sql_mode, ',STRICT_ALL_TABLES')",
            self.context.applier_time_zone()
        ))
        .await?;
        let rows_affected = {
            let result = tx.exec_iter(statement, args).await?;
            result.affected_rows()
        };
        // An error path simply drops the transaction, which rolls it back;
        // a rollback racing a completed commit is ignored by design.
        tx.commit().await?;
        self.context.increment_iteration();

        let duration = start_time.elapsed();
        debug!(
            iteration = self.context.iteration(),
            chunk_size,
            rows_affected,
            range_start = %iteration_range_min,
            range_end = %iteration_range_max,
            "issued chunk INSERT"
        );
        Ok((chunk_size, rows_affected, duration))
    }

    /// One full copy step: advance the iteration range, then chunk-insert.
    /// Reports `done` without copying when the range is exhausted.
    pub async fn copy_one_chunk(
        &self,
        partition: Option<&PartitionInfo>,
    ) -> Result<ChunkResult, ApplierError> {
        if !self.calculate_next_iteration_range_end(partition).await? {
            return Ok(ChunkResult {
                done: true,
                chunk_size: self.context.chunk_size(),
                rows_affected: 0,
                duration: Duration::ZERO,
            });
        }
        let (chunk_size, rows_affected, duration) = self.apply_iteration_insert(partition).await?;
        Ok(ChunkResult {
            done: false,
            chunk_size,
            rows_affected,
            duration,
        })
    }
}
