// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Translation of intercepted row events into idempotent statements on the
//! ghost table, and their batched application.
//!
//! A DELETE becomes a key-equals DELETE; an INSERT becomes a REPLACE (the
//! row may already exist from the chunk copy, and the latest image must
//! win); an UPDATE that leaves the iteration key untouched becomes an
//! in-place UPDATE. The subtle case is an UPDATE that moves the key: it is
//! split into a DELETE of the old key followed by an INSERT of the new row.

use mysql_async::prelude::Queryable;
use mysql_async::{TxOpts, Value};
use tracing::debug;

use crate::context::MigrationContext;
use crate::query;
use crate::types::{BinlogDmlEvent, ColumnValues, DmlKind};
use crate::{Applier, ApplierError, TranslatorError};

/// One statement to execute against the ghost table, translated from an
/// intercepted row event.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlBuildResult {
    pub query: String,
    pub args: Vec<Value>,
    /// The statement's contribution to the ghost table's estimated row
    /// count: −1 for a delete, +1 for a replace, 0 for an in-place update.
    pub rows_delta: i64,
}

fn where_values(event: &BinlogDmlEvent) -> Result<&ColumnValues, TranslatorError> {
    event
        .where_values
        .as_ref()
        .ok_or_else(|| TranslatorError::MissingRowImage {
            kind: event.kind,
            table: event.table_name.clone(),
            image: "where",
        })
}

fn new_values(event: &BinlogDmlEvent) -> Result<&ColumnValues, TranslatorError> {
    event
        .new_values
        .as_ref()
        .ok_or_else(|| TranslatorError::MissingRowImage {
            kind: event.kind,
            table: event.table_name.clone(),
            image: "new",
        })
}

/// Whether an UPDATE event modifies any column of the iteration key,
/// returning the first such column. Key values are extracted from the full
/// row images by the original table's column ordinals.
pub(crate) fn update_modifies_unique_key(
    context: &MigrationContext,
    event: &BinlogDmlEvent,
) -> Result<Option<String>, TranslatorError> {
    let config = context.config();
    let where_values = where_values(event)?;
    let new_values = new_values(event)?;
    for column in config.unique_key.columns.names() {
        let ordinal = config.original_table_columns.ordinal(column).ok_or_else(|| {
            TranslatorError::MissingColumnOrdinal {
                column: column.clone(),
            }
        })?;
        let missing = || TranslatorError::MissingColumnOrdinal {
            column: column.clone(),
        };
        let where_value = where_values.get(ordinal).ok_or_else(missing)?;
        let new_value = new_values.get(ordinal).ok_or_else(missing)?;
        if where_value != new_value {
            return Ok(Some(column.clone()));
        }
    }
    Ok(None)
}

fn build_delete(
    context: &MigrationContext,
    event: &BinlogDmlEvent,
) -> Result<DmlBuildResult, TranslatorError> {
    let config = context.config();
    let (query, args) = query::build_dml_delete_query(
        &event.database_name,
        &context.ghost_table_name(),
        &config.original_table_columns,
        &config.unique_key.columns,
        where_values(event)?,
    )?;
    Ok(DmlBuildResult {
        query,
        args,
        rows_delta: -1,
    })
}

fn build_insert(
    context: &MigrationContext,
    event: &BinlogDmlEvent,
) -> Result<DmlBuildResult, TranslatorError> {
    let config = context.config();
    let (query, args) = query::build_dml_insert_query(
        &event.database_name,
        &context.ghost_table_name(),
        &config.original_table_columns,
        &config.shared_columns,
        &config.mapped_shared_columns,
        new_values(event)?,
    )?;
    Ok(DmlBuildResult {
        query,
        args,
        rows_delta: 1,
    })
}

fn build_update(
    context: &MigrationContext,
    event: &BinlogDmlEvent,
) -> Result<DmlBuildResult, TranslatorError> {
    let config = context.config();
    let (query, args) = query::build_dml_update_query(
        &event.database_name,
        &context.ghost_table_name(),
        &config.original_table_columns,
        &config.shared_columns,
        &config.mapped_shared_columns,
        &config.unique_key.columns,
        new_values(event)?,
        where_values(event)?,
    )?;
    Ok(DmlBuildResult {
        query,
        args,
        rows_delta: 0,
    })
}

/// Translate one intercepted row event into one or two statements on the
/// ghost table.
pub(crate) fn build_dml_event_queries(
    context: &MigrationContext,
    event: &BinlogDmlEvent,
) -> Result<Vec<DmlBuildResult>, TranslatorError> {
    match event.kind {
        DmlKind::Delete => Ok(vec![build_delete(context, event)?]),
        DmlKind::Insert => Ok(vec![build_insert(context, event)?]),
        DmlKind::Update => {
            if update_modifies_unique_key(context, event)?.is_some() {
                // The key moved: retire the old row, then materialize the
                // new image under the new key.
                Ok(vec![build_delete(context, event)?, build_insert(context, event)?])
            } else {
                Ok(vec![build_update(context, event)?])
            }
        }
    }
}

impl Applier {
    /// Apply a batch of intercepted row events onto the ghost table in a
    /// single transaction. Session setup costs about a millisecond, so
    /// batching many events per transaction is what sustains throughput.
    pub async fn apply_dml_events(&self, events: &[BinlogDmlEvent]) -> Result<(), ApplierError> {
        let mut total_delta: i64 = 0;
        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        // Replayed events carry their values as written upstream; apply in
        // UTC with strict sql_mode, scoped to this transaction.
        tx.query_drop(
            "SET SESSION time_zone = '+00:00', \
             sql_mode = CONCAT(@@session.sql_mode, ',STRICT_ALL_TABLES')",
        )
        .await?;
        for event in events {
            for build in build_dml_event_queries(&self.context, event)? {
                if let Err(err) = tx.exec_drop(build.query.as_str(), build.args.clone()).await {
                    // Dropping the transaction rolls back the whole batch.
                    return Err(anyhow::Error::new(err)
                        .context(format!("query={}; args={:?}", build.query, build.args))
                        .into());
                }
                total_delta += build.rows_delta;
            }
        }
        tx.commit().await?;
        self.context.add_dml_events_applied(events.len() as u64);
        if self.context.config().count_table_rows {
            self.context.add_rows_delta(total_delta);
        }
        debug!(events = events.len(), "applied dml events in one transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MigrationConfig;
    use crate::types::{ColumnList, UniqueKey};
    use proptest::prelude::*;

    // An original table (id, ts0, name, updated) iterated over the
    // composite unique key (id, ts0); all columns shared and unrenamed.
    fn test_context() -> MigrationContext {
        let table_columns = ColumnList::from_names(&["id", "ts0", "name", "updated"]);
        MigrationContext::new(MigrationConfig::new(
            "test",
            "sample",
            "add column extra int default 0",
            UniqueKey::new("uidx", ColumnList::from_names(&["id", "ts0"])),
            table_columns.clone(),
            table_columns.clone(),
            table_columns,
        ))
    }

    fn row(id: i64, ts0: i64, name: &str, updated: i64) -> ColumnValues {
        ColumnValues::new(vec![
            Value::Int(id),
            Value::Int(ts0),
            Value::from(name),
            Value::Int(updated),
        ])
    }

    #[test]
    fn test_delete_event_translation() {
        let context = test_context();
        let event = BinlogDmlEvent {
            database_name: "test".to_string(),
            table_name: "sample".to_string(),
            kind: DmlKind::Delete,
            where_values: Some(row(5, 99, "x", 0)),
            new_values: None,
        };
        let results = build_dml_event_queries(&context, &event).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].query,
            "delete /* ghost */ from `test`.`_sample_gho` where ((`id` = ?) and (`ts0` = ?))"
        );
        assert_eq!(results[0].args, vec![Value::Int(5), Value::Int(99)]);
        assert_eq!(results[0].rows_delta, -1);
    }

    #[test]
    fn test_insert_event_translation() {
        let context = test_context();
        let event = BinlogDmlEvent {
            database_name: "test".to_string(),
            table_name: "sample".to_string(),
            kind: DmlKind::Insert,
            where_values: None,
            new_values: Some(row(5, 99, "x", 0)),
        };
        let results = build_dml_event_queries(&context, &event).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].query,
            "replace /* ghost */ into `test`.`_sample_gho` (`id`, `ts0`, `name`, `updated`) values (?, ?, ?, ?)"
        );
        assert_eq!(results[0].rows_delta, 1);
    }

    #[test]
    fn test_update_event_keeping_key_in_place() {
        let context = test_context();
        let event = BinlogDmlEvent {
            database_name: "test".to_string(),
            table_name: "sample".to_string(),
            kind: DmlKind::Update,
            where_values: Some(row(5, 99, "x", 0)),
            new_values: Some(row(5, 99, "x", 1)),
        };
        assert_eq!(update_modifies_unique_key(&context, &event).unwrap(), None);
        let results = build_dml_event_queries(&context, &event).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].query,
            "update /* ghost */ `test`.`_sample_gho` set `id`=?, `ts0`=?, `name`=?, `updated`=? where ((`id` = ?) and (`ts0` = ?))"
        );
        // Set args carry the new image; the where args carry the old key.
        assert_eq!(
            results[0].args,
            vec![
                Value::Int(5),
                Value::Int(99),
                Value::from("x"),
                Value::Int(1),
                Value::Int(5),
                Value::Int(99),
            ]
        );
        assert_eq!(results[0].rows_delta, 0);
    }

    #[test]
    fn test_update_event_moving_key_splits_into_delete_insert() {
        let context = test_context();
        // Only ts0 changes, and ts0 is part of the iteration key.
        let event = BinlogDmlEvent {
            database_name: "test".to_string(),
            table_name: "sample".to_string(),
            kind: DmlKind::Update,
            where_values: Some(row(5, 99, "x", 0)),
            new_values: Some(row(5, 100, "x", 0)),
        };
        assert_eq!(
            update_modifies_unique_key(&context, &event).unwrap(),
            Some("ts0".to_string())
        );
        let results = build_dml_event_queries(&context, &event).unwrap();
        assert_eq!(results.len(), 2);

        assert!(results[0].query.starts_with("delete /* ghost */ from `test`.`_sample_gho`"));
        assert_eq!(results[0].args, vec![Value::Int(5), Value::Int(99)]);
        assert_eq!(results[0].rows_delta, -1);

        assert!(results[1].query.starts_with("replace /* ghost */ into `test`.`_sample_gho`"));
        assert_eq!(
            results[1].args,
            vec![
                Value::Int(5),
                Value::Int(100),
                Value::from("x"),
                Value::Int(0),
            ]
        );
        assert_eq!(results[1].rows_delta, 1);
    }

    #[test]
    fn test_update_event_missing_row_image() {
        let context = test_context();
        let event = BinlogDmlEvent {
            database_name: "test".to_string(),
            table_name: "sample".to_string(),
            kind: DmlKind::Update,
            where_values: Some(row(5, 99, "x", 0)),
            new_values: None,
        };
        let err = build_dml_event_queries(&context, &event).unwrap_err();
        assert!(matches!(
            err,
            TranslatorError::MissingRowImage { image: "new", .. }
        ));
    }

    proptest! {
        // For any UPDATE, the translator emits exactly [DELETE −1, REPLACE
        // +1] iff some key column differs between the row images, and a
        // single delta-0 UPDATE otherwise.
        #[test]
        fn prop_update_translation_shape(
            old_id in -1000i64..1000,
            old_ts in -1000i64..1000,
            new_id in -1000i64..1000,
            new_ts in -1000i64..1000,
        ) {
            let context = test_context();
            let event = BinlogDmlEvent {
                database_name: "test".to_string(),
                table_name: "sample".to_string(),
                kind: DmlKind::Update,
                where_values: Some(row(old_id, old_ts, "x", 0)),
                new_values: Some(row(new_id, new_ts, "x", 1)),
            };
            let results = build_dml_event_queries(&context, &event).unwrap();
            let key_moved = (old_id, old_ts) != (new_id, new_ts);
            if key_moved {
                prop_assert_eq!(results.len(), 2);
                prop_assert_eq!(results[0].rows_delta, -1);
                prop_assert!(results[0].query.starts_with("delete /* ghost */"));
                prop_assert_eq!(results[1].rows_delta, 1);
                prop_assert!(results[1].query.starts_with("replace /* ghost */"));
            } else {
                prop_assert_eq!(results.len(), 1);
                prop_assert_eq!(results[0].rows_delta, 0);
                prop_assert!(results[0].query.starts_with("update /* ghost */"));
            }
            let net_delta: i64 = results.iter().map(|r| r.rows_delta).sum();
            prop_assert_eq!(net_delta, 0);
        }
    }
}
