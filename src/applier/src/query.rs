// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Builders for the parametric statements the applier issues. Identifiers
//! are backtick-escaped and embedded literally; every row value is bound as
//! a `?` parameter, with composite-key comparisons exploding their value
//! tuples into positional args.

use itertools::Itertools;
use mysql_async::Value;

use crate::types::{ColumnList, ColumnValues, PartitionInfo, UniqueKey};
use crate::TranslatorError;

/// Escape a MySQL identifier with backticks.
pub fn escape_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn qualified_name(database: &str, table: &str) -> String {
    format!("{}.{}", escape_identifier(database), escape_identifier(table))
}

fn partition_clause(partition: Option<&PartitionInfo>) -> String {
    match partition {
        Some(partition) => format!(
            " partition ({})",
            escape_identifier(&partition.partition_name)
        ),
        None => String::new(),
    }
}

fn escaped_list(columns: &ColumnList) -> String {
    columns.names().iter().map(|name| escape_identifier(name)).join(", ")
}

fn order_by_clause(columns: &ColumnList, direction: &str) -> String {
    columns
        .names()
        .iter()
        .map(|name| format!("{} {}", escape_identifier(name), direction))
        .join(", ")
}

/// The direction of a key-range boundary comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    GreaterThan,
    GreaterThanOrEquals,
    LessThanOrEquals,
}

impl RangeBound {
    fn strict_operator(self) -> &'static str {
        match self {
            RangeBound::GreaterThan | RangeBound::GreaterThanOrEquals => ">",
            RangeBound::LessThanOrEquals => "<",
        }
    }

    fn includes_equality(self) -> bool {
        matches!(
            self,
            RangeBound::GreaterThanOrEquals | RangeBound::LessThanOrEquals
        )
    }
}

fn join_clauses(clauses: Vec<String>, separator: &str) -> String {
    if clauses.len() == 1 {
        clauses.into_iter().next().expect("one clause")
    } else {
        format!("({})", clauses.into_iter().join(separator))
    }
}

/// Compare a composite key tuple against a bound, in strictly ascending
/// lexicographic column order. For columns `(a, b)` and a strict `>` bound
/// this renders `((a > ?) or ((a = ?) and (b > ?)))`; inclusive bounds
/// append the all-equals clause. Returns the clause and its exploded args.
pub fn build_range_comparison(
    columns: &ColumnList,
    values: &[Value],
    bound: RangeBound,
) -> (String, Vec<Value>) {
    assert_eq!(
        columns.len(),
        values.len(),
        "key arity must match the value tuple"
    );
    let names = columns.names();
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    for i in 0..names.len() {
        let mut parts = Vec::new();
        for j in 0..i {
            parts.push(format!("({} = ?)", escape_identifier(&names[j])));
            args.push(values[j].clone());
        }
        parts.push(format!(
            "({} {} ?)",
            escape_identifier(&names[i]),
            bound.strict_operator()
        ));
        args.push(values[i].clone());
        clauses.push(join_clauses(parts, " and "));
    }
    if bound.includes_equality() {
        let equals = names
            .iter()
            .map(|name| format!("({} = ?)", escape_identifier(name)))
            .collect::<Vec<_>>();
        args.extend(values.iter().cloned());
        clauses.push(join_clauses(equals, " and "));
    }
    (join_clauses(clauses, " or "), args)
}

/// Tuple equality over the given columns: `((a = ?) and (b = ?))`.
pub fn build_equals_comparison(columns: &ColumnList) -> String {
    let clauses = columns
        .names()
        .iter()
        .map(|name| format!("({} = ?)", escape_identifier(name)))
        .collect::<Vec<_>>();
    join_clauses(clauses, " and ")
}

fn build_unique_key_extreme_values_query(
    database: &str,
    table: &str,
    partition: Option<&PartitionInfo>,
    key_columns: &ColumnList,
    direction: &str,
) -> String {
    format!(
        "select /* ghost {qualified} */ {columns} from {qualified}{partition} order by {order} limit 1",
        qualified = qualified_name(database, table),
        columns = escaped_list(key_columns),
        partition = partition_clause(partition),
        order = order_by_clause(key_columns, direction),
    )
}

/// The minimum value tuple of the iteration key: the start of the migration
/// range.
pub fn build_unique_key_min_values_query(
    database: &str,
    table: &str,
    partition: Option<&PartitionInfo>,
    key_columns: &ColumnList,
) -> String {
    build_unique_key_extreme_values_query(database, table, partition, key_columns, "asc")
}

/// The maximum value tuple of the iteration key: the end of the migration
/// range.
pub fn build_unique_key_max_values_query(
    database: &str,
    table: &str,
    partition: Option<&PartitionInfo>,
    key_columns: &ColumnList,
) -> String {
    build_unique_key_extreme_values_query(database, table, partition, key_columns, "desc")
}

/// Range-end probe, offset strategy: skip chunk-size minus one rows past the
/// iteration start and take the next key tuple as the chunk's end.
pub fn build_unique_key_range_end_query_via_offset(
    database: &str,
    table: &str,
    partition: Option<&PartitionInfo>,
    unique_key: &UniqueKey,
    iteration_range_min: &[Value],
    migration_range_max: &[Value],
    chunk_size: u64,
    include_range_start: bool,
    hint: &str,
) -> (String, Vec<Value>) {
    let start_bound = if include_range_start {
        RangeBound::GreaterThanOrEquals
    } else {
        RangeBound::GreaterThan
    };
    let (start_clause, start_args) =
        build_range_comparison(&unique_key.columns, iteration_range_min, start_bound);
    let (end_clause, end_args) = build_range_comparison(
        &unique_key.columns,
        migration_range_max,
        RangeBound::LessThanOrEquals,
    );
    let query = format!(
        "select /* ghost {qualified} {hint} */ {columns} from {qualified}{partition} force index ({index}) where ({start} and {end}) order by {order} limit 1 offset {offset}",
        qualified = qualified_name(database, table),
        columns = escaped_list(&unique_key.columns),
        partition = partition_clause(partition),
        index = escape_identifier(&unique_key.name),
        start = start_clause,
        end = end_clause,
        order = order_by_clause(&unique_key.columns, "asc"),
        offset = chunk_size.saturating_sub(1),
    );
    let mut args = start_args;
    args.extend(end_args);
    (query, args)
}

/// Range-end probe, temptable fallback: materialize the first chunk-size
/// rows into a derived table and take the last by descending key order.
pub fn build_unique_key_range_end_query_via_temptable(
    database: &str,
    table: &str,
    partition: Option<&PartitionInfo>,
    unique_key: &UniqueKey,
    iteration_range_min: &[Value],
    migration_range_max: &[Value],
    chunk_size: u64,
    include_range_start: bool,
    hint: &str,
) -> (String, Vec<Value>) {
    let start_bound = if include_range_start {
        RangeBound::GreaterThanOrEquals
    } else {
        RangeBound::GreaterThan
    };
    let (start_clause, start_args) =
        build_range_comparison(&unique_key.columns, iteration_range_min, start_bound);
    let (end_clause, end_args) = build_range_comparison(
        &unique_key.columns,
        migration_range_max,
        RangeBound::LessThanOrEquals,
    );
    let query = format!(
        "select /* ghost {qualified} {hint} */ {columns} from (select {columns} from {qualified}{partition} where ({start} and {end}) order by {order_asc} limit {chunk_size}) select_osc_chunk order by {order_desc} limit 1",
        qualified = qualified_name(database, table),
        columns = escaped_list(&unique_key.columns),
        partition = partition_clause(partition),
        start = start_clause,
        end = end_clause,
        order_asc = order_by_clause(&unique_key.columns, "asc"),
        order_desc = order_by_clause(&unique_key.columns, "desc"),
    );
    let mut args = start_args;
    args.extend(end_args);
    (query, args)
}

/// The chunk copy: `INSERT ... SELECT` of the shared columns over one key
/// range. The SELECT takes a shared lock so every concurrent change to the
/// range produces a binlog event the streamer observes. IGNORE is emitted
/// when the chunk includes the range start (a restart from zero must
/// tolerate rows already copied) and for non-transactional tables (a failed
/// chunk cannot roll back, so a retry must tolerate duplicates).
pub fn build_range_insert_query(
    database: &str,
    original_table: &str,
    ghost_table: &str,
    partition: Option<&PartitionInfo>,
    row_copy_filter: Option<&str>,
    shared_columns: &ColumnList,
    mapped_shared_columns: &ColumnList,
    unique_key: &UniqueKey,
    iteration_range_min: &[Value],
    iteration_range_max: &[Value],
    include_range_start: bool,
    transactional: bool,
) -> (String, Vec<Value>) {
    let start_bound = if include_range_start {
        RangeBound::GreaterThanOrEquals
    } else {
        RangeBound::GreaterThan
    };
    let (start_clause, start_args) =
        build_range_comparison(&unique_key.columns, iteration_range_min, start_bound);
    let (end_clause, end_args) = build_range_comparison(
        &unique_key.columns,
        iteration_range_max,
        RangeBound::LessThanOrEquals,
    );
    let ignore = if include_range_start || !transactional {
        " ignore"
    } else {
        ""
    };
    let lock = if transactional {
        " lock in share mode"
    } else {
        ""
    };
    let filter = match row_copy_filter {
        Some(filter) => format!(" and ({})", filter),
        None => String::new(),
    };
    let query = format!(
        "insert /* ghost {original_qualified} */{ignore} into {ghost_qualified} ({mapped}) (select {shared} from {original_qualified}{partition} force index ({index}) where ({start} and {end}{filter}){lock})",
        original_qualified = qualified_name(database, original_table),
        ghost_qualified = qualified_name(database, ghost_table),
        mapped = escaped_list(mapped_shared_columns),
        shared = escaped_list(shared_columns),
        partition = partition_clause(partition),
        index = escape_identifier(&unique_key.name),
        start = start_clause,
        end = end_clause,
    );
    let mut args = start_args;
    args.extend(end_args);
    (query, args)
}

fn extract_column_values(
    columns: &ColumnList,
    table_columns: &ColumnList,
    row: &ColumnValues,
) -> Result<Vec<Value>, TranslatorError> {
    columns
        .names()
        .iter()
        .map(|column| {
            let ordinal = table_columns.ordinal(column).ok_or_else(|| {
                TranslatorError::MissingColumnOrdinal {
                    column: column.clone(),
                }
            })?;
            row.get(ordinal)
                .cloned()
                .ok_or_else(|| TranslatorError::MissingColumnOrdinal {
                    column: column.clone(),
                })
        })
        .collect()
}

/// `DELETE FROM G WHERE <key-equals>` for a replayed DELETE event.
pub fn build_dml_delete_query(
    database: &str,
    ghost_table: &str,
    table_columns: &ColumnList,
    key_columns: &ColumnList,
    where_values: &ColumnValues,
) -> Result<(String, Vec<Value>), TranslatorError> {
    let args = extract_column_values(key_columns, table_columns, where_values)?;
    let query = format!(
        "delete /* ghost */ from {qualified} where {clause}",
        qualified = qualified_name(database, ghost_table),
        clause = build_equals_comparison(key_columns),
    );
    Ok((query, args))
}

/// `REPLACE INTO G` for a replayed INSERT event. REPLACE rather than plain
/// INSERT: during the copy overlap window the row may already exist in the
/// ghost table, and the latest image must win.
pub fn build_dml_insert_query(
    database: &str,
    ghost_table: &str,
    table_columns: &ColumnList,
    shared_columns: &ColumnList,
    mapped_shared_columns: &ColumnList,
    new_values: &ColumnValues,
) -> Result<(String, Vec<Value>), TranslatorError> {
    let args = extract_column_values(shared_columns, table_columns, new_values)?;
    let placeholders = std::iter::repeat("?").take(args.len()).join(", ");
    let query = format!(
        "replace /* ghost */ into {qualified} ({mapped}) values ({placeholders})",
        qualified = qualified_name(database, ghost_table),
        mapped = escaped_list(mapped_shared_columns),
    );
    Ok((query, args))
}

/// `UPDATE G SET <mapped> WHERE <key-equals>` for a replayed UPDATE that
/// leaves the iteration key untouched.
pub fn build_dml_update_query(
    database: &str,
    ghost_table: &str,
    table_columns: &ColumnList,
    shared_columns: &ColumnList,
    mapped_shared_columns: &ColumnList,
    key_columns: &ColumnList,
    new_values: &ColumnValues,
    where_values: &ColumnValues,
) -> Result<(String, Vec<Value>), TranslatorError> {
    let mut args = extract_column_values(shared_columns, table_columns, new_values)?;
    args.extend(extract_column_values(
        key_columns,
        table_columns,
        where_values,
    )?);
    let assignments = mapped_shared_columns
        .names()
        .iter()
        .map(|name| format!("{}=?", escape_identifier(name)))
        .join(", ");
    let query = format!(
        "update /* ghost */ {qualified} set {assignments} where {clause}",
        qualified = qualified_name(database, ghost_table),
        clause = build_equals_comparison(key_columns),
    );
    Ok((query, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_values(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("id"), "`id`");
        assert_eq!(escape_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_range_comparison_single_column() {
        let columns = ColumnList::from_names(&["id"]);
        let (clause, args) =
            build_range_comparison(&columns, &int_values(&[3]), RangeBound::GreaterThan);
        assert_eq!(clause, "(`id` > ?)");
        assert_eq!(args, int_values(&[3]));

        let (clause, args) =
            build_range_comparison(&columns, &int_values(&[3]), RangeBound::LessThanOrEquals);
        assert_eq!(clause, "((`id` < ?) or (`id` = ?))");
        assert_eq!(args, int_values(&[3, 3]));
    }

    #[test]
    fn test_range_comparison_composite_key() {
        let columns = ColumnList::from_names(&["id", "ts0"]);
        let (clause, args) =
            build_range_comparison(&columns, &int_values(&[3, 7]), RangeBound::GreaterThan);
        assert_eq!(
            clause,
            "((`id` > ?) or ((`id` = ?) and (`ts0` > ?)))"
        );
        assert_eq!(args, int_values(&[3, 3, 7]));

        let (clause, args) = build_range_comparison(
            &columns,
            &int_values(&[3, 7]),
            RangeBound::GreaterThanOrEquals,
        );
        assert_eq!(
            clause,
            "((`id` > ?) or ((`id` = ?) and (`ts0` > ?)) or ((`id` = ?) and (`ts0` = ?)))"
        );
        assert_eq!(args, int_values(&[3, 3, 7, 3, 7]));
    }

    #[test]
    fn test_min_max_values_queries() {
        let columns = ColumnList::from_names(&["id", "ts0"]);
        assert_eq!(
            build_unique_key_min_values_query("test", "sample", None, &columns),
            "select /* ghost `test`.`sample` */ `id`, `ts0` from `test`.`sample` order by `id` asc, `ts0` asc limit 1"
        );
        let partition = PartitionInfo {
            partition_name: "p3".to_string(),
            row_count: 100,
        };
        assert_eq!(
            build_unique_key_max_values_query("test", "sample", Some(&partition), &columns),
            "select /* ghost `test`.`sample` */ `id`, `ts0` from `test`.`sample` partition (`p3`) order by `id` desc, `ts0` desc limit 1"
        );
    }

    #[test]
    fn test_range_end_query_via_offset() {
        let unique_key = UniqueKey::new("PRIMARY", ColumnList::from_names(&["id"]));
        let (query, args) = build_unique_key_range_end_query_via_offset(
            "test",
            "sample",
            None,
            &unique_key,
            &int_values(&[10]),
            &int_values(&[100]),
            25,
            false,
            "iteration:4",
        );
        assert_eq!(
            query,
            "select /* ghost `test`.`sample` iteration:4 */ `id` from `test`.`sample` force index (`PRIMARY`) where ((`id` > ?) and ((`id` < ?) or (`id` = ?))) order by `id` asc limit 1 offset 24"
        );
        assert_eq!(args, int_values(&[10, 100, 100]));
    }

    #[test]
    fn test_range_end_query_via_temptable() {
        let unique_key = UniqueKey::new("PRIMARY", ColumnList::from_names(&["id"]));
        let (query, args) = build_unique_key_range_end_query_via_temptable(
            "test",
            "sample",
            None,
            &unique_key,
            &int_values(&[10]),
            &int_values(&[100]),
            25,
            true,
            "iteration:0",
        );
        assert_eq!(
            query,
            "select /* ghost `test`.`sample` iteration:0 */ `id` from (select `id` from `test`.`sample` where (((`id` > ?) or (`id` = ?)) and ((`id` < ?) or (`id` = ?))) order by `id` asc limit 25) select_osc_chunk order by `id` desc limit 1"
        );
        assert_eq!(args, int_values(&[10, 10, 100, 100]));
    }

    #[test]
    fn test_range_insert_query_first_iteration() {
        let unique_key = UniqueKey::new("PRIMARY", ColumnList::from_names(&["id"]));
        let shared = ColumnList::from_names(&["id", "name"]);
        let mapped = ColumnList::from_names(&["id", "full_name"]);
        let (query, args) = build_range_insert_query(
            "test",
            "sample",
            "_sample_gho",
            None,
            None,
            &shared,
            &mapped,
            &unique_key,
            &int_values(&[1]),
            &int_values(&[30]),
            true,
            true,
        );
        assert_eq!(
            query,
            "insert /* ghost `test`.`sample` */ ignore into `test`.`_sample_gho` (`id`, `full_name`) (select `id`, `name` from `test`.`sample` force index (`PRIMARY`) where (((`id` > ?) or (`id` = ?)) and ((`id` < ?) or (`id` = ?))) lock in share mode)"
        );
        assert_eq!(args, int_values(&[1, 1, 30, 30]));
    }

    #[test]
    fn test_range_insert_query_subsequent_iteration() {
        let unique_key = UniqueKey::new("PRIMARY", ColumnList::from_names(&["id"]));
        let shared = ColumnList::from_names(&["id", "name"]);
        let (query, _) = build_range_insert_query(
            "test",
            "sample",
            "_sample_gho",
            None,
            Some("`name` is not null"),
            &shared,
            &shared,
            &unique_key,
            &int_values(&[30]),
            &int_values(&[60]),
            false,
            true,
        );
        assert!(!query.contains(" ignore "));
        assert!(query.contains("where ((`id` > ?) and ((`id` < ?) or (`id` = ?)) and (`name` is not null))"));
        assert!(query.ends_with(" lock in share mode)"));
    }

    #[test]
    fn test_range_insert_query_non_transactional() {
        let unique_key = UniqueKey::new("PRIMARY", ColumnList::from_names(&["id"]));
        let shared = ColumnList::from_names(&["id"]);
        let (query, _) = build_range_insert_query(
            "test",
            "sample",
            "_sample_gho",
            None,
            None,
            &shared,
            &shared,
            &unique_key,
            &int_values(&[30]),
            &int_values(&[60]),
            false,
            false,
        );
        assert!(query.contains(" ignore into "));
        assert!(!query.contains("lock in share mode"));
    }

    #[test]
    fn test_dml_delete_query() {
        let table_columns = ColumnList::from_names(&["id", "ts0", "name"]);
        let key_columns = ColumnList::from_names(&["id", "ts0"]);
        let row = ColumnValues::new(int_values(&[5, 99, 42]));
        let (query, args) =
            build_dml_delete_query("test", "_sample_gho", &table_columns, &key_columns, &row)
                .unwrap();
        assert_eq!(
            query,
            "delete /* ghost */ from `test`.`_sample_gho` where ((`id` = ?) and (`ts0` = ?))"
        );
        assert_eq!(args, int_values(&[5, 99]));
    }

    #[test]
    fn test_dml_insert_query() {
        let table_columns = ColumnList::from_names(&["id", "ts0", "name"]);
        let shared = ColumnList::from_names(&["id", "name"]);
        let mapped = ColumnList::from_names(&["id", "full_name"]);
        let row = ColumnValues::new(int_values(&[5, 99, 42]));
        let (query, args) =
            build_dml_insert_query("test", "_sample_gho", &table_columns, &shared, &mapped, &row)
                .unwrap();
        assert_eq!(
            query,
            "replace /* ghost */ into `test`.`_sample_gho` (`id`, `full_name`) values (?, ?)"
        );
        assert_eq!(args, int_values(&[5, 42]));
    }

    #[test]
    fn test_dml_update_query() {
        let table_columns = ColumnList::from_names(&["id", "ts0", "name"]);
        let shared = ColumnList::from_names(&["id", "name"]);
        let key_columns = ColumnList::from_names(&["id"]);
        let new_row = ColumnValues::new(int_values(&[5, 99, 43]));
        let where_row = ColumnValues::new(int_values(&[5, 99, 42]));
        let (query, args) = build_dml_update_query(
            "test",
            "_sample_gho",
            &table_columns,
            &shared,
            &shared,
            &key_columns,
            &new_row,
            &where_row,
        )
        .unwrap();
        assert_eq!(
            query,
            "update /* ghost */ `test`.`_sample_gho` set `id`=?, `name`=? where (`id` = ?)"
        );
        assert_eq!(args, int_values(&[5, 43, 5]));
    }

    #[test]
    fn test_dml_query_missing_ordinal() {
        let table_columns = ColumnList::from_names(&["id"]);
        let key_columns = ColumnList::from_names(&["uuid"]);
        let row = ColumnValues::new(int_values(&[5]));
        let err = build_dml_delete_query("test", "_sample_gho", &table_columns, &key_columns, &row)
            .unwrap_err();
        assert!(matches!(
            err,
            TranslatorError::MissingColumnOrdinal { column } if column == "uuid"
        ));
    }
}
