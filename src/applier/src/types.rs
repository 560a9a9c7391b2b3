// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

use mysql_async::{Row, Value};
use serde::{Deserialize, Serialize};

/// An ordered list of column names with ordinal lookup.
///
/// Ordinals index into the full row image of the original table, in the
/// order reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnList {
    names: Vec<String>,
    ordinals: BTreeMap<String, usize>,
}

impl ColumnList {
    pub fn new(names: Vec<String>) -> Self {
        let ordinals = names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| (name.clone(), ordinal))
            .collect();
        Self { names, ordinals }
    }

    pub fn from_names(names: &[&str]) -> Self {
        Self::new(names.iter().map(|name| name.to_string()).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The position of `name` in the table's full row image.
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.ordinals.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A unique key on the original table whose columns are all NOT NULL; the
/// iteration key of the row copy. The key's column tuple never changes
/// during a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub name: String,
    pub columns: ColumnList,
}

impl UniqueKey {
    pub fn new(name: impl Into<String>, columns: ColumnList) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// An ordered tuple of driver-opaque values: a key tuple or a full row
/// image, round-trippable through the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnValues {
    values: Vec<Value>,
}

impl ColumnValues {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn from_row(row: Row) -> Self {
        Self {
            values: row.unwrap(),
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, ordinal: usize) -> Option<&Value> {
        self.values.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for ColumnValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", value.as_sql(false))?;
        }
        Ok(())
    }
}

/// The kind of row-level DML captured from the binlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

/// A row-level binlog event on the original table, handed to the applier by
/// the external binlog streamer. Row-based replication with full row images
/// is assumed.
#[derive(Debug, Clone)]
pub struct BinlogDmlEvent {
    pub database_name: String,
    pub table_name: String,
    pub kind: DmlKind,
    /// Full pre-image of the row, for UPDATE and DELETE.
    pub where_values: Option<ColumnValues>,
    /// Post-image of the row, for INSERT and UPDATE.
    pub new_values: Option<ColumnValues>,
}

/// A single partition of the original table; when present, range queries are
/// scoped to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_name: String,
    pub row_count: u64,
}
