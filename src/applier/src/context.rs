// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::types::{ColumnList, ColumnValues, UniqueKey};
use crate::ApplierError;

/// Reserved changelog row ids; wire contract with the supervisor. All other
/// hints are auto-assigned ids starting at 256.
pub const CHANGELOG_HEARTBEAT_ID: u64 = 1;
pub const CHANGELOG_STATE_ID: u64 = 2;
pub const CHANGELOG_THROTTLE_ID: u64 = 3;

/// MySQL bounds table identifiers at 64 characters.
pub const MAX_TABLE_NAME_LENGTH: usize = 64;

const MIN_CHUNK_SIZE: u64 = 10;
const MAX_CHUNK_SIZE: u64 = 100_000;

/// Why the migration is currently throttled. Set by the supervisor; the
/// applier only consults it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleReasonHint {
    #[default]
    None,
    /// The operator explicitly commanded the pause.
    UserCommand,
    /// Waking up from hibernation.
    LeavingHibernation,
}

#[derive(Debug, Default)]
struct ThrottleState {
    throttled: bool,
    reason: String,
    hint: ThrottleReasonHint,
}

/// The immutable configuration of one migration, shaped by the planner and
/// operator flags before the applier starts.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub database_name: String,
    pub original_table_name: String,
    pub alter_statement: String,
    /// The iteration key: unique, all columns NOT NULL.
    pub unique_key: UniqueKey,
    /// All columns of the original table, in ordinal order; row images from
    /// the binlog are indexed by these ordinals.
    pub original_table_columns: ColumnList,
    /// Columns present in both tables, named as they are on the original.
    pub shared_columns: ColumnList,
    /// The shared columns named as they are on the ghost (renames applied).
    pub mapped_shared_columns: ColumnList,
    /// Extra predicate restricting which original rows are copied.
    pub row_copy_filter: Option<String>,
    pub table_engine: String,
    pub transactional_table: bool,
    pub chunk_size: u64,
    pub heartbeat_interval: Duration,
    pub max_retries: u64,
    pub cut_over_lock_timeout_seconds: u64,
    pub count_table_rows: bool,
    pub initially_drop_ghost_table: bool,
    pub initially_drop_old_table: bool,
    pub timestamp_old_table: bool,
    pub throttle_query: Option<String>,
}

impl MigrationConfig {
    pub fn new(
        database_name: impl Into<String>,
        original_table_name: impl Into<String>,
        alter_statement: impl Into<String>,
        unique_key: UniqueKey,
        original_table_columns: ColumnList,
        shared_columns: ColumnList,
        mapped_shared_columns: ColumnList,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            original_table_name: original_table_name.into(),
            alter_statement: alter_statement.into(),
            unique_key,
            original_table_columns,
            shared_columns,
            mapped_shared_columns,
            row_copy_filter: None,
            table_engine: "innodb".to_string(),
            transactional_table: true,
            chunk_size: 1000,
            heartbeat_interval: Duration::from_millis(100),
            max_retries: 60,
            cut_over_lock_timeout_seconds: 3,
            count_table_rows: false,
            initially_drop_ghost_table: false,
            initially_drop_old_table: false,
            timestamp_old_table: false,
            throttle_query: None,
        }
    }
}

/// The process-wide migration state shared by every applier task: read-only
/// configuration, atomically accessed counters and flags, and the row-copy
/// cursor. Pass it around as `Arc<MigrationContext>`.
#[derive(Debug)]
pub struct MigrationContext {
    config: MigrationConfig,
    started_at: DateTime<Utc>,

    chunk_size: AtomicU64,
    iteration: AtomicU64,
    total_dml_events_applied: AtomicU64,
    rows_delta_estimate: AtomicI64,
    hibernate_until: AtomicI64,
    cleanup_imminent: AtomicBool,
    finished_migrating: AtomicBool,

    applier_time_zone: Mutex<String>,
    applier_version: Mutex<String>,
    original_table_columns_on_applier: Mutex<Option<ColumnList>>,
    migration_range_min: Mutex<Option<ColumnValues>>,
    migration_range_max: Mutex<Option<ColumnValues>>,
    iteration_range_min: Mutex<Option<ColumnValues>>,
    iteration_range_max: Mutex<Option<ColumnValues>>,
    lock_tables_start_time: Mutex<Option<Instant>>,
    throttle: Mutex<ThrottleState>,
}

impl MigrationContext {
    pub fn new(config: MigrationConfig) -> Self {
        let chunk_size = config.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        Self {
            config,
            started_at: Utc::now(),
            chunk_size: AtomicU64::new(chunk_size),
            iteration: AtomicU64::new(0),
            total_dml_events_applied: AtomicU64::new(0),
            rows_delta_estimate: AtomicI64::new(0),
            hibernate_until: AtomicI64::new(0),
            cleanup_imminent: AtomicBool::new(false),
            finished_migrating: AtomicBool::new(false),
            applier_time_zone: Mutex::new("+00:00".to_string()),
            applier_version: Mutex::new(String::new()),
            original_table_columns_on_applier: Mutex::new(None),
            migration_range_min: Mutex::new(None),
            migration_range_max: Mutex::new(None),
            iteration_range_min: Mutex::new(None),
            iteration_range_max: Mutex::new(None),
            lock_tables_start_time: Mutex::new(None),
            throttle: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn database_name(&self) -> &str {
        &self.config.database_name
    }

    pub fn original_table_name(&self) -> &str {
        &self.config.original_table_name
    }

    pub fn ghost_table_name(&self) -> String {
        format!("_{}_gho", self.config.original_table_name)
    }

    pub fn old_table_name(&self) -> String {
        if self.config.timestamp_old_table {
            format!(
                "_{}_{}_del",
                self.config.original_table_name,
                self.started_at.format("%Y%m%d%H%M%S")
            )
        } else {
            format!("_{}_del", self.config.original_table_name)
        }
    }

    pub fn changelog_table_name(&self) -> String {
        format!("_{}_ghc", self.config.original_table_name)
    }

    /// Every table name the migration touches must fit MySQL's identifier
    /// bound; exceeding it must abort before any DDL.
    pub fn validate_table_names(&self) -> Result<(), ApplierError> {
        let names = [
            self.config.original_table_name.clone(),
            self.ghost_table_name(),
            self.old_table_name(),
            self.changelog_table_name(),
        ];
        for name in names {
            if name.len() > MAX_TABLE_NAME_LENGTH {
                return Err(ApplierError::FatalConfig(format!(
                    "table name {} is too long ({} characters; only {} allowed)",
                    name,
                    name.len(),
                    MAX_TABLE_NAME_LENGTH
                )));
            }
        }
        Ok(())
    }

    /// The fixed id for a reserved changelog hint, or 0 for auto-assignment.
    pub fn changelog_hint_id(&self, hint: &str) -> u64 {
        match hint {
            "heartbeat" => CHANGELOG_HEARTBEAT_ID,
            "state" => CHANGELOG_STATE_ID,
            "throttle" => CHANGELOG_THROTTLE_ID,
            _ => 0,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::SeqCst)
    }

    pub fn set_chunk_size(&self, chunk_size: u64) {
        self.chunk_size
            .store(chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE), Ordering::SeqCst);
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub fn increment_iteration(&self) {
        self.iteration.fetch_add(1, Ordering::SeqCst);
    }

    pub fn total_dml_events_applied(&self) -> u64 {
        self.total_dml_events_applied.load(Ordering::SeqCst)
    }

    pub fn add_dml_events_applied(&self, count: u64) {
        self.total_dml_events_applied
            .fetch_add(count, Ordering::SeqCst);
    }

    pub fn rows_delta_estimate(&self) -> i64 {
        self.rows_delta_estimate.load(Ordering::SeqCst)
    }

    pub fn add_rows_delta(&self, delta: i64) {
        self.rows_delta_estimate.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn hibernate_until(&self) -> i64 {
        self.hibernate_until.load(Ordering::SeqCst)
    }

    pub fn set_hibernate_until(&self, until_unix_nanos: i64) {
        self.hibernate_until
            .store(until_unix_nanos, Ordering::SeqCst);
    }

    pub fn cleanup_imminent(&self) -> bool {
        self.cleanup_imminent.load(Ordering::SeqCst)
    }

    pub fn set_cleanup_imminent(&self, imminent: bool) {
        self.cleanup_imminent.store(imminent, Ordering::SeqCst);
    }

    pub fn finished_migrating(&self) -> bool {
        self.finished_migrating.load(Ordering::SeqCst)
    }

    pub fn set_finished_migrating(&self) {
        self.finished_migrating.store(true, Ordering::SeqCst);
    }

    pub fn applier_time_zone(&self) -> String {
        self.applier_time_zone.lock().expect("lock poisoned").clone()
    }

    pub fn set_applier_time_zone(&self, time_zone: String) {
        *self.applier_time_zone.lock().expect("lock poisoned") = time_zone;
    }

    pub fn applier_version(&self) -> String {
        self.applier_version.lock().expect("lock poisoned").clone()
    }

    pub fn set_applier_version(&self, version: String) {
        *self.applier_version.lock().expect("lock poisoned") = version;
    }

    pub fn original_table_columns_on_applier(&self) -> Option<ColumnList> {
        self.original_table_columns_on_applier
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    pub fn set_original_table_columns_on_applier(&self, columns: ColumnList) {
        *self
            .original_table_columns_on_applier
            .lock()
            .expect("lock poisoned") = Some(columns);
    }

    pub fn set_migration_range(&self, min: ColumnValues, max: ColumnValues) {
        *self.migration_range_min.lock().expect("lock poisoned") = Some(min);
        *self.migration_range_max.lock().expect("lock poisoned") = Some(max);
    }

    pub fn migration_range_min(&self) -> Option<ColumnValues> {
        self.migration_range_min.lock().expect("lock poisoned").clone()
    }

    pub fn migration_range_max(&self) -> Option<ColumnValues> {
        self.migration_range_max.lock().expect("lock poisoned").clone()
    }

    /// Start the next iteration: the new range start is the previous range
    /// end, or the absolute migration minimum on the first iteration.
    /// Returns the new start, or `None` when no migration range was ever
    /// read (an empty table).
    pub fn advance_iteration_range_start(&self) -> Option<ColumnValues> {
        let previous_max = self
            .iteration_range_max
            .lock()
            .expect("lock poisoned")
            .clone();
        let next_min = previous_max.or_else(|| self.migration_range_min());
        *self.iteration_range_min.lock().expect("lock poisoned") = next_min.clone();
        next_min
    }

    pub fn iteration_range_min(&self) -> Option<ColumnValues> {
        self.iteration_range_min.lock().expect("lock poisoned").clone()
    }

    pub fn iteration_range_max(&self) -> Option<ColumnValues> {
        self.iteration_range_max.lock().expect("lock poisoned").clone()
    }

    pub fn set_iteration_range_max(&self, max: ColumnValues) {
        *self.iteration_range_max.lock().expect("lock poisoned") = Some(max);
    }

    pub fn lock_tables_start_time(&self) -> Option<Instant> {
        *self.lock_tables_start_time.lock().expect("lock poisoned")
    }

    pub fn set_lock_tables_start_time(&self, start: Instant) {
        *self.lock_tables_start_time.lock().expect("lock poisoned") = Some(start);
    }

    /// Record the supervisor's throttle decision.
    pub fn set_throttle(&self, throttled: bool, reason: String, hint: ThrottleReasonHint) {
        let mut state = self.throttle.lock().expect("lock poisoned");
        state.throttled = throttled;
        state.reason = reason;
        state.hint = hint;
    }

    /// Consult the current throttle decision.
    pub fn throttle_decision(&self) -> (bool, ThrottleReasonHint) {
        let state = self.throttle.lock().expect("lock poisoned");
        (state.throttled, state.hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::Value;

    fn test_config(original_table_name: &str) -> MigrationConfig {
        let columns = ColumnList::from_names(&["id", "name"]);
        MigrationConfig::new(
            "test",
            original_table_name,
            "add column extra int default 0",
            UniqueKey::new("PRIMARY", ColumnList::from_names(&["id"])),
            columns.clone(),
            columns.clone(),
            columns,
        )
    }

    #[test]
    fn test_derived_table_names() {
        let context = MigrationContext::new(test_config("sample"));
        assert_eq!(context.ghost_table_name(), "_sample_gho");
        assert_eq!(context.old_table_name(), "_sample_del");
        assert_eq!(context.changelog_table_name(), "_sample_ghc");
    }

    #[test]
    fn test_timestamped_old_table_name() {
        let mut config = test_config("sample");
        config.timestamp_old_table = true;
        let context = MigrationContext::new(config);
        let name = context.old_table_name();
        assert!(name.starts_with("_sample_"));
        assert!(name.ends_with("_del"));
        // _sample_ + yyyymmddhhmmss + _del
        assert_eq!(name.len(), "_sample_".len() + 14 + "_del".len());
    }

    #[test]
    fn test_validate_table_names_rejects_long_names() {
        let context = MigrationContext::new(test_config(&"t".repeat(60)));
        let err = context.validate_table_names().unwrap_err();
        assert!(matches!(err, ApplierError::FatalConfig(_)));

        let context = MigrationContext::new(test_config("short"));
        assert!(context.validate_table_names().is_ok());
    }

    #[test]
    fn test_reserved_changelog_ids() {
        let context = MigrationContext::new(test_config("sample"));
        assert_eq!(context.changelog_hint_id("heartbeat"), 1);
        assert_eq!(context.changelog_hint_id("state"), 2);
        assert_eq!(context.changelog_hint_id("throttle"), 3);
        assert_eq!(context.changelog_hint_id("state at 12345"), 0);
    }

    #[test]
    fn test_chunk_size_is_clamped() {
        let context = MigrationContext::new(test_config("sample"));
        context.set_chunk_size(1);
        assert_eq!(context.chunk_size(), 10);
        context.set_chunk_size(1_000_000);
        assert_eq!(context.chunk_size(), 100_000);
        context.set_chunk_size(500);
        assert_eq!(context.chunk_size(), 500);
    }

    #[test]
    fn test_iteration_range_advancement() {
        let context = MigrationContext::new(test_config("sample"));

        // No migration range read: the table is empty, nothing to iterate.
        assert_eq!(context.advance_iteration_range_start(), None);

        let min = ColumnValues::new(vec![Value::Int(1)]);
        let max = ColumnValues::new(vec![Value::Int(100)]);
        context.set_migration_range(min.clone(), max);

        // First iteration starts at the absolute minimum.
        assert_eq!(context.advance_iteration_range_start(), Some(min));

        // Subsequent iterations start at the previous iteration's end.
        let chunk_end = ColumnValues::new(vec![Value::Int(42)]);
        context.set_iteration_range_max(chunk_end.clone());
        assert_eq!(context.advance_iteration_range_start(), Some(chunk_end));
    }

    #[test]
    fn test_throttle_decision_roundtrip() {
        let context = MigrationContext::new(test_config("sample"));
        assert_eq!(context.throttle_decision(), (false, ThrottleReasonHint::None));
        context.set_throttle(true, "commanded by operator".to_string(), ThrottleReasonHint::UserCommand);
        assert_eq!(
            context.throttle_decision(),
            (true, ThrottleReasonHint::UserCommand)
        );
    }
}
