// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL utility library for the online schema-change applier.

mod config;
pub use config::{Config, TimeoutConfig, DEFAULT_TCP_KEEPALIVE};

mod replication;
pub use replication::{
    ensure_full_row_binlog_format, query_sys_var, replication_binlog_coordinates,
    BinlogCoordinates,
};

#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error("invalid mysql system setting '{setting}'. Expected '{expected}'. Got '{actual}'.")]
    InvalidSystemSetting {
        setting: String,
        expected: String,
        actual: String,
    },
    #[error("invalid mysql client configuration: {0}")]
    InvalidClientConfig(String),
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// A mysql_async error.
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
}

// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html
pub const ER_NO_SUCH_TABLE: u16 = 1146;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_LOCK_DEADLOCK: u16 = 1213;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_system_setting_display() {
        let err = MySqlError::InvalidSystemSetting {
            setting: "binlog_format".to_string(),
            expected: "ROW".to_string(),
            actual: "STATEMENT".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid mysql system setting 'binlog_format'. Expected 'ROW'. Got 'STATEMENT'."
        );
    }
}
