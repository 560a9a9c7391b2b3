// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row};
use serde::{Deserialize, Serialize};

use crate::MySqlError;

/// Query a MySQL System Variable
pub async fn query_sys_var(conn: &mut Conn, name: &str) -> Result<String, MySqlError> {
    let value: String = conn
        .query_first(format!("SELECT @@{}", name))
        .await?
        .unwrap();
    Ok(value)
}

/// Verify a MySQL System Variable matches the expected value
async fn verify_sys_setting(
    conn: &mut Conn,
    setting: &str,
    expected: &str,
) -> Result<(), MySqlError> {
    match query_sys_var(conn, setting).await?.as_str() {
        actual if actual == expected => Ok(()),
        actual => Err(MySqlError::InvalidSystemSetting {
            setting: setting.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
    }
}

/// The applier replays intercepted row events, so the server it reads from
/// must log full row images.
pub async fn ensure_full_row_binlog_format(conn: &mut Conn) -> Result<(), MySqlError> {
    verify_sys_setting(conn, "log_bin", "1").await?;
    verify_sys_setting(conn, "binlog_format", "ROW").await?;
    verify_sys_setting(conn, "binlog_row_image", "FULL").await?;
    Ok(())
}

/// A binlog file/position pair on the applier server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: u64,
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Read a replica's replication coordinates: where the IO thread has read to
/// and where the SQL thread has executed to. Errors if the server is not a
/// replica.
pub async fn replication_binlog_coordinates(
    conn: &mut Conn,
) -> Result<(BinlogCoordinates, BinlogCoordinates), MySqlError> {
    let row: Row = conn
        .query_first("show slave status")
        .await?
        .ok_or_else(|| anyhow::anyhow!("no replication status; the server is not a replica"))?;

    let coordinate = |file_column: &str, pos_column: &str| -> Result<BinlogCoordinates, MySqlError> {
        let log_file = row.get(file_column).ok_or_else(|| {
            anyhow::anyhow!("missing {} in replication status", file_column)
        })?;
        let log_pos = row.get(pos_column).ok_or_else(|| {
            anyhow::anyhow!("missing {} in replication status", pos_column)
        })?;
        Ok(BinlogCoordinates { log_file, log_pos })
    };

    let read = coordinate("Master_Log_File", "Read_Master_Log_Pos")?;
    let exec = coordinate("Relay_Master_Log_File", "Exec_Master_Log_Pos")?;
    Ok((read, exec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_coordinates_display() {
        let coordinates = BinlogCoordinates {
            log_file: "mysql-bin.000003".to_string(),
            log_pos: 4711,
        };
        assert_eq!(coordinates.to_string(), "mysql-bin.000003:4711");
    }
}
