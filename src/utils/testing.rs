//! In-process stand-ins for the server and the dump executable.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::utils::server::{BinlogCoordinates, ServerSession};

pub struct FakeServer {
    pub identity: String,
    pub ping_fails: bool,
    /// `None` makes reads of the statement timeout fail.
    pub statement_time: Mutex<Option<f64>>,
    pub set_calls: Mutex<Vec<f64>>,
    pub binlog: Option<BinlogCoordinates>,
    pub binlog_fails: bool,
    pub gtid: Option<String>,
    pub databases: Vec<String>,
    pub size_estimate: u64,
}

impl Default for FakeServer {
    fn default() -> Self {
        FakeServer {
            identity: "db1.internal:3306".to_string(),
            ping_fails: false,
            statement_time: Mutex::new(Some(30.0)),
            set_calls: Mutex::new(Vec::new()),
            binlog: None,
            binlog_fails: false,
            gtid: None,
            databases: Vec::new(),
            size_estimate: 0,
        }
    }
}

impl FakeServer {
    pub fn with_gtid() -> Self {
        FakeServer {
            binlog: Some(BinlogCoordinates {
                file: "mysql-bin.000042".to_string(),
                position: 1337,
            }),
            gtid: Some("0-1-4242".to_string()),
            ..Default::default()
        }
    }

    pub fn current_statement_time(&self) -> Option<f64> {
        *self.statement_time.lock().unwrap()
    }

    pub fn recorded_sets(&self) -> Vec<f64> {
        self.set_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerSession for FakeServer {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn ping(&self) -> Result<()> {
        if self.ping_fails {
            Err(anyhow!("connection refused"))
        } else {
            Ok(())
        }
    }

    async fn max_statement_time(&self) -> Result<f64> {
        self.current_statement_time()
            .ok_or_else(|| anyhow!("Unknown system variable 'max_statement_time'"))
    }

    async fn set_max_statement_time(&self, seconds: f64) -> Result<()> {
        let mut current = self.statement_time.lock().unwrap();
        if current.is_none() {
            return Err(anyhow!("Unknown system variable 'max_statement_time'"));
        }
        *current = Some(seconds);
        self.set_calls.lock().unwrap().push(seconds);
        Ok(())
    }

    async fn binlog_status(&self) -> Result<Option<BinlogCoordinates>> {
        if self.binlog_fails {
            return Err(anyhow!("Access denied; you need the BINLOG MONITOR privilege"));
        }
        Ok(self.binlog.clone())
    }

    async fn gtid_position(&self) -> Result<Option<String>> {
        Ok(self.gtid.clone())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.databases.clone())
    }

    async fn estimate_size(&self, _databases: &[String]) -> Result<u64> {
        Ok(self.size_estimate)
    }
}

/// Writes an executable `/bin/sh` script standing in for `mariadb-dump`.
pub fn write_fake_dump(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join("fake-mariadb-dump");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    let mut permissions = std::fs::metadata(&path)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions)?;
    Ok(path)
}

/// A dump script that echoes its argv and a marker block the way mariadb-dump (or MySQL's
/// mysqldump, for `--source-data`) does.
pub const ECHO_DUMP_SCRIPT: &str = r#"echo "-- MariaDB dump 10.19  Distrib 10.11.6-MariaDB"
echo "-- args: $*"
echo "-- pwd-set: ${MYSQL_PWD:+yes}"
case "$*" in
  *--master-data=2*)
    echo "-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000043', MASTER_LOG_POS=2048;"
    echo "-- SET GLOBAL gtid_slave_pos='0-1-4250';"
    ;;
  *--master-data=1*)
    echo "CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000043', MASTER_LOG_POS=2048;"
    ;;
  *--source-data=2*)
    echo "-- CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='binlog.000043', SOURCE_LOG_POS=2048;"
    echo "/* SET @@GLOBAL.GTID_PURGED=/*!80000 '+'*/ '3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5,"
    echo "8f0c2e4a-71ca-11e1-9e33-c80aa9429562:1-9'; */"
    ;;
  *--source-data=1*)
    echo "CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='binlog.000043', SOURCE_LOG_POS=2048;"
    ;;
esac
echo "CREATE TABLE t (id INT PRIMARY KEY);"
echo "INSERT INTO t VALUES (1),(2),(3);"
echo "-- Dump completed""#;
