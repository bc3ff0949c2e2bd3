// mariadbtool/src/utils/server.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::debug;

use crate::backup::options::ConnectionParams;
use crate::utils::databases::SYSTEM_DATABASES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogCoordinates {
    pub file: String,
    pub position: u64,
}

/// Live server state the backup engine reads and mutates.
#[async_trait]
pub trait ServerSession: Send + Sync {
    /// `host:port`, used to key session leases.
    fn identity(&self) -> String;

    async fn ping(&self) -> Result<()>;

    async fn max_statement_time(&self) -> Result<f64>;

    async fn set_max_statement_time(&self, seconds: f64) -> Result<()>;

    /// `None` when binary logging is disabled.
    async fn binlog_status(&self) -> Result<Option<BinlogCoordinates>>;

    /// `None` when the server reports no GTID state.
    async fn gtid_position(&self) -> Result<Option<String>>;

    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Approximate on-disk size of the given schemas; all user schemas when empty.
    async fn estimate_size(&self, databases: &[String]) -> Result<u64>;
}

pub struct MariaDbServer {
    identity: String,
    pool: MySqlPool,
}

impl MariaDbServer {
    /// Builds a lazy single-connection pool; nothing touches the network until the first query.
    pub fn connect_lazy(params: &ConnectionParams, acquire_timeout: Duration) -> Self {
        let mut options = MySqlConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user);
        if let Some(password) = &params.password {
            options = options.password(password.expose());
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(options);
        MariaDbServer {
            identity: params.identity(),
            pool,
        }
    }
}

#[async_trait]
impl ServerSession for MariaDbServer {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to reach server {}", self.identity))?;
        Ok(())
    }

    async fn max_statement_time(&self) -> Result<f64> {
        let value: f64 = sqlx::query_scalar("SELECT @@GLOBAL.max_statement_time")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read @@GLOBAL.max_statement_time")?;
        Ok(value)
    }

    async fn set_max_statement_time(&self, seconds: f64) -> Result<()> {
        sqlx::query(&format!("SET GLOBAL max_statement_time = {}", seconds))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to set max_statement_time to {}", seconds))?;
        Ok(())
    }

    async fn binlog_status(&self) -> Result<Option<BinlogCoordinates>> {
        // MariaDB 10.5.2+ renamed the statement; older servers only know the first form.
        let row = match sqlx::query("SHOW MASTER STATUS")
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                debug!("SHOW MASTER STATUS failed ({}), trying SHOW BINLOG STATUS", e);
                sqlx::query("SHOW BINLOG STATUS")
                    .fetch_optional(&self.pool)
                    .await
                    .context("Failed to query binary log status")?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };
        let file: String = row
            .try_get("File")
            .context("Binary log status row has no File column")?;
        let position: u64 = row
            .try_get("Position")
            .context("Binary log status row has no Position column")?;
        if file.is_empty() {
            return Ok(None);
        }
        Ok(Some(BinlogCoordinates { file, position }))
    }

    async fn gtid_position(&self) -> Result<Option<String>> {
        let mariadb: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT CAST(@@GLOBAL.gtid_binlog_pos AS CHAR)")
                .fetch_one(&self.pool)
                .await;
        let position = match mariadb {
            Ok(position) => position,
            Err(e) => {
                debug!("gtid_binlog_pos unavailable ({}), trying gtid_executed", e);
                sqlx::query_scalar("SELECT CAST(@@GLOBAL.gtid_executed AS CHAR)")
                    .fetch_one(&self.pool)
                    .await
                    .context("Failed to read GTID position")?
            }
        };
        Ok(position
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty()))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT CAST(schema_name AS CHAR) FROM information_schema.schemata ORDER BY schema_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list databases")?;
        Ok(names)
    }

    async fn estimate_size(&self, databases: &[String]) -> Result<u64> {
        let sql_base = "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS UNSIGNED) \
                        FROM information_schema.tables WHERE ";
        let size: u64 = if databases.is_empty() {
            let excluded = SYSTEM_DATABASES
                .iter()
                .map(|name| format!("'{}'", name))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query_scalar(&format!("{}table_schema NOT IN ({})", sql_base, excluded))
                .fetch_one(&self.pool)
                .await
                .context("Failed to estimate size of user databases")?
        } else {
            let placeholders = vec!["?"; databases.len()].join(", ");
            let sql = format!("{}table_schema IN ({})", sql_base, placeholders);
            let mut query = sqlx::query_scalar::<_, u64>(&sql);
            for name in databases {
                query = query.bind(name);
            }
            query
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to estimate size of {:?}", databases))?
        };
        Ok(size)
    }
}
