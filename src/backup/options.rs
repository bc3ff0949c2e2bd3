// mariadbtool/src/backup/options.rs
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{BackupError, Result};
use crate::utils::databases::is_valid_database_name;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// String wrapper that keeps passwords out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<Secret>,
}

impl ConnectionParams {
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Zlib,
    Deflate,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Deflate => "deflate",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gz",
            CompressionAlgorithm::Zlib => "zz",
            CompressionAlgorithm::Deflate => "deflate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Some(CompressionAlgorithm::Gzip),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "deflate" => Some(CompressionAlgorithm::Deflate),
            _ => None,
        }
    }
}

/// Which databases a single invocation covers. Exactly one is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupScope {
    Single(String),
    /// One artifact per listed database.
    List(Vec<String>),
    /// One artifact holding every database.
    AllDatabases {
        include_system: bool,
        exclude: Vec<String>,
    },
    UserGrants,
}

impl BackupScope {
    /// Value stored in the sidecar's `scope` field.
    pub fn describe(&self) -> String {
        match self {
            BackupScope::Single(name) => name.clone(),
            BackupScope::List(names) => names.join(","),
            BackupScope::AllDatabases { .. } => "all".to_string(),
            BackupScope::UserGrants => "user_grants".to_string(),
        }
    }
}

/// Raw scope flags as they arrive from the command line or config.
#[derive(Debug, Clone, Default)]
pub struct ScopeSelectors {
    pub all: bool,
    pub database: Option<String>,
    pub database_file: Option<PathBuf>,
    pub user_grants_only: bool,
    pub include_system: bool,
    pub exclude: Vec<String>,
    /// `database_list` from config.json; used only when no flag picks a scope.
    pub configured_list: Option<Vec<String>>,
}

impl ScopeSelectors {
    pub fn into_scope(self) -> Result<BackupScope> {
        let active = [
            self.all,
            self.database.is_some(),
            self.database_file.is_some(),
            self.user_grants_only,
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if active > 1 {
            return Err(BackupError::InvalidOptions(
                "only one of --all, --database, --database-file or --user-grants may be given"
                    .to_string(),
            ));
        }

        if self.all {
            return Ok(BackupScope::AllDatabases {
                include_system: self.include_system,
                exclude: self.exclude,
            });
        }
        if let Some(name) = self.database {
            return Ok(BackupScope::Single(name.trim().to_string()));
        }
        if let Some(path) = self.database_file {
            return Ok(BackupScope::List(read_database_list_file(&path)?));
        }
        if self.user_grants_only {
            return Ok(BackupScope::UserGrants);
        }
        match self.configured_list {
            Some(list) if !list.is_empty() => Ok(BackupScope::List(list)),
            _ => Err(BackupError::InvalidOptions(
                "no backup scope selected (use --all, --database, --database-file or --user-grants)"
                    .to_string(),
            )),
        }
    }
}

/// Reads one database name per line; blank lines and `#` comments are skipped.
pub fn read_database_list_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read database list file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub connection: ConnectionParams,
    pub scope: BackupScope,
    pub no_data: bool,
    pub include_user_grants: bool,
    pub output_dir: PathBuf,
    pub compress: bool,
    pub compression_algorithm: CompressionAlgorithm,
    pub compression_level: Option<u32>,
    pub encrypt: bool,
    pub encryption_passphrase: Option<Secret>,
    pub verify_disk_space: bool,
    pub retention_days: u32,
    pub calculate_checksum: bool,
    pub capture_gtid: bool,
    pub extra_args: Vec<String>,
    pub connect_timeout: Duration,
}

impl BackupOptions {
    pub fn new(connection: ConnectionParams, scope: BackupScope, output_dir: PathBuf) -> Self {
        BackupOptions {
            connection,
            scope,
            no_data: false,
            include_user_grants: false,
            output_dir,
            compress: false,
            compression_algorithm: CompressionAlgorithm::Gzip,
            compression_level: None,
            encrypt: false,
            encryption_passphrase: None,
            verify_disk_space: false,
            retention_days: 0,
            calculate_checksum: false,
            capture_gtid: false,
            extra_args: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Algorithm and clamped level, or `None` when compression is off.
    /// The configured level is ignored entirely when compression is disabled.
    pub fn effective_compression(&self) -> Option<(CompressionAlgorithm, u32)> {
        if !self.compress {
            return None;
        }
        let level = self
            .compression_level
            .unwrap_or(DEFAULT_COMPRESSION_LEVEL)
            .min(9);
        Some((self.compression_algorithm, level))
    }

    pub fn compression_name(&self) -> &'static str {
        self.effective_compression()
            .map(|(algorithm, _)| algorithm.name())
            .unwrap_or("none")
    }

    /// The same options narrowed to one database, used by the batch runner.
    pub fn for_database(&self, name: &str) -> BackupOptions {
        let mut single = self.clone();
        single.scope = BackupScope::Single(name.to_string());
        single
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BackupError::InvalidOptions(msg));

        if self.connection.host.trim().is_empty() {
            return invalid("host must not be empty".to_string());
        }
        if self.connection.port == 0 {
            return invalid("port must be non-zero".to_string());
        }
        if self.connection.user.trim().is_empty() {
            return invalid("user must not be empty".to_string());
        }
        if self.output_dir.as_os_str().is_empty() {
            return invalid("output directory must not be empty".to_string());
        }

        match &self.scope {
            BackupScope::Single(name) => check_name(name)?,
            BackupScope::List(names) => {
                if names.is_empty() {
                    return invalid("database list is empty".to_string());
                }
                for name in names {
                    check_name(name)?;
                }
            }
            BackupScope::AllDatabases { exclude, .. } => {
                for name in exclude {
                    check_name(name)?;
                }
            }
            BackupScope::UserGrants => {
                if self.no_data {
                    return invalid("--no-data cannot be combined with --user-grants".to_string());
                }
            }
        }

        if self.encrypt
            && self
                .encryption_passphrase
                .as_ref()
                .map_or(true, Secret::is_empty)
        {
            return invalid(
                "encryption is enabled but no encryption passphrase was supplied".to_string(),
            );
        }

        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_database_name(name) {
        Ok(())
    } else {
        Err(BackupError::InvalidOptions(format!(
            "invalid database name: {:?}",
            name
        )))
    }
}

#[cfg(test)]
pub(crate) fn test_options(scope: BackupScope, output_dir: &Path) -> BackupOptions {
    BackupOptions::new(
        ConnectionParams {
            host: "db1.internal".to_string(),
            port: 3306,
            user: "backup".to_string(),
            password: Some(Secret::new("s3cret")),
        },
        scope,
        output_dir.to_path_buf(),
    )
}
