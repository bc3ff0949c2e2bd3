pub mod databases;
pub mod disk;
pub mod server;
pub mod setting;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use which::which;

use crate::errors::{BackupError, Result};

/// Resolves the dump executable: an explicit override first, then `mariadb-dump`,
/// then the legacy `mysqldump` name.
pub fn find_dump_executable(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(binary) = configured.filter(|b| !b.trim().is_empty()) {
        return which(binary).map_err(|e| {
            BackupError::DumpToolNotFound(format!(
                "configured dump_binary '{}' was not found or is not executable ({})",
                binary, e
            ))
        });
    }
    which("mariadb-dump").or_else(|_| which("mysqldump")).map_err(|_| {
        BackupError::DumpToolNotFound(
            "neither mariadb-dump nor mysqldump was found in PATH; install the MariaDB client tools"
                .to_string(),
        )
    })
}

/// Which dump tool family is installed. The two disagree on replication and grant flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpFlavor {
    #[default]
    MariaDb,
    MySql,
}

impl fmt::Display for DumpFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpFlavor::MariaDb => write!(f, "MariaDB"),
            DumpFlavor::MySql => write!(f, "MySQL"),
        }
    }
}

/// Asks the tool for `--version`. MariaDB builds say so in the banner, including their
/// `mysqldump` compatibility link. When the tool can't be run, the file name decides.
pub fn detect_dump_flavor(program: &Path) -> DumpFlavor {
    match Command::new(program).arg("--version").output() {
        Ok(output) if output.status.success() => {
            let banner = String::from_utf8_lossy(&output.stdout);
            debug!(banner = %banner.trim(), "Dump tool version");
            if banner.contains("MariaDB") {
                DumpFlavor::MariaDb
            } else {
                DumpFlavor::MySql
            }
        }
        Ok(output) => {
            warn!(status = %output.status, "Dump tool --version failed; guessing flavor from its name");
            flavor_from_name(program)
        }
        Err(e) => {
            warn!("Could not run {} --version: {}", program.display(), e);
            flavor_from_name(program)
        }
    }
}

fn flavor_from_name(program: &Path) -> DumpFlavor {
    match program.file_name().and_then(|name| name.to_str()) {
        Some("mysqldump") => DumpFlavor::MySql,
        _ => DumpFlavor::MariaDb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_configured_binary_must_exist() {
        let err = find_dump_executable(Some("definitely-not-a-dump-tool-xyz")).unwrap_err();
        assert!(matches!(err, BackupError::DumpToolNotFound(_)));
        assert!(err.is_precondition());
        assert!(err.to_string().contains("definitely-not-a-dump-tool-xyz"));
    }

    #[test]
    fn test_configured_absolute_path_is_used() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = testing::write_fake_dump(dir.path(), "exit 0")?;
        let found = find_dump_executable(Some(script.to_str().context("utf8 path")?))?;
        assert_eq!(found, script);
        Ok(())
    }

    #[test]
    fn test_flavor_from_version_banner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mariadb = testing::write_fake_dump(
            dir.path(),
            "echo 'mysqldump from 11.4.2-MariaDB, client 10.19 for Linux (x86_64)'",
        )?;
        assert_eq!(detect_dump_flavor(&mariadb), DumpFlavor::MariaDb);

        let mysql = testing::write_fake_dump(
            dir.path(),
            "echo 'mysqldump  Ver 8.0.36 for Linux on x86_64 (MySQL Community Server - GPL)'",
        )?;
        assert_eq!(detect_dump_flavor(&mysql), DumpFlavor::MySql);
        Ok(())
    }

    #[test]
    fn test_flavor_falls_back_to_file_name() {
        assert_eq!(detect_dump_flavor(Path::new("/nonexistent/mysqldump")), DumpFlavor::MySql);
        assert_eq!(
            detect_dump_flavor(Path::new("/nonexistent/mariadb-dump")),
            DumpFlavor::MariaDb
        );
    }
}
