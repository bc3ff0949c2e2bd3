// mariadbtool/src/backup/retention.rs
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::WalkDir;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Run directories are named `<YYYY-MM-DD_HH_MM_SS>_<host>_<scope>`; nothing else is touched.
const RUN_DIR_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}_\d{2}_\d{2}_\d{2}_";

/// Removes run directories under `output_dir` whose modification time is at least
/// `retention_days` before `now`. Best effort: problems are logged, never returned.
pub fn cleanup_expired(output_dir: &Path, retention_days: u32, now: SystemTime) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    if retention_days == 0 || !output_dir.is_dir() {
        return removed;
    }
    let Ok(run_dir) = Regex::new(RUN_DIR_PATTERN) else {
        return removed;
    };
    let window = Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);

    for entry in WalkDir::new(output_dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Retention scan of {} hit an error: {}", output_dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !run_dir.is_match(&name) {
            continue;
        }

        let modified = match entry.metadata().map(|m| m.modified()) {
            Ok(Ok(modified)) => modified,
            Ok(Err(e)) => {
                warn!("Cannot read mtime of {}: {}", entry.path().display(), e);
                continue;
            }
            Err(e) => {
                warn!("Cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        // A timestamp in the future means "not expired".
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age < window {
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                info!(
                    path = %entry.path().display(),
                    age_days = age.as_secs() / SECONDS_PER_DAY,
                    "Removed expired backup"
                );
                removed.push(entry.path().to_path_buf());
            }
            Err(e) => warn!("Failed to remove expired backup {}: {}", entry.path().display(), e),
        }
    }

    removed.sort();
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};

    fn days(n: u64) -> Duration {
        Duration::from_secs(n * SECONDS_PER_DAY)
    }

    fn make_run_dir(root: &Path, name: &str, modified: SystemTime) -> anyhow::Result<PathBuf> {
        let dir = root.join(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("appdb.sql.gz"), b"x")?;
        File::open(&dir)?.set_modified(modified)?;
        Ok(dir)
    }

    #[test]
    fn test_removes_exactly_the_stale_runs() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let now = SystemTime::now();
        let stale: Vec<PathBuf> = (1..=3)
            .map(|i| make_run_dir(root.path(), &format!("2026-10-0{}_02_00_00_db1_all", i), now - days(10)))
            .collect::<anyhow::Result<_>>()?;
        let fresh = make_run_dir(root.path(), "2026-10-16_02_00_00_db1_all", now - days(2))?;
        let foreign = make_run_dir(root.path(), "keep-me", now - days(30))?;

        let removed = cleanup_expired(root.path(), 7, now);

        assert_eq!(removed, stale);
        assert!(stale.iter().all(|dir| !dir.exists()));
        assert!(fresh.exists());
        assert!(foreign.exists());
        Ok(())
    }

    #[test]
    fn test_boundary_age_is_removed() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let modified = SystemTime::now() - days(1);
        let dir = make_run_dir(root.path(), "2026-10-17_02_00_00_db1_appdb", modified)?;

        assert!(cleanup_expired(root.path(), 7, modified + days(7) - Duration::from_secs(1)).is_empty());
        assert!(dir.exists());
        assert_eq!(cleanup_expired(root.path(), 7, modified + days(7)), vec![dir.clone()]);
        assert!(!dir.exists());
        Ok(())
    }

    #[test]
    fn test_zero_days_and_missing_dir_are_noops() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = make_run_dir(root.path(), "2020-01-01_00_00_00_db1_all", SystemTime::now() - days(365))?;
        assert!(cleanup_expired(root.path(), 0, SystemTime::now()).is_empty());
        assert!(dir.exists());
        assert!(cleanup_expired(&root.path().join("absent"), 7, SystemTime::now()).is_empty());
        Ok(())
    }
}
