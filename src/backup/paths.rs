// mariadbtool/src/backup/paths.rs
use chrono::{DateTime, Local};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::backup::options::BackupOptions;
use crate::errors::{BackupError, Result};

pub const RUN_DIR_FORMAT: &str = "%Y-%m-%d_%H_%M_%S";
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub run_dir: PathBuf,
    pub output_file: PathBuf,
    pub metadata_file: PathBuf,
}

/// `sql[.gz|.zz|.deflate][.enc]`, outermost layer last.
pub fn artifact_extension(options: &BackupOptions) -> String {
    let mut extension = String::from("sql");
    if let Some((algorithm, _)) = options.effective_compression() {
        extension.push('.');
        extension.push_str(algorithm.extension());
    }
    if options.encrypt {
        extension.push_str(".enc");
    }
    extension
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

/// Creates a fresh run directory and returns where the artifact and sidecar go.
/// The directory is created exclusively; a same-second collision gets a numeric suffix.
pub fn resolve(
    output_dir: &Path,
    host: &str,
    scope_label: &str,
    timestamp: DateTime<Local>,
    extension: &str,
) -> Result<ArtifactPaths> {
    let not_writable = |source: std::io::Error| BackupError::OutputNotWritable {
        path: output_dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(output_dir).map_err(not_writable)?;

    let host = sanitize(host);
    let scope = sanitize(scope_label);
    let base = format!("{}_{}_{}", timestamp.format(RUN_DIR_FORMAT), host, scope);

    let mut run_dir = output_dir.join(&base);
    let mut attempt = 1;
    loop {
        match fs::create_dir(&run_dir) {
            Ok(()) => break,
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < 100 => {
                attempt += 1;
                run_dir = output_dir.join(format!("{}_{}", base, attempt));
            }
            Err(e) => return Err(not_writable(e)),
        }
    }

    // Probe the directory before any dump process is spawned.
    let probe = run_dir.join(".write-test");
    fs::write(&probe, b"").map_err(|source| BackupError::OutputNotWritable {
        path: run_dir.clone(),
        source,
    })?;
    let _ = fs::remove_file(&probe);

    let stem = format!("{}_{}", scope, timestamp.format(FILE_STAMP_FORMAT));
    Ok(ArtifactPaths {
        output_file: run_dir.join(format!("{}.{}", stem, extension)),
        metadata_file: run_dir.join(format!("{}.meta.json", stem)),
        run_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::options::{test_options, BackupScope, Secret};
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 18, 2, 30, 5).unwrap()
    }

    #[test]
    fn test_deterministic_layout() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let paths = resolve(root.path(), "db1.internal", "appdb", fixed_time(), "sql.gz")?;
        assert_eq!(
            paths.run_dir,
            root.path().join("2026-10-18_02_30_05_db1.internal_appdb")
        );
        assert_eq!(paths.output_file, paths.run_dir.join("appdb_20261018_023005.sql.gz"));
        assert_eq!(paths.metadata_file, paths.run_dir.join("appdb_20261018_023005.meta.json"));
        assert!(paths.run_dir.is_dir());
        assert!(!paths.run_dir.join(".write-test").exists());
        Ok(())
    }

    #[test]
    fn test_same_second_collision_gets_suffix() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let first = resolve(root.path(), "db1", "appdb", fixed_time(), "sql")?;
        let second = resolve(root.path(), "db1", "appdb", fixed_time(), "sql")?;
        assert_ne!(first.run_dir, second.run_dir);
        assert!(second.run_dir.to_string_lossy().ends_with("_appdb_2"));
        Ok(())
    }

    #[test]
    fn test_unsafe_characters_are_replaced() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let paths = resolve(root.path(), "10.0.0.5:3307", "a/b", fixed_time(), "sql")?;
        let name = paths.run_dir.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "2026-10-18_02_30_05_10.0.0.5_3307_a_b");
        Ok(())
    }

    #[test]
    fn test_uncreatable_directory_is_precondition_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, b"file")?;
        let err = resolve(&blocker.join("nested"), "db1", "appdb", fixed_time(), "sql").unwrap_err();
        assert!(matches!(err, BackupError::OutputNotWritable { .. }));
        assert!(err.is_precondition());
        Ok(())
    }

    #[test]
    fn test_extension_follows_layers() {
        let mut options = test_options(BackupScope::Single("appdb".into()), Path::new("/tmp"));
        assert_eq!(artifact_extension(&options), "sql");
        options.compression_level = Some(3);
        assert_eq!(artifact_extension(&options), "sql");
        options.compress = true;
        assert_eq!(artifact_extension(&options), "sql.gz");
        options.encrypt = true;
        options.encryption_passphrase = Some(Secret::new("pw"));
        assert_eq!(artifact_extension(&options), "sql.gz.enc");
    }
}
