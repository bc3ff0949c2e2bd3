// mariadbtool/src/backup/verification.rs
use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backup::metadata::{read_sidecar, sha256_file, BackupMetadata};
use crate::backup::options::{CompressionAlgorithm, Secret};
use crate::backup::reader::open_artifact;

#[derive(Debug)]
pub struct VerifyReport {
    pub artifact: PathBuf,
    pub metadata: BackupMetadata,
    pub size_matches: bool,
    /// `None` when no checksum was recorded.
    pub checksum_matches: Option<bool>,
    pub decoded_bytes: u64,
    /// Decoded text starts with a dump header.
    pub has_dump_header: bool,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.size_matches && self.checksum_matches != Some(false) && self.has_dump_header
    }
}

/// Checks an artifact against its sidecar: size, recorded checksum, and that every layer
/// decodes cleanly down to SQL text.
pub fn verify_backup(metadata_path: &Path, passphrase: Option<&Secret>) -> Result<VerifyReport> {
    let metadata = read_sidecar(metadata_path)?;
    let artifact = metadata_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&metadata.file);

    let size = fs::metadata(&artifact)
        .with_context(|| format!("Artifact {} is missing", artifact.display()))?
        .len();
    let size_matches = size == metadata.size_bytes;

    let checksum_matches = match &metadata.checksum_sha256 {
        Some(expected) => Some(
            sha256_file(&artifact)
                .with_context(|| format!("Failed to checksum {}", artifact.display()))?
                == *expected,
        ),
        None => None,
    };

    let compression = match metadata.compression.as_str() {
        "none" => None,
        name => Some(
            CompressionAlgorithm::from_name(name)
                .with_context(|| format!("Unknown compression '{}' in metadata", name))?,
        ),
    };
    if metadata.encrypted && passphrase.is_none() {
        anyhow::bail!(
            "Artifact {} is encrypted; set the encryption password to verify it",
            artifact.display()
        );
    }

    let mut reader = open_artifact(&artifact, compression, passphrase.filter(|_| metadata.encrypted))?;
    let mut head = Vec::new();
    (&mut reader)
        .take(64)
        .read_to_end(&mut head)
        .with_context(|| format!("Failed to decode {}", artifact.display()))?;
    let rest = io::copy(&mut reader, &mut io::sink())
        .with_context(|| format!("Failed to decode {}", artifact.display()))?;
    let decoded_bytes = head.len() as u64 + rest;
    let has_dump_header = head.starts_with(b"-- ");

    info!(
        artifact = %artifact.display(),
        size_matches,
        checksum_matches = ?checksum_matches,
        decoded_bytes,
        "Backup verified"
    );
    Ok(VerifyReport {
        artifact,
        metadata,
        size_matches,
        checksum_matches,
        decoded_bytes,
        has_dump_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::metadata::{record, sample_metadata};
    use crate::backup::options::{test_options, BackupScope};
    use crate::backup::writer_chain::WriterChain;
    use std::fs::File;
    use std::io::Write;

    const DUMP: &[u8] = b"-- MariaDB dump 10.19\nCREATE TABLE t (id INT);\n";

    fn write_artifact(dir: &Path, encrypt: bool) -> anyhow::Result<PathBuf> {
        let mut options = test_options(BackupScope::Single("appdb".into()), dir);
        options.compress = true;
        if encrypt {
            options.encrypt = true;
            options.encryption_passphrase = Some(Secret::new("pw"));
        }
        let artifact = dir.join("appdb.sql.gz");
        let mut chain = WriterChain::for_options(File::create(&artifact)?, &options)?;
        chain.write_all(DUMP)?;
        chain.close()?;

        let mut metadata = sample_metadata("appdb.sql.gz");
        metadata.compression = "gzip".to_string();
        metadata.encrypted = encrypt;
        let sidecar = dir.join("appdb.meta.json");
        assert!(record(&artifact, &sidecar, true, metadata).written);
        Ok(sidecar)
    }

    #[test]
    fn test_intact_artifact_verifies() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sidecar = write_artifact(dir.path(), false)?;
        let report = verify_backup(&sidecar, None)?;
        assert!(report.is_ok());
        assert_eq!(report.checksum_matches, Some(true));
        assert_eq!(report.decoded_bytes, DUMP.len() as u64);
        Ok(())
    }

    #[test]
    fn test_tampered_artifact_fails_checksum() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sidecar = write_artifact(dir.path(), false)?;
        let artifact = dir.path().join("appdb.sql.gz");
        let mut bytes = fs::read(&artifact)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&artifact, bytes)?;

        // A corrupted gzip trailer may also fail decoding outright.
        if let Ok(report) = verify_backup(&sidecar, None) {
            assert!(!report.is_ok());
        }
        Ok(())
    }

    #[test]
    fn test_encrypted_artifact_needs_passphrase() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sidecar = write_artifact(dir.path(), true)?;
        assert!(verify_backup(&sidecar, None).is_err());
        assert!(verify_backup(&sidecar, Some(&Secret::new("wrong"))).is_err());
        assert!(verify_backup(&sidecar, Some(&Secret::new("pw")))?.is_ok());
        Ok(())
    }
}
