// mariadbtool/src/backup/metadata.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::replication::ReplicationRecord;

pub const TOOL_VERSION: &str = concat!("mariadbtool ", env!("CARGO_PKG_VERSION"));

/// Sidecar written next to every finalized artifact. Never holds the password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: Uuid,
    pub tool_version: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub scope: String,
    pub databases: Vec<String>,
    pub no_data: bool,
    pub file: String,
    pub replication: ReplicationRecord,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
    pub compression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u32>,
    pub encrypted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes the sidecar via a temp file and rename. Refuses to replace an existing one.
pub fn write_sidecar(path: &Path, metadata: &BackupMetadata) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Metadata file {} already exists", path.display());
    }
    let json = serde_json::to_vec_pretty(metadata).context("Failed to serialize backup metadata")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e)
            .with_context(|| format!("Failed to move metadata into place at {}", path.display()));
    }
    Ok(())
}

pub fn read_sidecar(path: &Path) -> Result<BackupMetadata> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse metadata file {}", path.display()))
}

#[derive(Debug)]
pub struct Recorded {
    pub metadata: BackupMetadata,
    pub written: bool,
}

/// Measures the finalized artifact, optionally checksums it, and writes the sidecar.
/// Every failure here is logged and swallowed: the artifact is already complete.
pub fn record(
    artifact: &Path,
    sidecar: &Path,
    calculate_checksum: bool,
    mut metadata: BackupMetadata,
) -> Recorded {
    match fs::metadata(artifact) {
        Ok(stat) => metadata.size_bytes = stat.len(),
        Err(e) => warn!("Cannot stat artifact {}: {}", artifact.display(), e),
    }

    if calculate_checksum {
        match sha256_file(artifact) {
            Ok(digest) => metadata.checksum_sha256 = Some(digest),
            Err(e) => warn!("Checksum of {} failed: {}", artifact.display(), e),
        }
    }

    metadata.finished_at = Utc::now();
    metadata.success = true;

    let written = match write_sidecar(sidecar, &metadata) {
        Ok(()) => {
            info!(path = %sidecar.display(), "Backup metadata written");
            true
        }
        Err(e) => {
            warn!("Backup metadata not written: {:#}", e);
            false
        }
    };

    Recorded { metadata, written }
}

#[cfg(test)]
pub(crate) fn sample_metadata(file: &str) -> BackupMetadata {
    use crate::backup::replication::PositionSource;
    BackupMetadata {
        backup_id: Uuid::new_v4(),
        tool_version: TOOL_VERSION.to_string(),
        host: "db1.internal".to_string(),
        port: 3306,
        user: "backup".to_string(),
        scope: "appdb".to_string(),
        databases: vec!["appdb".to_string()],
        no_data: false,
        file: file.to_string(),
        replication: ReplicationRecord {
            has_binlog: false,
            has_gtid: false,
            gtid_position: None,
            binlog_file: None,
            binlog_pos: None,
            position_source: PositionSource::ServerQuery,
        },
        size_bytes: 0,
        checksum_sha256: None,
        compression: "none".to_string(),
        compression_level: None,
        encrypted: false,
        started_at: Utc::now(),
        finished_at: Utc::now(),
        success: false,
    }
}
