// mariadbtool/src/backup/replication.rs
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils::server::ServerSession;

/// Server replication state captured once, just before the dump starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub has_binlog: bool,
    pub binlog_file: Option<String>,
    pub binlog_pos: Option<u64>,
    pub has_gtid: bool,
    pub gtid_position: Option<String>,
}

/// Queries binlog status and, when binary logging is on, the GTID position.
/// Failures only degrade the snapshot; they never fail the backup.
pub async fn collect(server: &dyn ServerSession) -> ReplicationSnapshot {
    let mut snapshot = ReplicationSnapshot::default();

    let coordinates = match server.binlog_status().await {
        Ok(Some(coordinates)) => coordinates,
        Ok(None) => {
            info!("Binary logging is disabled; no replication position recorded");
            return snapshot;
        }
        Err(e) => {
            warn!("Could not collect replication info: {:#}", e);
            return snapshot;
        }
    };

    snapshot.has_binlog = true;
    snapshot.binlog_file = Some(coordinates.file);
    snapshot.binlog_pos = Some(coordinates.position);

    match server.gtid_position().await {
        Ok(Some(gtid)) => {
            snapshot.has_gtid = true;
            snapshot.gtid_position = Some(gtid);
        }
        Ok(None) => {}
        Err(e) => warn!("Could not read GTID position: {:#}", e),
    }

    info!(
        binlog_file = ?snapshot.binlog_file,
        binlog_pos = ?snapshot.binlog_pos,
        gtid = ?snapshot.gtid_position,
        "Replication info collected"
    );
    snapshot
}

/// Position the dump tool itself wrote into its output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpMarker {
    pub binlog_file: Option<String>,
    pub binlog_pos: Option<u64>,
    pub gtid_position: Option<String>,
    /// True when the CHANGE MASTER / CHANGE REPLICATION SOURCE statement was emitted as a
    /// `--` comment.
    pub commented: bool,
}

/// The marker sits right after the dump header, so only the head of the stream is kept.
pub const MARKER_SCAN_LIMIT: usize = 256 * 1024;

#[derive(Debug, Default)]
pub struct MarkerScanner {
    head: Vec<u8>,
}

impl MarkerScanner {
    pub fn observe(&mut self, chunk: &[u8]) {
        let room = MARKER_SCAN_LIMIT.saturating_sub(self.head.len());
        if room > 0 {
            self.head.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    pub fn finish(self) -> Option<DumpMarker> {
        let text = String::from_utf8_lossy(&self.head);
        let change_master = Regex::new(
            r"(?m)^(--\s*)?CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='([^']+)',\s*(?:MASTER|SOURCE)_LOG_POS=(\d+)",
        )
        .ok()?;
        // MariaDB: `gtid_slave_pos='0-1-42'`. MySQL: `GTID_PURGED=/*!80000 '+'*/ 'uuid:1-5'`,
        // where a long set is wrapped over several lines.
        let gtid = Regex::new(
            r"(?:gtid_slave_pos\s*=\s*|GTID_PURGED\s*=\s*(?:/\*!\d+\s*'\+'\s*\*/\s*)?)'([^']*)'",
        )
        .ok()?;

        let mut marker = DumpMarker::default();
        if let Some(caps) = change_master.captures(&text) {
            marker.commented = caps.get(1).is_some();
            marker.binlog_file = caps.get(2).map(|m| m.as_str().to_string());
            marker.binlog_pos = caps.get(3).and_then(|m| m.as_str().parse().ok());
        }
        if let Some(caps) = gtid.captures(&text) {
            marker.gtid_position = caps
                .get(1)
                .map(|m| m.as_str().chars().filter(|c| !c.is_whitespace()).collect::<String>())
                .filter(|g| !g.is_empty());
        }

        if marker.binlog_file.is_none() && marker.gtid_position.is_none() {
            None
        } else {
            Some(marker)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    ServerQuery,
    DumpMarker,
}

/// Replication block of the sidecar metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub has_binlog: bool,
    pub has_gtid: bool,
    pub gtid_position: Option<String>,
    pub binlog_file: Option<String>,
    pub binlog_pos: Option<u64>,
    pub position_source: PositionSource,
}

impl ReplicationSnapshot {
    /// Prefers the dump's own marker, which was written inside the dump's consistent
    /// snapshot; the pre-dump query is only correlated with it. A marker is only
    /// trusted when the dump was asked to write one; otherwise matching text is table data.
    pub fn reconcile(
        &self,
        marker: Option<&DumpMarker>,
        marker_requested: bool,
    ) -> ReplicationRecord {
        let mut record = ReplicationRecord {
            has_binlog: self.has_binlog,
            has_gtid: self.has_gtid,
            gtid_position: self.gtid_position.clone(),
            binlog_file: self.binlog_file.clone(),
            binlog_pos: self.binlog_pos,
            position_source: PositionSource::ServerQuery,
        };

        let Some(marker) = marker.filter(|_| marker_requested) else {
            return record;
        };
        if marker.binlog_file.is_some() {
            record.has_binlog = true;
            record.binlog_file = marker.binlog_file.clone();
            record.binlog_pos = marker.binlog_pos;
            record.position_source = PositionSource::DumpMarker;
        }
        if marker.gtid_position.is_some() {
            record.has_gtid = true;
            record.gtid_position = marker.gtid_position.clone();
            record.position_source = PositionSource::DumpMarker;
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::FakeServer;

    #[tokio::test]
    async fn test_collect_with_gtid() {
        let snapshot = collect(&FakeServer::with_gtid()).await;
        assert!(snapshot.has_binlog);
        assert!(snapshot.has_gtid);
        assert_eq!(snapshot.binlog_file.as_deref(), Some("mysql-bin.000042"));
        assert_eq!(snapshot.binlog_pos, Some(1337));
        assert_eq!(snapshot.gtid_position.as_deref(), Some("0-1-4242"));
    }

    #[tokio::test]
    async fn test_collect_binlog_disabled() {
        let server = FakeServer {
            gtid: Some("0-1-1".to_string()),
            ..Default::default()
        };
        // GTID is only consulted once binary logging is known to be on.
        assert_eq!(collect(&server).await, ReplicationSnapshot::default());
    }

    #[tokio::test]
    async fn test_collect_failure_is_non_fatal() {
        let server = FakeServer {
            binlog_fails: true,
            ..FakeServer::with_gtid()
        };
        assert_eq!(collect(&server).await, ReplicationSnapshot::default());
    }

    #[test]
    fn test_scanner_reads_commented_marker() {
        let mut scanner = MarkerScanner::default();
        scanner.observe(b"-- MariaDB dump 10.19\n--\n-- Position to start replication\n--\n\n-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.0000");
        scanner.observe(b"43', MASTER_LOG_POS=2048;\n\n-- SET GLOBAL gtid_slave_pos='0-1-4250';\n");
        let marker = scanner.finish().expect("marker");
        assert!(marker.commented);
        assert_eq!(marker.binlog_file.as_deref(), Some("mysql-bin.000043"));
        assert_eq!(marker.binlog_pos, Some(2048));
        assert_eq!(marker.gtid_position.as_deref(), Some("0-1-4250"));
    }

    #[test]
    fn test_scanner_executable_marker_and_limit() {
        let mut scanner = MarkerScanner::default();
        scanner.observe(b"CHANGE MASTER TO MASTER_LOG_FILE='bin.000001', MASTER_LOG_POS=4;\n");
        let marker = scanner.finish().expect("marker");
        assert!(!marker.commented);

        let mut scanner = MarkerScanner::default();
        scanner.observe(&vec![b'x'; MARKER_SCAN_LIMIT]);
        scanner.observe(b"\nCHANGE MASTER TO MASTER_LOG_FILE='late.000001', MASTER_LOG_POS=4;\n");
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_reconcile_prefers_dump_marker() {
        let snapshot = ReplicationSnapshot {
            has_binlog: true,
            binlog_file: Some("mysql-bin.000042".into()),
            binlog_pos: Some(1337),
            has_gtid: true,
            gtid_position: Some("0-1-4242".into()),
        };
        let record = snapshot.reconcile(None, true);
        assert_eq!(record.position_source, PositionSource::ServerQuery);
        assert_eq!(record.binlog_pos, Some(1337));

        let marker = DumpMarker {
            binlog_file: Some("mysql-bin.000043".into()),
            binlog_pos: Some(2048),
            gtid_position: Some("0-1-4250".into()),
            commented: true,
        };
        let record = snapshot.reconcile(Some(&marker), true);
        assert_eq!(record.position_source, PositionSource::DumpMarker);
        assert_eq!(record.binlog_file.as_deref(), Some("mysql-bin.000043"));
        assert_eq!(record.gtid_position.as_deref(), Some("0-1-4250"));
    }

    #[test]
    fn test_unrequested_marker_is_ignored() {
        let marker = DumpMarker {
            binlog_file: Some("fake.000001".into()),
            binlog_pos: Some(4),
            gtid_position: Some("0-9-9".into()),
            commented: false,
        };
        let record = ReplicationSnapshot::default().reconcile(Some(&marker), false);
        assert!(!record.has_binlog);
        assert!(!record.has_gtid);
        assert_eq!(record.binlog_file, None);
        assert_eq!(record.position_source, PositionSource::ServerQuery);
    }

    #[test]
    fn test_scanner_reads_mysql_gtid_purged() {
        let mut scanner = MarkerScanner::default();
        scanner.observe(b"-- CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='binlog.000002', SOURCE_LOG_POS=157;\n");
        scanner.observe(b"/* SET @@GLOBAL.GTID_PURGED=/*!80000 '+'*/ 'aaaa:1-5,\nbbbb:1-3'; */\n");
        let marker = scanner.finish().expect("marker");
        assert!(marker.commented);
        assert_eq!(marker.binlog_file.as_deref(), Some("binlog.000002"));
        assert_eq!(marker.binlog_pos, Some(157));
        assert_eq!(marker.gtid_position.as_deref(), Some("aaaa:1-5,bbbb:1-3"));
    }
}
