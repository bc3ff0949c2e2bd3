// mariadbtool/src/backup/logic.rs
//! Backup orchestration: one invocation walks
//! `Idle → ValidatingOptions → ConnectionVerified → SessionGuardAcquired → ReplicationCollected
//! → RetentionCleaned → PathsResolved → Dumping → Finalized → MetadataWritten → Done`,
//! dropping into `Failed` from any step after validation starts.

use chrono::{Local, Utc};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::db_dump::{build_dump_args, ensure_supported, marker_requested, run_dump, DumpTargets};
use crate::backup::metadata::{self, BackupMetadata, TOOL_VERSION};
use crate::backup::options::{BackupOptions, BackupScope};
use crate::backup::paths::{self, ArtifactPaths};
use crate::backup::replication::{self, ReplicationRecord};
use crate::backup::retention;
use crate::backup::session_guard::{SessionGuard, SessionLeases};
use crate::backup::writer_chain::WriterChain;
use crate::errors::{BackupError, Result};
use crate::utils::databases::is_system_database;
use crate::utils::disk;
use crate::utils::server::ServerSession;
use crate::utils::setting::check_db_connection;
use crate::utils::DumpFlavor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    ValidatingOptions,
    ConnectionVerified,
    SessionGuardAcquired,
    ReplicationCollected,
    RetentionCleaned,
    PathsResolved,
    Dumping,
    Finalized,
    MetadataWritten,
    Done,
    Failed,
}

/// What is on disk when a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    NotProduced,
    /// A partial or unsealed file was left for inspection.
    Unfinalized,
    Finalized,
    FinalizedWithoutMetadata,
}

#[derive(Debug)]
pub struct BackupResult {
    pub success: bool,
    pub scope: String,
    pub output_file: Option<PathBuf>,
    pub metadata_file: Option<PathBuf>,
    pub size_bytes: u64,
    pub duration: Duration,
    pub compressed: bool,
    pub encrypted: bool,
    pub error: Option<BackupError>,
    pub artifact: ArtifactState,
    /// Last phase reached before `Done` or `Failed`.
    pub last_phase: BackupPhase,
    pub phase: BackupPhase,
    pub replication: Option<ReplicationRecord>,
}

impl BackupResult {
    fn new(scope: String) -> Self {
        BackupResult {
            success: false,
            scope,
            output_file: None,
            metadata_file: None,
            size_bytes: 0,
            duration: Duration::ZERO,
            compressed: false,
            encrypted: false,
            error: None,
            artifact: ArtifactState::NotProduced,
            last_phase: BackupPhase::Idle,
            phase: BackupPhase::Idle,
            replication: None,
        }
    }

    fn enter(&mut self, phase: BackupPhase) {
        debug!(scope = %self.scope, from = ?self.phase, to = ?phase, "Backup phase");
        self.phase = phase;
        self.last_phase = phase;
    }
}

#[derive(Debug)]
pub struct AllDatabasesBackupResult {
    pub result: BackupResult,
    /// Databases selected for the dump.
    pub total_databases: Vec<String>,
    /// Databases contained in a finalized artifact.
    pub processed_databases: Vec<String>,
    /// Databases left out as system or excluded.
    pub skipped_databases: Vec<String>,
    pub gtid_position: Option<String>,
}

/// Per-target outcome of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub planned: Vec<String>,
    pub results: Vec<BackupResult>,
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &BackupResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BackupResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(|r| r.success)
    }
}

/// Resolved dump targets plus the names that went into them.
struct TargetPlan {
    targets: DumpTargets,
    selected: Vec<String>,
    skipped: Vec<String>,
}

/// Opens the writer chain over a freshly created artifact file.
pub type ChainBuilder = fn(File, &BackupOptions) -> Result<WriterChain>;

pub struct BackupEngine {
    server: Arc<dyn ServerSession>,
    leases: Arc<SessionLeases>,
    dump_program: PathBuf,
    flavor: DumpFlavor,
    build_chain: ChainBuilder,
    cancel: CancellationToken,
}

impl BackupEngine {
    pub fn new(
        server: Arc<dyn ServerSession>,
        leases: Arc<SessionLeases>,
        dump_program: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        BackupEngine {
            server,
            leases,
            dump_program,
            flavor: DumpFlavor::default(),
            build_chain: WriterChain::for_options,
            cancel,
        }
    }

    pub fn with_flavor(mut self, flavor: DumpFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    #[cfg(test)]
    pub fn with_chain_builder(mut self, build_chain: ChainBuilder) -> Self {
        self.build_chain = build_chain;
        self
    }

    /// Single database, including the schema-only (`no_data`) variant.
    pub async fn backup_database(&self, options: &BackupOptions) -> BackupResult {
        if !matches!(options.scope, BackupScope::Single(_) | BackupScope::List(_)) {
            return rejected(options, "backup_database needs a database scope");
        }
        self.run(options).await.0
    }

    pub async fn backup_all_databases(&self, options: &BackupOptions) -> AllDatabasesBackupResult {
        if !matches!(options.scope, BackupScope::AllDatabases { .. }) {
            return AllDatabasesBackupResult {
                result: rejected(options, "backup_all_databases needs the all-databases scope"),
                total_databases: Vec::new(),
                processed_databases: Vec::new(),
                skipped_databases: Vec::new(),
                gtid_position: None,
            };
        }

        let (result, plan) = self.run(options).await;
        let (total, skipped) = plan
            .map(|plan| (plan.selected, plan.skipped))
            .unwrap_or_default();
        let processed = if matches!(
            result.artifact,
            ArtifactState::Finalized | ArtifactState::FinalizedWithoutMetadata
        ) {
            total.clone()
        } else {
            Vec::new()
        };
        let gtid_position = result
            .replication
            .as_ref()
            .and_then(|r| r.gtid_position.clone());

        info!(
            total = total.len(),
            processed = processed.len(),
            skipped = skipped.len(),
            "All-databases backup finished"
        );
        AllDatabasesBackupResult {
            result,
            total_databases: total,
            processed_databases: processed,
            skipped_databases: skipped,
            gtid_position,
        }
    }

    pub async fn backup_user_grants(&self, options: &BackupOptions) -> BackupResult {
        let mut grants = options.clone();
        grants.scope = BackupScope::UserGrants;
        self.run(&grants).await.0
    }

    /// Runs every target the options describe. A list scope produces one artifact per
    /// database; without `force` the first failure stops the batch and the rest count as skipped.
    pub async fn execute(&self, options: &BackupOptions, force: bool) -> BatchReport {
        let mut report = BatchReport::default();
        match &options.scope {
            BackupScope::List(names) => {
                report.planned = names.clone();
                for (index, name) in names.iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        warn!("Cancelled; skipping remaining databases");
                        report.skipped.extend(names[index..].iter().cloned());
                        break;
                    }
                    info!(database = %name, "🚀 Backing up database {}/{}", index + 1, names.len());
                    let result = self.backup_database(&options.for_database(name)).await;
                    let failed = !result.success;
                    report.results.push(result);
                    if failed && !force {
                        report.skipped.extend(names[index + 1..].iter().cloned());
                        break;
                    }
                }
            }
            BackupScope::Single(name) => {
                report.planned.push(name.clone());
                report.results.push(self.backup_database(options).await);
            }
            BackupScope::AllDatabases { .. } => {
                report.planned.push(options.scope.describe());
                report.results.push(self.backup_all_databases(options).await.result);
            }
            BackupScope::UserGrants => {
                report.planned.push(options.scope.describe());
                report.results.push(self.backup_user_grants(options).await);
            }
        }
        report
    }

    async fn run(&self, options: &BackupOptions) -> (BackupResult, Option<TargetPlan>) {
        let started = Instant::now();
        let mut result = BackupResult::new(options.scope.describe());
        let mut plan = None;

        let outcome = self.run_phases(options, &mut result, &mut plan).await;

        result.duration = started.elapsed();
        match outcome {
            Ok(()) => {
                result.success = true;
                result.enter(BackupPhase::Done);
                info!(
                    scope = %result.scope,
                    file = ?result.output_file,
                    size_bytes = result.size_bytes,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "✅ Backup completed"
                );
            }
            Err(e) => {
                error!(scope = %result.scope, phase = ?result.last_phase, "❌ Backup failed: {}", e);
                result.error = Some(e);
                result.phase = BackupPhase::Failed;
            }
        }
        (result, plan)
    }

    async fn run_phases(
        &self,
        options: &BackupOptions,
        result: &mut BackupResult,
        plan_out: &mut Option<TargetPlan>,
    ) -> Result<()> {
        result.enter(BackupPhase::ValidatingOptions);
        options.validate()?;
        ensure_supported(options, self.flavor)?;

        check_db_connection(self.server.as_ref(), options.connect_timeout).await?;
        let plan = self.plan_targets(options).await?;
        result.enter(BackupPhase::ConnectionVerified);

        let guard = SessionGuard::acquire(self.server.clone(), self.leases.clone()).await;
        result.enter(BackupPhase::SessionGuardAcquired);

        let outcome = self.run_guarded(options, &plan, result).await;
        guard.release().await;
        *plan_out = Some(plan);
        outcome
    }

    async fn run_guarded(
        &self,
        options: &BackupOptions,
        plan: &TargetPlan,
        result: &mut BackupResult,
    ) -> Result<()> {
        let started_at = Utc::now();

        let snapshot = replication::collect(self.server.as_ref()).await;
        result.enter(BackupPhase::ReplicationCollected);

        let removed = retention::cleanup_expired(&options.output_dir, options.retention_days, SystemTime::now());
        if !removed.is_empty() {
            info!(count = removed.len(), "Retention cleanup removed old backups");
        }
        result.enter(BackupPhase::RetentionCleaned);

        let paths = paths::resolve(
            &options.output_dir,
            &options.connection.host,
            &result.scope,
            Local::now(),
            &paths::artifact_extension(options),
        )?;
        if options.verify_disk_space {
            if let Err(e) = self.check_disk_space(&paths.run_dir, options, plan).await {
                let _ = fs::remove_dir(&paths.run_dir);
                return Err(e);
            }
        }
        result.enter(BackupPhase::PathsResolved);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.output_file)
            .map_err(|source| BackupError::OutputNotWritable {
                path: paths.output_file.clone(),
                source,
            })?;
        result.output_file = Some(paths.output_file.clone());
        result.artifact = ArtifactState::Unfinalized;

        let mut chain = (self.build_chain)(file, options)?;
        result.compressed = options.effective_compression().is_some();
        result.encrypted = options.encrypt;
        let args = build_dump_args(options, &plan.targets, &snapshot, self.flavor);
        let marker_expected = marker_requested(&plan.targets, &snapshot);

        result.enter(BackupPhase::Dumping);
        info!(
            scope = %result.scope,
            file = %paths.output_file.display(),
            layers = ?chain.layer_names(),
            "Dumping"
        );
        let dumped = run_dump(
            &self.dump_program,
            &args,
            options.connection.password.as_ref(),
            &mut chain,
            &self.cancel,
        )
        .await;
        let outcome = match dumped {
            Ok(outcome) => outcome,
            Err(e) => {
                // The unsealed chain is dropped as is; no trailer makes a partial dump look whole.
                drop(chain);
                return Err(e);
            }
        };

        chain.close()?;
        result.artifact = ArtifactState::Finalized;
        result.enter(BackupPhase::Finalized);

        let record = snapshot.reconcile(outcome.marker.as_ref(), marker_expected);
        if let (Some(marker), true) = (&outcome.marker, marker_expected) {
            if marker.binlog_file != snapshot.binlog_file || marker.binlog_pos != snapshot.binlog_pos {
                info!(
                    queried = ?snapshot.binlog_pos,
                    marker = ?marker.binlog_pos,
                    "Dump marker differs from the pre-dump position; recording the marker"
                );
            }
        }
        result.replication = Some(record.clone());

        let draft = self.draft_metadata(options, plan, &paths, record, started_at);
        let recorded = metadata::record(
            &paths.output_file,
            &paths.metadata_file,
            options.calculate_checksum,
            draft,
        );
        result.size_bytes = recorded.metadata.size_bytes;
        if recorded.written {
            result.metadata_file = Some(paths.metadata_file.clone());
            result.enter(BackupPhase::MetadataWritten);
        } else {
            result.artifact = ArtifactState::FinalizedWithoutMetadata;
        }
        Ok(())
    }

    async fn plan_targets(&self, options: &BackupOptions) -> Result<TargetPlan> {
        match &options.scope {
            BackupScope::Single(name) => Ok(TargetPlan {
                targets: DumpTargets::Database(name.clone()),
                selected: vec![name.clone()],
                skipped: Vec::new(),
            }),
            BackupScope::List(names) => Ok(TargetPlan {
                targets: DumpTargets::Databases(names.clone()),
                selected: names.clone(),
                skipped: Vec::new(),
            }),
            BackupScope::UserGrants => Ok(TargetPlan {
                targets: DumpTargets::UserGrants,
                selected: Vec::new(),
                skipped: Vec::new(),
            }),
            BackupScope::AllDatabases {
                include_system,
                exclude,
            } => {
                let names = self.server.list_databases().await.map_err(|e| {
                    BackupError::Connection(format!("failed to list databases: {:#}", e))
                })?;
                let (selected, skipped): (Vec<String>, Vec<String>) =
                    names.into_iter().partition(|name| {
                        (*include_system || !is_system_database(name)) && !exclude.contains(name)
                    });
                if selected.is_empty() {
                    return Err(BackupError::InvalidOptions(
                        "no databases left to back up after exclusions".to_string(),
                    ));
                }
                let targets = if *include_system && exclude.is_empty() {
                    DumpTargets::AllDatabases
                } else {
                    DumpTargets::Databases(selected.clone())
                };
                info!(
                    selected = selected.len(),
                    skipped = ?skipped,
                    "Databases enumerated for all-databases backup"
                );
                Ok(TargetPlan {
                    targets,
                    selected,
                    skipped,
                })
            }
        }
    }

    async fn check_disk_space(&self, dir: &Path, options: &BackupOptions, plan: &TargetPlan) -> Result<()> {
        if plan.targets == DumpTargets::UserGrants {
            return Ok(());
        }
        let estimate = match self.server.estimate_size(&plan.selected).await {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!("Could not estimate backup size, skipping disk check: {:#}", e);
                return Ok(());
            }
        };
        let required = if options.effective_compression().is_some() {
            estimate / 2
        } else {
            estimate
        };
        match disk::available_bytes(dir) {
            Ok(available) if available < required => Err(BackupError::InsufficientDiskSpace {
                path: dir.to_path_buf(),
                required,
                available,
            }),
            Ok(available) => {
                debug!(required, available, "Disk space check passed");
                Ok(())
            }
            Err(e) => {
                warn!("Disk space check failed, continuing: {:#}", e);
                Ok(())
            }
        }
    }

    fn draft_metadata(
        &self,
        options: &BackupOptions,
        plan: &TargetPlan,
        paths: &ArtifactPaths,
        replication: ReplicationRecord,
        started_at: chrono::DateTime<Utc>,
    ) -> BackupMetadata {
        let file = paths
            .output_file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        BackupMetadata {
            backup_id: Uuid::new_v4(),
            tool_version: TOOL_VERSION.to_string(),
            host: options.connection.host.clone(),
            port: options.connection.port,
            user: options.connection.user.clone(),
            scope: options.scope.describe(),
            databases: plan.selected.clone(),
            no_data: options.no_data,
            file,
            replication,
            size_bytes: 0,
            checksum_sha256: None,
            compression: options.compression_name().to_string(),
            compression_level: options.effective_compression().map(|(_, level)| level),
            encrypted: options.encrypt,
            started_at,
            finished_at: started_at,
            success: false,
        }
    }
}

fn rejected(options: &BackupOptions, reason: &str) -> BackupResult {
    let mut result = BackupResult::new(options.scope.describe());
    result.enter(BackupPhase::ValidatingOptions);
    result.error = Some(BackupError::InvalidOptions(reason.to_string()));
    result.phase = BackupPhase::Failed;
    result
}
