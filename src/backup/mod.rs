pub mod compression;
pub mod db_dump;
pub mod encryption;
pub mod logic;
pub mod metadata;
pub mod options;
pub mod paths;
pub mod reader;
pub mod replication;
pub mod retention;
pub mod session_guard;
pub mod verification;
pub mod writer_chain;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backup::db_dump::{build_dump_args, DumpTargets};
use crate::backup::logic::{BackupEngine, BatchReport};
use crate::backup::options::{BackupOptions, BackupScope};
use crate::backup::replication::ReplicationSnapshot;
use crate::backup::session_guard::SessionLeases;
use crate::utils::server::MariaDbServer;
use crate::utils::DumpFlavor;

/// Public entry point for the backup process: connects lazily to the configured server
/// and runs every target the options describe.
pub async fn run_backup_flow(
    options: &BackupOptions,
    dump_program: &Path,
    flavor: DumpFlavor,
    force: bool,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    let server = Arc::new(MariaDbServer::connect_lazy(
        &options.connection,
        options.connect_timeout,
    ));
    let engine = BackupEngine::new(server, SessionLeases::new(), dump_program.to_path_buf(), cancel)
        .with_flavor(flavor);
    Ok(engine.execute(options, force).await)
}

/// Layer names a run with these options would build, innermost first.
pub fn planned_layers(options: &BackupOptions) -> Vec<&'static str> {
    let mut layers = vec!["file"];
    if options.encrypt {
        layers.push(encryption::LAYER_NAME);
    }
    if let Some((algorithm, _)) = options.effective_compression() {
        layers.push(algorithm.name());
    }
    layers
}

/// Prints what a run would do without connecting or spawning anything.
pub fn print_plan(options: &BackupOptions, dump_program: &Path, flavor: DumpFlavor) {
    println!("📋 Backup plan (dry run)");
    println!("  Server:     {}@{}", options.connection.user, options.connection.identity());
    println!("  Output dir: {}", options.output_dir.display());
    println!("  Layers:     {}", planned_layers(options).join(" → "));
    println!("  Dump tool:  {} ({})", dump_program.display(), flavor);
    if options.retention_days > 0 {
        println!("  Retention:  {} days", options.retention_days);
    }

    // Replication flags depend on live server state and are left out of the preview.
    let none = ReplicationSnapshot::default();
    let targets: Vec<(String, DumpTargets)> = match &options.scope {
        BackupScope::Single(name) => vec![(name.clone(), DumpTargets::Database(name.clone()))],
        BackupScope::List(names) => names
            .iter()
            .map(|name| (name.clone(), DumpTargets::Database(name.clone())))
            .collect(),
        BackupScope::AllDatabases {
            include_system,
            exclude,
        } => {
            let label = if *include_system && exclude.is_empty() {
                "all databases".to_string()
            } else {
                "all databases (enumerated at run time)".to_string()
            };
            vec![(label, DumpTargets::AllDatabases)]
        }
        BackupScope::UserGrants => vec![("user grants".to_string(), DumpTargets::UserGrants)],
    };
    for (label, target) in targets {
        let args = build_dump_args(options, &target, &none, flavor);
        println!("  • {}: {} {}", label, dump_program.display(), args.join(" "));
    }
}

pub fn print_summary(report: &BatchReport) {
    println!();
    println!("Backup summary");
    println!("  Planned:   {}", report.planned.len());
    println!("  Succeeded: {}", report.succeeded().count());
    println!("  Skipped:   {}", report.skipped.len());
    println!("  Failed:    {}", report.failed().count());
    for result in report.succeeded() {
        if let Some(file) = &result.output_file {
            println!("  ✅ {} → {} ({} bytes)", result.scope, file.display(), result.size_bytes);
        }
    }
    for result in report.failed() {
        let reason = result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        println!("  ❌ {}: {}", result.scope, reason);
        if let Some(file) = &result.output_file {
            println!("     partial output left at {}", file.display());
        }
    }
    for name in &report.skipped {
        println!("  ⏭  {} (skipped)", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::options::{test_options, CompressionAlgorithm, Secret};

    #[test]
    fn test_planned_layers_match_chain_order() {
        let mut options = test_options(BackupScope::Single("appdb".into()), Path::new("/tmp"));
        assert_eq!(planned_layers(&options), vec!["file"]);
        options.compress = true;
        options.compression_algorithm = CompressionAlgorithm::Deflate;
        options.encrypt = true;
        options.encryption_passphrase = Some(Secret::new("pw"));
        assert_eq!(planned_layers(&options), vec!["file", "aes-256-gcm", "deflate"]);
    }
}
