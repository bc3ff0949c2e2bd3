//! MariaDB/MySQL Backup Tool
//!
//! Provides a CLI for producing consistent, optionally compressed and encrypted logical
//! backups and for verifying them afterwards.

// mariadbtool/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use backup::options::{BackupOptions, CompressionAlgorithm, ScopeSelectors, Secret};
use config::{AppConfig, BackupConfig, ENCRYPTION_PASSWORD_ENV, load_backup_config_from_json};

/// MariaDB/MySQL backup tool
#[derive(Parser, Debug)]
#[command(name = "mariadbtool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.json
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Take a backup
    Backup(BackupArgs),

    /// Check an artifact against its metadata sidecar
    Verify {
        /// Path to the `.meta.json` sidecar
        metadata: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct BackupArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    user: Option<String>,
    /// Prefer MARIADBTOOL_PASSWORD; flags are visible in the process list.
    #[arg(long)]
    password: Option<String>,

    /// Back up every database into one artifact
    #[arg(long)]
    all: bool,
    /// Back up a single database
    #[arg(long)]
    database: Option<String>,
    /// File with one database name per line; one artifact each
    #[arg(long)]
    database_file: Option<PathBuf>,
    /// Back up only users and grants
    #[arg(long)]
    user_grants: bool,
    /// Schema only
    #[arg(long)]
    no_data: bool,
    /// With --all, also dump mysql, sys and the schema databases
    #[arg(long)]
    include_system: bool,
    /// With --all, databases to leave out
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
    /// Append users and grants to the dump
    #[arg(long)]
    include_user_grants: bool,

    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    compress: bool,
    #[arg(long, value_enum)]
    compression: Option<CompressionAlgorithm>,
    /// 0-9; higher values are clamped, ignored without compression
    #[arg(long)]
    compression_level: Option<u32>,
    /// Encrypt with the passphrase in MARIADBTOOL_ENCRYPTION_PASSWORD
    #[arg(long)]
    encrypt: bool,
    #[arg(long)]
    retention_days: Option<u32>,
    #[arg(long)]
    no_checksum: bool,
    /// Don't request a GTID comment marker
    #[arg(long)]
    no_gtid: bool,
    #[arg(long)]
    skip_disk_check: bool,
    #[arg(long)]
    dump_binary: Option<String>,
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Print the plan and exit
    #[arg(long)]
    dry_run: bool,
    /// Keep going after a failed target
    #[arg(long)]
    force: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mariadbtool=info")),
        )
        .init();

    match run_app().await {
        Ok(true) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("❌ Operation finished with failures.");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<bool> {
    let cli = Cli::parse();
    let app_config = AppConfig::load_from_json(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;

    let command = match cli.command {
        Some(command) => command,
        None => match prompt_choice()?.as_str() {
            "1" | "backup" => Commands::Backup(BackupArgs::default()),
            "2" | "verify" => Commands::Verify {
                metadata: PathBuf::from(prompt_line("Path to metadata file: ")?),
            },
            _ => {
                println!("❌ Invalid choice. Please enter '1' (backup) or '2' (verify).");
                anyhow::bail!("Invalid operation choice");
            }
        },
    };

    match command {
        Commands::Backup(args) => {
            let backup_config = load_backup_config_from_json(&app_config.raw_json_config, |key| env::var(key).ok())
                .context("Failed to load backup configuration")?;
            run_backup(args, &backup_config).await
        }
        Commands::Verify { metadata } => run_verify(&metadata),
    }
}

fn build_options(args: &BackupArgs, backup_config: &BackupConfig) -> Result<BackupOptions> {
    let selectors = ScopeSelectors {
        all: args.all,
        database: args.database.clone(),
        database_file: args.database_file.clone(),
        user_grants_only: args.user_grants,
        include_system: args.include_system,
        exclude: if args.exclude.is_empty() {
            backup_config.exclude_databases.clone()
        } else {
            args.exclude.clone()
        },
        configured_list: backup_config.databases_to_backup.clone(),
    };
    let mut options = backup_config.to_options(selectors.into_scope()?);

    if let Some(host) = &args.host {
        options.connection.host = host.clone();
    }
    if let Some(port) = args.port {
        options.connection.port = port;
    }
    if let Some(user) = &args.user {
        options.connection.user = user.clone();
    }
    if let Some(password) = &args.password {
        options.connection.password = Some(Secret::new(password.clone()));
    }
    if let Some(dir) = &args.output_dir {
        options.output_dir = dir.clone();
    }
    if args.compress || args.compression.is_some() {
        options.compress = true;
    }
    if let Some(algorithm) = args.compression {
        options.compression_algorithm = algorithm;
    }
    if args.compression_level.is_some() {
        options.compression_level = args.compression_level;
    }
    options.encrypt |= args.encrypt;
    if let Some(days) = args.retention_days {
        options.retention_days = days;
    }
    if args.no_checksum {
        options.calculate_checksum = false;
    }
    if args.no_gtid {
        options.capture_gtid = false;
    }
    if args.skip_disk_check {
        options.verify_disk_space = false;
    }
    if let Some(secs) = args.connect_timeout {
        options.connect_timeout = Duration::from_secs(secs);
    }
    options.no_data = args.no_data;
    options.include_user_grants = args.include_user_grants;

    options.validate()?;
    Ok(options)
}

async fn run_backup(args: BackupArgs, backup_config: &BackupConfig) -> Result<bool> {
    let options = build_options(&args, backup_config)?;
    let configured_binary = args.dump_binary.as_deref().or(backup_config.dump_binary.as_deref());
    let dump_program = match utils::find_dump_executable(configured_binary) {
        Ok(path) => path,
        // A dry run only previews the command line.
        Err(e) if args.dry_run => {
            warn!("{:#}", e);
            PathBuf::from(configured_binary.unwrap_or("mariadb-dump"))
        }
        Err(e) => return Err(e.into()),
    };
    let flavor = utils::detect_dump_flavor(&dump_program);
    backup::db_dump::ensure_supported(&options, flavor)?;

    backup::print_plan(&options, &dump_program, flavor);
    if args.dry_run {
        return Ok(true);
    }
    if !args.yes && !confirm("Proceed? [y/N]: ")? {
        println!("Aborted.");
        return Ok(false);
    }

    println!("🚀 Starting Backup Process...");
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling backup");
            interrupt.cancel();
        }
    });

    let report = backup::run_backup_flow(&options, &dump_program, flavor, args.force, cancel)
        .await
        .context("Backup process failed")?;
    backup::print_summary(&report);
    Ok(report.is_success())
}

fn run_verify(metadata: &std::path::Path) -> Result<bool> {
    let passphrase = env::var(ENCRYPTION_PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Secret::new);
    let report = backup::verification::verify_backup(metadata, passphrase.as_ref())?;

    println!("Artifact:  {}", report.artifact.display());
    println!("Scope:     {} ({}:{})", report.metadata.scope, report.metadata.host, report.metadata.port);
    println!("Size:      {}", if report.size_matches { "✅ matches" } else { "❌ differs" });
    match report.checksum_matches {
        Some(true) => println!("Checksum:  ✅ matches"),
        Some(false) => println!("Checksum:  ❌ differs"),
        None => println!("Checksum:  not recorded"),
    }
    println!("Decoded:   {} bytes", report.decoded_bytes);
    if !report.has_dump_header {
        println!("❌ Decoded content does not start with a dump header");
    }
    Ok(report.is_ok())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Verify Backup (or type 'verify')");
    prompt_line("Enter your choice: ")
}

fn prompt_line(prompt: &str) -> Result<String> {
    use std::io::{stdin, stdout, Write};

    print!("{}", prompt);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

fn confirm(prompt: &str) -> Result<bool> {
    let answer = prompt_line(prompt)?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}
