// mariadbtool/src/backup/db_dump.rs
use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::options::{BackupOptions, BackupScope, Secret};
use crate::backup::replication::{DumpMarker, MarkerScanner, ReplicationSnapshot};
use crate::errors::{BackupError, Result};
use crate::utils::DumpFlavor;

const READ_CHUNK: usize = 64 * 1024;
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

/// What a single dump invocation covers, after scope resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpTargets {
    Database(String),
    /// Explicit name list, dumped with `--databases` into one stream.
    Databases(Vec<String>),
    AllDatabases,
    UserGrants,
}

/// Flags the engine decides itself. Callers can't override them through extra args.
const ENGINE_FLAGS: &[&str] = &[
    "--master-data",
    "--source-data",
    "--gtid",
    "--set-gtid-purged",
    "--single-transaction",
    "--all-databases",
    "-A",
    "--databases",
    "-B",
    "--no-data",
    "-d",
    "--system",
    "--host",
    "-h",
    "--port",
    "-P",
    "--user",
    "-u",
    "--password",
    "-p",
];

/// Stripped in no-data mode.
const DATA_FLAGS: &[&str] = &[
    "--no-create-info",
    "-t",
    "--insert-ignore",
    "--replace",
    "--complete-insert",
    "-c",
    "--extended-insert",
    "-e",
    "--hex-blob",
    "--where",
    "-w",
];

/// Short flags whose value may be glued on (`-uroot`, `-wid>5`) or follow as the next arg.
const SHORT_WITH_VALUE: &[&str] = &["-h", "-P", "-u", "-w"];

/// Flags that take the next argument as their value when written without `=`.
const SEPARATE_VALUE: &[&str] = &[
    "--host", "-h", "--port", "-P", "--user", "-u", "--system", "--where", "-w",
];

/// Every bare name after these is a database to dump.
const SELECTS_DATABASES: &[&str] = &["--databases", "-B", "--all-databases", "-A"];

fn flag_name(arg: &str) -> &str {
    arg.split_once('=').map_or(arg, |(name, _)| name)
}

fn matches_flag(arg: &str, flags: &[&str]) -> bool {
    let name = flag_name(arg);
    if flags.contains(&name) {
        return true;
    }
    // `-p` takes its password glued on, never as a separate argument.
    if arg.starts_with("-p") && !arg.starts_with("--") && flags.contains(&"-p") {
        return true;
    }
    SHORT_WITH_VALUE
        .iter()
        .any(|short| flags.contains(short) && arg.len() > 2 && arg.starts_with(short) && !arg.starts_with("--"))
}

fn is_bare_value(arg: &&String) -> bool {
    !arg.starts_with('-')
}

/// Drops every argument in `flags` together with whatever value or database names
/// belong to it, so nothing is left behind as a stray positional.
fn strip_flags(args: &[String], flags: &[&str], reason: &str) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if !matches_flag(arg, flags) {
            kept.push(arg.clone());
            continue;
        }

        let flag = arg.as_str();
        if flag_name(flag) == "--password" || flag.starts_with("-p") {
            warn!("Dropping password flag from extra dump arguments ({})", reason);
        } else {
            warn!(flag = %flag, "Dropping extra dump argument ({})", reason);
        }

        if SEPARATE_VALUE.contains(&flag) {
            iter.next();
        } else if SELECTS_DATABASES.contains(&flag) {
            while iter.next_if(is_bare_value).is_some() {}
        } else if flag == "--password" || flag == "-p" {
            iter.next_if(is_bare_value);
        }
    }
    kept
}

/// True when the dump is asked to write its own replication marker.
pub fn marker_requested(targets: &DumpTargets, snapshot: &ReplicationSnapshot) -> bool {
    *targets != DumpTargets::UserGrants && snapshot.has_binlog
}

/// Rejects options the installed dump tool can't honour.
pub fn ensure_supported(options: &BackupOptions, flavor: DumpFlavor) -> Result<()> {
    let wants_grants = options.include_user_grants || options.scope == BackupScope::UserGrants;
    if flavor == DumpFlavor::MySql && wants_grants {
        return Err(BackupError::InvalidOptions(
            "user and grant backups need mariadb-dump; MySQL's mysqldump has no --system option"
                .to_string(),
        ));
    }
    Ok(())
}

fn push_marker_flags(
    args: &mut Vec<String>,
    options: &BackupOptions,
    snapshot: &ReplicationSnapshot,
    flavor: DumpFlavor,
) {
    let commented = options.capture_gtid && snapshot.has_gtid;
    match flavor {
        DumpFlavor::MariaDb => {
            if commented {
                args.push("--master-data=2".to_string());
                args.push("--gtid".to_string());
            } else {
                args.push("--master-data=1".to_string());
            }
        }
        DumpFlavor::MySql => {
            args.push(if commented { "--source-data=2" } else { "--source-data=1" }.to_string());
            if snapshot.has_gtid {
                let purged = if options.capture_gtid { "COMMENTED" } else { "OFF" };
                args.push(format!("--set-gtid-purged={}", purged));
            }
        }
    }
}

/// Builds the dump tool's argv. The password is never part of it.
pub fn build_dump_args(
    options: &BackupOptions,
    targets: &DumpTargets,
    snapshot: &ReplicationSnapshot,
    flavor: DumpFlavor,
) -> Vec<String> {
    let connection = &options.connection;
    let mut args = vec![
        format!("--host={}", connection.host),
        format!("--port={}", connection.port),
        format!("--user={}", connection.user),
        "--single-transaction".to_string(),
    ];

    if marker_requested(targets, snapshot) {
        push_marker_flags(&mut args, options, snapshot, flavor);
    }

    let mut extra = strip_flags(&options.extra_args, ENGINE_FLAGS, "engine-controlled");
    if options.no_data {
        extra = strip_flags(&extra, DATA_FLAGS, "no-data backup");
    }
    args.extend(extra);
    if options.no_data {
        args.push("--no-data".to_string());
    }

    match targets {
        DumpTargets::Database(name) => args.push(name.clone()),
        DumpTargets::Databases(names) => {
            args.push("--databases".to_string());
            args.extend(names.iter().cloned());
        }
        DumpTargets::AllDatabases => args.push("--all-databases".to_string()),
        DumpTargets::UserGrants => {
            args.push("--system=users".to_string());
            args.push("--no-create-info".to_string());
            args.push("--no-create-db".to_string());
            args.push("--skip-triggers".to_string());
            args.push("--no-data".to_string());
            args.push("--databases".to_string());
            args.push("mysql".to_string());
        }
    }

    if options.include_user_grants && *targets != DumpTargets::UserGrants {
        args.push("--system=users".to_string());
    }

    args
}

#[derive(Debug, Default)]
pub struct DumpOutcome {
    pub bytes: u64,
    pub marker: Option<DumpMarker>,
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => status.to_string(),
    }
}

/// Copies the child's stderr to ours as it arrives and keeps the first chunk of it.
async fn tee_stderr<R: AsyncRead + Unpin>(mut source: R) -> String {
    let mut captured = Vec::new();
    let mut host = tokio::io::stderr();
    let mut buf = [0u8; 4096];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let _ = host.write_all(&buf[..n]).await;
        let room = STDERR_CAPTURE_LIMIT.saturating_sub(captured.len());
        captured.extend_from_slice(&buf[..n.min(room)]);
    }
    let _ = host.flush().await;
    String::from_utf8_lossy(&captured).trim().to_string()
}

/// Runs the dump tool with stdout streamed into `sink`. The password reaches the child
/// only through its own environment. Cancellation kills the child; whatever was already
/// written stays in the sink.
pub async fn run_dump<W: Write + ?Sized>(
    program: &Path,
    args: &[String],
    password: Option<&Secret>,
    sink: &mut W,
    cancel: &CancellationToken,
) -> Result<DumpOutcome> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match password {
        Some(secret) => command.env("MYSQL_PWD", secret.expose()),
        None => command.env_remove("MYSQL_PWD"),
    };

    info!(program = %program.display(), "Starting dump process");
    debug!(args = ?args, "Dump arguments");
    let mut child = command.spawn().map_err(|source| BackupError::DumpToolSpawn {
        program: program.to_path_buf(),
        source,
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::Pipeline(std::io::Error::other("dump stdout not captured")))?;
    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(tee_stderr(stderr)));

    let mut outcome = DumpOutcome::default();
    let mut scanner = MarkerScanner::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Cancellation requested, stopping dump process");
                let _ = child.kill().await;
                return Err(BackupError::Cancelled);
            }
            read = stdout.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = child.kill().await;
                return Err(BackupError::Pipeline(e));
            }
        };
        scanner.observe(&buf[..n]);
        if let Err(e) = sink.write_all(&buf[..n]) {
            let _ = child.kill().await;
            return Err(BackupError::Pipeline(e));
        }
        outcome.bytes += n as u64;
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(BackupError::Cancelled);
        }
        status = child.wait() => status.map_err(BackupError::Pipeline)?,
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        return Err(BackupError::DumpToolFailed {
            status: describe_status(&status),
            stderr,
        });
    }

    sink.flush().map_err(BackupError::Pipeline)?;
    outcome.marker = scanner.finish();
    info!(bytes = outcome.bytes, "Dump process finished");
    Ok(outcome)
}
