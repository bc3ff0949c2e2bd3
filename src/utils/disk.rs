// Free-space probe for the output directory.
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// Returns the bytes available to unprivileged users on the filesystem holding `dir`,
/// as reported by `df -Pk`.
pub fn available_bytes(dir: &Path) -> Result<u64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(dir)
        .output()
        .with_context(|| format!("Failed to execute df for {}", dir.display()))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "df for {} failed with status: {}\nStderr: {}",
            dir.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    parse_df_available(&String::from_utf8_lossy(&output.stdout))
        .with_context(|| format!("Unexpected df output for {}", dir.display()))
}

/// POSIX `df -P` prints a header then `fs 1024-blocks used available capacity mount`.
fn parse_df_available(stdout: &str) -> Result<u64> {
    let line = stdout
        .lines()
        .skip(1)
        .find(|line| !line.trim().is_empty())
        .context("df printed no filesystem line")?;
    let available_kb: u64 = line
        .split_whitespace()
        .nth(3)
        .context("df line has fewer than four columns")?
        .parse()
        .context("df available column is not a number")?;
    Ok(available_kb * 1024)
}
