//! Agent self-update: receive a replacement binary, swap it atomically,
//! re-exec into the new version.
//!
//! The swap is delete-then-rename against the running executable, which is
//! safe on Linux because the old inode stays alive for the running process.
//! If any validation fails the staged file is removed and the running
//! binary is untouched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

/// Hard cap on a pushed binary.
pub const MAX_UPDATE_BYTES: u64 = 512 * 1024 * 1024;

/// Staged filename next to the running executable.
pub const STAGED_NAME: &str = "agent.new";

/// Check a fully-received payload against the declared size and the cap.
pub fn validate_size(received: u64, declared: Option<u64>) -> Result<(), String> {
    if received == 0 {
        return Err("update payload is empty".to_string());
    }
    if received > MAX_UPDATE_BYTES {
        return Err(format!(
            "update payload of {} bytes exceeds the {} byte limit",
            received, MAX_UPDATE_BYTES
        ));
    }
    if let Some(expected) = declared {
        if expected > 0 && received != expected {
            return Err(format!(
                "size mismatch: received {} bytes, expected {}",
                received, expected
            ));
        }
    }
    Ok(())
}

/// Where an incoming update is staged.
pub fn staged_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to resolve current executable")?;
    let dir = exe
        .parent()
        .context("Executable has no parent directory")?;
    Ok(dir.join(STAGED_NAME))
}

/// Replace the running executable with the staged binary.
pub async fn apply(staged: &Path) -> Result<()> {
    let current = std::env::current_exe().context("Failed to resolve current executable")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(staged).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(staged, perms).await?;
    }

    tokio::fs::remove_file(&current)
        .await
        .context("Failed to remove current executable")?;
    tokio::fs::rename(staged, &current)
        .await
        .context("Failed to move staged binary into place")?;

    info!(path = %current.display(), "Agent binary replaced");
    Ok(())
}

/// After the ACK has gone out, come back up on the new binary with the
/// original argv and environment.
pub fn schedule_reexec() {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                error!(error = %e, "Cannot resolve executable for re-exec");
                return;
            }
        };
        let args: Vec<String> = std::env::args().skip(1).collect();
        info!("Re-executing agent on updated binary");

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let err = std::process::Command::new(exe).args(args).exec();
            error!(error = %err, "exec of updated binary failed");
        }
        #[cfg(not(unix))]
        {
            let _ = std::process::Command::new(exe).args(args).spawn();
            std::process::exit(0);
        }
    });
}
