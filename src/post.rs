//! After-download actions on the session folder.
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};

const BURN_TOOL: &str = "drutil";

/// Arguments for burning `folder` to an audio/data disc and ejecting it.
pub fn burn_args(folder: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> =
        ["burn", "-noverify", "-eject", "-speed", "52"].iter().map(OsString::from).collect();
    args.push(folder.as_os_str().to_os_string());
    args
}

/// Burn the folder with the system disc tool. Output is passed through to the terminal.
pub fn burn_folder(folder: &Path) -> Result<()> {
    let tool = which::which(BURN_TOOL)
        .with_context(|| format!("'{}' not found; disc burning needs macOS", BURN_TOOL))?;
    tracing::info!("[post] burning {}", folder.display());
    let status = Command::new(tool)
        .args(burn_args(folder))
        .status()
        .with_context(|| format!("failed to run {}", BURN_TOOL))?;
    if !status.success() {
        bail!("{} exited with {}", BURN_TOOL, status);
    }
    Ok(())
}

/// Platform file-manager command.
pub fn opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(windows) {
        "explorer"
    } else {
        "xdg-open"
    }
}

pub fn open_folder(folder: &Path) -> Result<()> {
    let tool: PathBuf = which::which(opener()).with_context(|| format!("'{}' not found", opener()))?;
    Command::new(tool)
        .arg(folder)
        .spawn()
        .with_context(|| format!("cannot open {}", folder.display()))?;
    Ok(())
}

/// Delete the session folder and everything in it. A folder that is already gone is fine.
pub fn remove_folder(folder: &Path) -> Result<()> {
    match std::fs::remove_dir_all(folder) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot remove {}", folder.display())),
    }
}
