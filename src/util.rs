use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::transfer::{AbandonCause, AbandonedItem, SessionReport};

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    true
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// `~/.dj-tools`
pub fn app_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(format!(".{}", env!("CARGO_PKG_NAME"))))
}

pub fn logs_dir() -> Option<PathBuf> {
    app_dir().map(|d| d.join("logs"))
}

/// Install the global subscriber. With `verbose` the output goes to a daily file
/// under `logs_dir()`; the returned guard must live until the process exits.
pub fn init_logging(verbose: bool) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }))
    };
    if verbose && let Some(dir) = logs_dir() {
        if std::fs::create_dir_all(&dir).is_ok() {
            let appender = tracing_appender::rolling::daily(&dir, "djt.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .is_ok();
            return installed.then_some(guard);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    None
}

pub fn info(msg: &str) {
    if try_enable_ansi_on_windows() {
        println!("{}", format!(" {} ", msg).black().on_cyan());
    } else {
        println!("{}", msg);
    }
}

pub fn error(msg: &str) {
    if try_enable_ansi_on_windows() {
        eprintln!("{}", format!(" {} ", msg).white().on_red());
    } else {
        eprintln!("{}", msg);
    }
}

/// Spinner for one in-flight download, attached to the shared MultiProgress.
pub fn create_file_pb(
    mp: &MultiProgress,
    style: &ProgressStyle,
    size: u64,
    target: &str,
) -> ProgressBar {
    let pb = mp.add(ProgressBar::new(size));
    pb.set_style(style.clone());
    pb.set_message(target.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One line summarising a finished session.
pub fn summary_line(report: &SessionReport) -> String {
    let rate = if report.elapsed_secs > 0.0 {
        report.bytes as f64 / 1024.0 / 1024.0 / report.elapsed_secs
    } else {
        0.0
    };
    format!(
        "Downloaded {}/{} tracks ({}, {:.2} MB/s, {} rounds, {} attempts, {:.2}s)",
        report.downloaded,
        report.requested,
        human_bytes(report.bytes),
        rate,
        report.rounds,
        report.attempts,
        report.elapsed_secs
    )
}

pub fn print_summary(report: &SessionReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(s) => println!("{}", s),
            Err(e) => error(&format!("cannot encode summary: {}", e)),
        }
        return;
    }
    info(&summary_line(report));
    if let Some(folder) = &report.folder {
        println!("Folder: {}", folder.display());
    }
}

fn cause_text(cause: &AbandonCause) -> String {
    match cause {
        AbandonCause::Expired => "expired".to_string(),
        AbandonCause::Failed(reason) => format!("failed: {}", reason),
    }
}

pub fn print_abandoned_table(abandoned: &[AbandonedItem]) {
    if abandoned.is_empty() {
        return;
    }
    let title = vec![
        "Track".cell().bold(true),
        "Peer".cell().bold(true),
        "Expired".cell().bold(true),
        "Failed".cell().bold(true),
        "Cause".cell().bold(true),
    ];
    let rows: Vec<Vec<CellStruct>> = abandoned
        .iter()
        .map(|a| {
            vec![
                a.item.display_name().cell(),
                a.item.user.clone().cell(),
                a.retries.expired.cell().justify(Justify::Right),
                a.retries.failed.cell().justify(Justify::Right),
                cause_text(&a.cause).cell(),
            ]
        })
        .collect();
    if let Err(e) = print_stdout(rows.table().title(title)) {
        tracing::warn!("cannot print abandoned table: {}", e);
    }
}

/// Append abandoned items as JSON Lines to `<dir>/abandoned.jsonl`, one object per
/// item tagged with the UTC time of the run. Returns the file path when written.
pub fn write_abandoned_jsonl(dir: &Path, abandoned: &[AbandonedItem]) -> Option<PathBuf> {
    if abandoned.is_empty() {
        return None;
    }
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!("cannot create {}: {}", dir.display(), e);
        return None;
    }
    let path = dir.join("abandoned.jsonl");
    let mut f = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("cannot open {}: {}", path.display(), e);
            return None;
        }
    };
    let at = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    if let Err(e) = write_abandoned_lines(&mut f, &at, abandoned) {
        tracing::warn!("cannot write {}: {}", path.display(), e);
        return None;
    }
    Some(path)
}

fn write_abandoned_lines<W: Write>(w: &mut W, at: &str, abandoned: &[AbandonedItem]) -> std::io::Result<()> {
    for a in abandoned {
        let obj = serde_json::json!({ "at": at, "abandoned": a });
        let line = serde_json::to_string(&obj).map_err(std::io::Error::other)?;
        writeln!(w, "{}", line)?;
    }
    w.flush()
}
