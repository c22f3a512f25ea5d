use std::fs::File;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::client::{ByteStream, CancelToken, PeerSession, StreamEvent};
use super::item::TransferItem;
use crate::AttemptError;

/// Result of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { bytes: u64 },
    Expired,
    Failed(AttemptError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Expired => "expired",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Everything an attempt needs, shared by all workers of a session.
pub(crate) struct AttemptCtx {
    pub(crate) session: Arc<dyn PeerSession>,
    pub(crate) folder: PathBuf,
    pub(crate) progress: Option<ProgressCtx>,
}

pub(crate) struct ProgressCtx {
    pub(crate) mp: Arc<MultiProgress>,
    pub(crate) style: ProgressStyle,
}

static ATTEMPT_SEQ: AtomicU64 = AtomicU64::new(1);

enum Stop {
    Cancelled,
    Failed(AttemptError),
}

/// Download `item` into the session folder. The data lands in a per-attempt
/// `<name>.<seq>.part` file and is renamed onto `<name>` only if the attempt wins
/// the race against its deadline. Partial files of losing attempts are removed.
pub(crate) fn run_attempt(ctx: &AttemptCtx, item: &TransferItem, cancel: &CancelToken) -> Outcome {
    let name = match local_file_name(item) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("[attempt] {} rejected: {}", item.id(), e);
            return Outcome::Failed(e);
        }
    };
    let target = ctx.folder.join(&name);
    let pb = ctx.progress.as_ref().map(|p| {
        crate::util::create_file_pb(&p.mp, &p.style, item.size, &target.display().to_string())
    });
    let res = transfer_once(ctx, item, &target, cancel, pb.as_ref());
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    match res {
        Ok(bytes) => {
            tracing::debug!("[attempt] {} done ({} bytes)", item.id(), bytes);
            Outcome::Success { bytes }
        }
        Err(Stop::Cancelled) => {
            tracing::debug!("[attempt] {} cancelled by watchdog", item.id());
            Outcome::Expired
        }
        Err(Stop::Failed(e)) => {
            tracing::debug!("[attempt] {} failed: {}", item.id(), e);
            Outcome::Failed(e)
        }
    }
}

/// Local file name for `item`: exactly one plain path component, so the
/// download can never leave the session folder.
pub(crate) fn local_file_name(item: &TransferItem) -> Result<String, AttemptError> {
    let name = item.display_name();
    let mut comps = Path::new(&name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(name),
        _ => Err(AttemptError::LocalIo(format!("unsafe local file name {:?}", name))),
    }
}

fn next_attempt_seq() -> u64 {
    ATTEMPT_SEQ.fetch_add(1, Ordering::Relaxed)
}

fn transfer_once(
    ctx: &AttemptCtx,
    item: &TransferItem,
    target: &Path,
    cancel: &CancelToken,
    pb: Option<&ProgressBar>,
) -> Result<u64, Stop> {
    let mut stream = ctx
        .session
        .open_download_stream(item, cancel.clone())
        .map_err(|e| Stop::Failed(AttemptError::OpenFailed(e)))?;
    let part = part_path(target, next_attempt_seq());
    let filled = fill_part(stream.as_mut(), &part, cancel, pb);
    if filled.is_err() {
        stream.cancel();
    }
    drop(stream);
    let bytes = match filled {
        Ok(n) => n,
        Err(stop) => {
            discard_part(&part);
            return Err(stop);
        }
    };
    // 截止时间已到则放弃提交
    if !cancel.try_commit() {
        discard_part(&part);
        return Err(Stop::Cancelled);
    }
    atomic_rename_with_retries(&part, target).map_err(|e| {
        discard_part(&part);
        Stop::Failed(AttemptError::LocalIo(format!("rename failed: {}", e)))
    })?;
    Ok(bytes)
}

fn fill_part(
    stream: &mut dyn ByteStream,
    part: &Path,
    cancel: &CancelToken,
    pb: Option<&ProgressBar>,
) -> Result<u64, Stop> {
    let mut local_f = File::create(part)
        .map_err(|e| Stop::Failed(AttemptError::LocalIo(format!("create {}: {}", part.display(), e))))?;
    let bytes = pump(stream, &mut local_f, cancel, pb)?;
    local_f
        .flush()
        .and_then(|_| local_f.sync_all())
        .map_err(|e| Stop::Failed(AttemptError::LocalIo(format!("sync failed: {}", e))))?;
    Ok(bytes)
}

fn discard_part(part: &Path) {
    if let Err(e) = std::fs::remove_file(part)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!("[attempt] could not remove {}: {}", part.display(), e);
    }
}

fn pump(
    stream: &mut dyn ByteStream,
    local_f: &mut File,
    cancel: &CancelToken,
    pb: Option<&ProgressBar>,
) -> Result<u64, Stop> {
    let mut written: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        match stream.next_event() {
            StreamEvent::Data(chunk) => {
                // no writes once the watchdog gave up on us
                if cancel.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                local_f
                    .write_all(&chunk)
                    .map_err(|e| Stop::Failed(AttemptError::LocalIo(format!("write failed: {}", e))))?;
                written += chunk.len() as u64;
                if let Some(pb) = pb {
                    pb.inc(chunk.len() as u64);
                }
            }
            StreamEvent::End => return Ok(written),
            StreamEvent::Error(e) => {
                if cancel.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                return Err(Stop::Failed(AttemptError::Stream(e)));
            }
        }
    }
}

/// `<target>.<seq>.part`; every attempt writes its own file.
pub(crate) fn part_path(target: &Path, seq: u64) -> PathBuf {
    let name = target.file_name().and_then(|n| n.to_str()).unwrap_or("download");
    target.with_file_name(format!("{}.{}.part", name, seq))
}

/// Rename `tmp_path` onto `local_target`, retrying a few times if the target already
/// exists or is temporarily permission-denied (Windows semantics).
pub(crate) fn atomic_rename_with_retries(
    tmp_path: &Path,
    local_target: &Path,
) -> Result<(), std::io::Error> {
    use std::time::Duration;
    let mut attempts = 0;
    loop {
        match std::fs::rename(tmp_path, local_target) {
            Ok(()) => return Ok(()),
            Err(e) => {
                let kind = e.kind();
                if attempts < 2
                    && (kind == std::io::ErrorKind::AlreadyExists
                        || kind == std::io::ErrorKind::PermissionDenied)
                {
                    let _ = std::fs::remove_file(local_target);
                    std::thread::sleep(Duration::from_millis(50));
                    attempts += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}
