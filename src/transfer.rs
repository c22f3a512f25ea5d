// transfer module: download session orchestration and its building blocks
mod attempt;
mod classifier;
pub mod client;
mod item;
pub mod mirror;
pub mod mock_peer;
mod scheduler;
mod watchdog;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressStyle};
use serde::Serialize;

pub use self::attempt::Outcome;
pub use self::classifier::{AbandonCause, AbandonedItem, Classification, RetryLedger, RetryState};
pub use self::client::{
    ByteStream, CancelToken, Credentials, PeerSession, StreamEvent, TransferClient,
};
pub use self::item::{ItemId, TransferItem, display_name};
pub use self::scheduler::{BatchReport, InFlightGauge};

use self::attempt::{AttemptCtx, ProgressCtx};
use self::scheduler::Scheduler;
use crate::SessionError;
use crate::folder::FolderManager;
use crate::selection::SelectionProvider;

pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 6;
pub const DEFAULT_MAX_DOWNLOAD_TIME: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_EXPIRE_RETRIES: u32 = 2;
pub const DEFAULT_MAX_FAIL_RETRIES: u32 = 2;

/// Knobs of one download session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub download_concurrency: usize,
    /// Per-attempt watchdog deadline.
    pub max_download_time: Duration,
    pub max_expire_retries: u32,
    pub max_fail_retries: u32,
    /// Draw a spinner per in-flight download.
    pub show_progress: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            max_download_time: DEFAULT_MAX_DOWNLOAD_TIME,
            max_expire_retries: DEFAULT_MAX_EXPIRE_RETRIES,
            max_fail_retries: DEFAULT_MAX_FAIL_RETRIES,
            show_progress: false,
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.download_concurrency == 0 {
            return Err(SessionError::Config("download concurrency must be at least 1".to_string()));
        }
        if self.max_download_time.is_zero() {
            return Err(SessionError::Config("max download time must be positive".to_string()));
        }
        Ok(())
    }
}

/// Aggregate result handed back to the caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub downloaded: usize,
    pub requested: usize,
    pub rounds: usize,
    pub attempts: usize,
    pub bytes: u64,
    pub peak_in_flight: usize,
    pub abandoned: Vec<AbandonedItem>,
    pub folder: Option<PathBuf>,
    pub elapsed_secs: f64,
}

/// State shared by every attempt of one session.
struct SessionState {
    folder: FolderManager,
    downloaded: Arc<AtomicUsize>,
    limit: usize,
}

/// Download session entry point.
///
/// Steps, each a hard sequencing point:
/// 1. validate options (nothing is contacted on failure);
/// 2. connect to the peer network;
/// 3. ask the selection collaborator for the track list;
/// 4. run rounds of scheduler + classifier until no item is left to retry;
/// 5. report.
///
/// Only configuration, connection, selection and storage problems are errors.
/// Individual transfers that never succeed show up in `abandoned`.
pub fn run_session(
    client: &dyn TransferClient,
    selection: &dyn SelectionProvider,
    credentials: &Credentials,
    folder: FolderManager,
    options: &SessionOptions,
) -> Result<SessionReport, SessionError> {
    options.validate()?;
    let start = Instant::now();
    let state = SessionState {
        folder,
        downloaded: Arc::new(AtomicUsize::new(0)),
        limit: options.download_concurrency,
    };

    let session = client.connect(credentials)?;
    tracing::info!("[session] connected as {}", credentials.username);

    let mut batch = dedup_items(selection.collect_track_list(session.as_ref())?);
    let requested = batch.len();
    if batch.is_empty() {
        tracing::info!("[session] nothing selected");
        return Ok(SessionReport { elapsed_secs: start.elapsed().as_secs_f64(), ..Default::default() });
    }

    // 目录在首次下载前创建，失败即终止
    let folder_path = state.folder.resolve()?;
    let ctx = Arc::new(AttemptCtx {
        session,
        folder: folder_path.clone(),
        progress: progress_ctx(options.show_progress),
    });
    let scheduler =
        Scheduler::new(state.limit, options.max_download_time, ctx, state.downloaded.clone())?;
    let mut ledger = RetryLedger::new(options.max_expire_retries, options.max_fail_retries);

    let mut report = SessionReport { requested, folder: Some(folder_path), ..Default::default() };
    let mut succeeded = 0usize;
    while !batch.is_empty() {
        report.rounds += 1;
        report.attempts += batch.len();
        let credit_before = ledger.remaining_credit(&batch);
        tracing::debug!(
            "[session] round={} items={} credit={}",
            report.rounds,
            batch.len(),
            credit_before
        );
        let round = scheduler.run(batch);
        report.bytes += round.bytes;
        report.peak_in_flight = report.peak_in_flight.max(round.peak_in_flight);

        let classified = ledger.classify(round.outcomes);
        succeeded += classified.succeeded.len();
        report.abandoned.extend(classified.abandoned);
        // every requeue spends one unit of a bounded per-item budget
        debug_assert!(
            classified.next_batch.is_empty()
                || ledger.remaining_credit(&classified.next_batch) < credit_before
        );
        tracing::debug!(
            "[session] round={} succeeded={} requeued={}",
            report.rounds,
            classified.succeeded.len(),
            classified.next_batch.len()
        );
        batch = classified.next_batch;
    }

    report.downloaded = state.downloaded.load(Ordering::SeqCst);
    debug_assert_eq!(report.downloaded, succeeded);
    report.elapsed_secs = start.elapsed().as_secs_f64();
    tracing::info!(
        "[session] downloaded {}/{} in {} rounds ({} abandoned)",
        report.downloaded,
        report.requested,
        report.rounds,
        report.abandoned.len()
    );
    Ok(report)
}

/// Drop repeated selections of the same remote file, keeping the first.
fn dedup_items(items: Vec<TransferItem>) -> Vec<TransferItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|it| {
            let fresh = seen.insert(it.id());
            if !fresh {
                tracing::warn!("[session] ignoring duplicate selection {}", it.id());
            }
            fresh
        })
        .collect()
}

fn progress_ctx(enabled: bool) -> Option<ProgressCtx> {
    if !enabled {
        return None;
    }
    let style = ProgressStyle::with_template(
        "{spinner:.green} Downloading file at: {msg} [{bytes}/{total_bytes}]",
    )
    .ok()?;
    Some(ProgressCtx { mp: Arc::new(MultiProgress::new()), style })
}
