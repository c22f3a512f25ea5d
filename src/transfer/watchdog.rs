use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, after, bounded, select};

use super::attempt::{AttemptCtx, Outcome, run_attempt};
use super::client::CancelToken;
use super::item::TransferItem;
use crate::AttemptError;

/// How long an expired attempt gets to close its stream and exit.
pub(crate) const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run one attempt against a deadline.
///
/// The attempt runs on its own thread and reports through a one-slot channel.
/// Whichever settles first wins. If the deadline fires before the attempt
/// commits, the token is cancelled, the attempt cancels and drops its stream,
/// and only then is `Expired` returned, so the caller's slot is not reused while
/// the old stream is still open. If the attempt committed just before the
/// deadline, its own outcome is awaited and returned.
pub(crate) fn run_with_deadline(
    ctx: Arc<AttemptCtx>,
    item: TransferItem,
    deadline: Duration,
) -> Outcome {
    let cancel = CancelToken::new();
    let (done_tx, done_rx) = bounded::<Outcome>(1);
    let attempt_cancel = cancel.clone();
    let id = item.id();
    let spawned = std::thread::Builder::new().name("djt-attempt".to_string()).spawn(move || {
        let outcome = catch_unwind(AssertUnwindSafe(|| run_attempt(&ctx, &item, &attempt_cancel)))
            .unwrap_or_else(|payload| {
                Outcome::Failed(AttemptError::Panicked(crate::util::panic_message(payload.as_ref())))
            });
        let _ = done_tx.send(outcome);
    });
    let handle = match spawned {
        Ok(h) => h,
        Err(e) => {
            return Outcome::Failed(AttemptError::LocalIo(format!("could not spawn attempt: {}", e)));
        }
    };

    select! {
        recv(done_rx) -> res => {
            join_attempt(handle);
            res.unwrap_or_else(|_| lost_attempt())
        }
        recv(after(deadline)) -> _ => {
            if cancel.cancel() {
                tracing::debug!("[watchdog] {} expired after {:?}", id, deadline);
                // 等待尝试线程关闭并释放数据流
                match done_rx.recv_timeout(TEARDOWN_GRACE) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => join_attempt(handle),
                    Err(RecvTimeoutError::Timeout) => tracing::warn!(
                        "[watchdog] {} ignored cancellation for {:?}, detaching",
                        id,
                        TEARDOWN_GRACE
                    ),
                }
                Outcome::Expired
            } else {
                // committed right at the deadline; its result is on the way
                let res = done_rx.recv().unwrap_or_else(|_| lost_attempt());
                join_attempt(handle);
                res
            }
        }
    }
}

fn join_attempt(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::debug!("[watchdog] attempt thread panicked after reporting");
    }
}

fn lost_attempt() -> Outcome {
    Outcome::Failed(AttemptError::Panicked("attempt exited without reporting".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::mock_peer::{Behavior, ScriptedPeer};
    use std::path::PathBuf;
    use std::time::Instant;

    fn make_tmp_dir() -> PathBuf {
        let mut base = std::env::temp_dir();
        let uniq = format!(
            "djt_watchdog_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        base.push(uniq);
        std::fs::create_dir(&base).expect("create tmp dir");
        base
    }

    fn ctx(peer: &ScriptedPeer, dir: &PathBuf) -> Arc<AttemptCtx> {
        Arc::new(AttemptCtx { session: peer.session(), folder: dir.clone(), progress: None })
    }

    #[test]
    fn stalled_stream_expires_at_deadline() {
        let dir = make_tmp_dir();
        let peer = ScriptedPeer::new();
        let item = TransferItem::new("u", "share\\Stuck.mp3", 10);
        peer.script(&item, [Behavior::Stall]);
        let start = Instant::now();
        let out = run_with_deadline(ctx(&peer, &dir), item, Duration::from_millis(100));
        assert_eq!(out, Outcome::Expired);
        assert!(start.elapsed() >= Duration::from_millis(100));
        // the stalled stream is already torn down when the slot is handed back
        assert_eq!(peer.open_streams(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn late_delivery_is_discarded() {
        let dir = make_tmp_dir();
        let peer = ScriptedPeer::new();
        let item = TransferItem::new("u", "share\\Slow.mp3", 4);
        peer.script(&item, [Behavior::SlowDeliver(Duration::from_millis(250), b"late".to_vec())]);
        let start = Instant::now();
        let out = run_with_deadline(ctx(&peer, &dir), item, Duration::from_millis(50));
        assert_eq!(out, Outcome::Expired);
        assert!(start.elapsed() < Duration::from_millis(250), "waited for the slow stream");
        assert_eq!(peer.open_streams(), 0);
        std::thread::sleep(Duration::from_millis(300));
        assert!(!dir.join("Slow.mp3").exists());
        assert_eq!(std::fs::read_dir(&dir).expect("list").count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn fast_completion_beats_deadline() {
        let dir = make_tmp_dir();
        let peer = ScriptedPeer::new();
        let item = TransferItem::new("u", "share\\Quick.mp3", 5);
        peer.script(&item, [Behavior::Deliver(b"quick".to_vec())]);
        let out = run_with_deadline(ctx(&peer, &dir), item, Duration::from_secs(5));
        assert_eq!(out, Outcome::Success { bytes: 5 });
        assert!(dir.join("Quick.mp3").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn panic_in_attempt_is_failed() {
        let dir = make_tmp_dir();
        let peer = ScriptedPeer::new();
        let item = TransferItem::new("u", "share\\Boom.mp3", 5);
        peer.script(&item, [Behavior::Panic("kaboom".to_string())]);
        let out = run_with_deadline(ctx(&peer, &dir), item, Duration::from_secs(5));
        assert_eq!(out, Outcome::Failed(AttemptError::Panicked("kaboom".to_string())));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
