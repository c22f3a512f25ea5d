use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dj_tools::SessionError;
use dj_tools::folder::FolderManager;
use dj_tools::selection::{FixedSelection, SelectionProvider};
use dj_tools::transfer::mock_peer::{Behavior, ScriptedPeer};
use dj_tools::transfer::{
    AbandonCause, ByteStream, CancelToken, Credentials, PeerSession, RetryState, SessionOptions,
    StreamEvent, TransferClient, TransferItem, run_session,
};

fn make_tmp_dir(tag: &str) -> PathBuf {
    let mut base = std::env::temp_dir();
    let uniq = format!(
        "djt_session_{}_{}_{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    );
    base.push(uniq);
    std::fs::create_dir_all(&base).expect("create tmp dir");
    base
}

fn creds() -> Credentials {
    Credentials::new("dj", "secret")
}

fn track(i: usize) -> TransferItem {
    TransferItem::new("peer", format!("music\\set\\track{}.mp3", i), 16)
}

fn options(limit: usize, deadline_ms: u64, expire: u32, fail: u32) -> SessionOptions {
    SessionOptions {
        download_concurrency: limit,
        max_download_time: Duration::from_millis(deadline_ms),
        max_expire_retries: expire,
        max_fail_retries: fail,
        show_progress: false,
    }
}

/// Selection that records whether it was consulted.
struct CountingSelection {
    items: Vec<TransferItem>,
    calls: AtomicUsize,
}

impl SelectionProvider for CountingSelection {
    fn collect_track_list(&self, _session: &dyn PeerSession) -> Result<Vec<TransferItem>, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}

#[test]
fn always_expiring_item_is_tried_retries_plus_one_times() {
    let dir = make_tmp_dir("expire");
    let peer = ScriptedPeer::new();
    let item = track(0);
    peer.script(&item, [Behavior::Stall]);
    let report = run_session(
        &peer,
        &FixedSelection::new(vec![item.clone()]),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(2, 50, 2, 2),
    )
    .expect("session");
    assert_eq!(peer.attempts(&item), 3);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.rounds, 3);
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].cause, AbandonCause::Expired);
    assert_eq!(report.abandoned[0].retries, RetryState { expired: 2, failed: 0 });
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn always_failing_item_respects_fail_ceiling() {
    let dir = make_tmp_dir("fail");
    let peer = ScriptedPeer::new();
    let item = track(0);
    peer.script(&item, [Behavior::FailAfter(b"half".to_vec(), "peer reset".to_string())]);
    let report = run_session(
        &peer,
        &FixedSelection::new(vec![item.clone()]),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(1, 5_000, 2, 1),
    )
    .expect("session");
    assert_eq!(peer.attempts(&item), 2);
    assert_eq!(report.downloaded, 0);
    match &report.abandoned[0].cause {
        AbandonCause::Failed(reason) => assert!(reason.contains("peer reset"), "{}", reason),
        other => panic!("unexpected cause {:?}", other),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn first_try_success_is_attempted_once_and_written() {
    let dir = make_tmp_dir("ok");
    let peer = ScriptedPeer::new();
    let items: Vec<TransferItem> = (0..3).map(track).collect();
    let report = run_session(
        &peer,
        &FixedSelection::new(items.clone()),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(6, 5_000, 2, 2),
    )
    .expect("session");
    assert_eq!(report.downloaded, 3);
    assert_eq!(report.requested, 3);
    assert_eq!(report.rounds, 1);
    assert!(report.abandoned.is_empty());
    let folder = report.folder.clone().expect("folder");
    assert!(folder.starts_with(dir.join("djt-downloads")));
    for it in &items {
        assert_eq!(peer.attempts(it), 1);
        let body = std::fs::read(folder.join(it.display_name())).expect("downloaded file");
        assert_eq!(body, it.file.as_bytes());
    }
    // no leftover partial files
    let parts = std::fs::read_dir(&folder)
        .expect("read folder")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .count();
    assert_eq!(parts, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn downloaded_counts_eventual_successes() {
    let dir = make_tmp_dir("mixed");
    let peer = ScriptedPeer::new();
    let items: Vec<TransferItem> = (0..4).map(track).collect();
    peer.script(&items[0], [Behavior::Refuse("busy".to_string()), Behavior::Deliver(b"ok".to_vec())]);
    peer.script(&items[1], [Behavior::Stall, Behavior::Deliver(b"late".to_vec())]);
    peer.script(&items[2], [Behavior::Refuse("gone".to_string())]);
    let report = run_session(
        &peer,
        &FixedSelection::new(items.clone()),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(4, 100, 1, 1),
    )
    .expect("session");
    assert_eq!(report.downloaded, 3);
    assert_eq!(report.requested, 4);
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].item, items[2]);
    assert_eq!(peer.attempts(&items[3]), 1);
    assert_eq!(report.attempts, peer.total_attempts());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stalled_attempt_expires_once_and_writes_nothing() {
    let dir = make_tmp_dir("stall");
    let peer = ScriptedPeer::new();
    let item = track(7);
    peer.script(&item, [Behavior::SlowDeliver(Duration::from_millis(300), b"too late".to_vec())]);
    let report = run_session(
        &peer,
        &FixedSelection::new(vec![item.clone()]),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(1, 100, 0, 0),
    )
    .expect("session");
    assert_eq!(peer.attempts(&item), 1);
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].cause, AbandonCause::Expired);
    // give the abandoned attempt time to wake up; it must not publish the file
    std::thread::sleep(Duration::from_millis(400));
    let folder = report.folder.expect("folder");
    assert!(!folder.join(item.display_name()).exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn expired_streams_are_closed_before_the_slot_is_reused() {
    let dir = make_tmp_dir("teardown");
    let peer = ScriptedPeer::new();
    let item = track(3);
    peer.script(&item, [Behavior::SlowDeliver(Duration::from_millis(400), b"slow".to_vec())]);
    let report = run_session(
        &peer,
        &FixedSelection::new(vec![item.clone()]),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(1, 100, 2, 0),
    )
    .expect("session");
    assert_eq!(peer.attempts(&item), 3);
    assert_eq!(report.abandoned.len(), 1);
    assert!(report.peak_in_flight <= 1);
    assert_eq!(peer.peak_open_streams(), 1);
    assert_eq!(peer.open_streams(), 0);
    let folder = report.folder.expect("folder");
    assert_eq!(std::fs::read_dir(&folder).expect("list").count(), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn remote_names_cannot_escape_the_session_folder() {
    let dir = make_tmp_dir("escape");
    let outside = make_tmp_dir("escape_target");
    let target = outside.join("pwned.mp3");
    let hostile = TransferItem::new("peer", format!("share\\{}", target.display()), 4);
    let parent = TransferItem::new("peer", "share\\..", 4);
    let fine = track(1);
    let peer = ScriptedPeer::new();
    let report = run_session(
        &peer,
        &FixedSelection::new(vec![hostile.clone(), parent.clone(), fine.clone()]),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(2, 5_000, 0, 1),
    )
    .expect("session");
    assert_eq!(report.downloaded, 1);
    assert!(!target.exists());
    assert_eq!(std::fs::read_dir(&outside).expect("list").count(), 0);
    let folder = report.folder.expect("folder");
    let names: Vec<String> = std::fs::read_dir(&folder)
        .expect("list")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![fine.display_name()]);
    let abandoned: Vec<&TransferItem> = report.abandoned.iter().map(|a| &a.item).collect();
    assert_eq!(abandoned, vec![&hostile, &parent]);
    assert_eq!(peer.attempts(&hostile), 0);
    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::remove_dir_all(&outside);
}

#[test]
fn zero_concurrency_fails_before_connecting() {
    let dir = make_tmp_dir("zero");
    let peer = ScriptedPeer::new();
    let selection = CountingSelection { items: vec![track(0)], calls: AtomicUsize::new(0) };
    let res = run_session(&peer, &selection, &creds(), FolderManager::new(&dir, "djt"), &options(0, 100, 1, 1));
    assert!(matches!(res, Err(SessionError::Config(_))));
    assert_eq!(peer.connects(), 0);
    assert_eq!(selection.calls.load(Ordering::SeqCst), 0);
    assert!(!dir.join("djt-downloads").exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn five_items_with_limit_two() {
    let dir = make_tmp_dir("limit");
    let peer = ScriptedPeer::new();
    peer.set_chunk_delay(Duration::from_millis(40));
    let items: Vec<TransferItem> = (0..5).map(track).collect();
    let report = run_session(
        &peer,
        &FixedSelection::new(items),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(2, 5_000, 2, 2),
    )
    .expect("session");
    assert_eq!(report.downloaded, 5);
    assert!(report.peak_in_flight <= 2, "peak {}", report.peak_in_flight);
    assert!(peer.peak_open_streams() <= 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn connection_failure_stops_before_selection() {
    let dir = make_tmp_dir("conn");
    let peer = ScriptedPeer::new();
    peer.fail_connect("wrong password");
    let selection = CountingSelection { items: vec![track(0)], calls: AtomicUsize::new(0) };
    let res = run_session(&peer, &selection, &creds(), FolderManager::new(&dir, "djt"), &options(2, 100, 1, 1));
    match res {
        Err(SessionError::Connection(msg)) => assert_eq!(msg, "wrong password"),
        other => panic!("unexpected {:?}", other.map(|r| r.downloaded)),
    }
    assert_eq!(peer.connects(), 1);
    assert_eq!(selection.calls.load(Ordering::SeqCst), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn empty_selection_creates_no_folder() {
    let dir = make_tmp_dir("empty");
    let peer = ScriptedPeer::new();
    let report = run_session(
        &peer,
        &FixedSelection::new(Vec::new()),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(2, 100, 1, 1),
    )
    .expect("session");
    assert_eq!(report.requested, 0);
    assert_eq!(report.rounds, 0);
    assert!(report.folder.is_none());
    assert!(!dir.join("djt-downloads").exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unwritable_folder_is_storage_error() {
    let dir = make_tmp_dir("storage");
    let blocker = dir.join("not-a-dir");
    std::fs::write(&blocker, b"x").expect("write blocker");
    let peer = ScriptedPeer::new();
    let res = run_session(
        &peer,
        &FixedSelection::new(vec![track(0)]),
        &creds(),
        FolderManager::new(&blocker, "djt"),
        &options(2, 100, 1, 1),
    );
    assert!(matches!(res, Err(SessionError::Storage { .. })));
    assert_eq!(peer.total_attempts(), 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn duplicate_selections_are_fetched_once() {
    let dir = make_tmp_dir("dup");
    let peer = ScriptedPeer::new();
    let report = run_session(
        &peer,
        &FixedSelection::new(vec![track(1), track(1), track(2)]),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(2, 5_000, 1, 1),
    )
    .expect("session");
    assert_eq!(report.requested, 2);
    assert_eq!(report.downloaded, 2);
    assert_eq!(peer.attempts(&track(1)), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

// Peer that records the order in which streams are opened. The first attempt of
// every item named "expire*" stalls and of every "fail*" item is refused.
#[derive(Default)]
struct OrderPeer {
    opened: Mutex<Vec<String>>,
}

struct OrderSession(Arc<OrderPeer>);

struct StallStream(CancelToken);

impl ByteStream for StallStream {
    fn next_event(&mut self) -> StreamEvent {
        let _ = self.0.signal().recv();
        StreamEvent::Error("cancelled".to_string())
    }
    fn cancel(&mut self) {}
}

struct OnceStream(Option<Vec<u8>>);

impl ByteStream for OnceStream {
    fn next_event(&mut self) -> StreamEvent {
        match self.0.take() {
            Some(b) => StreamEvent::Data(b),
            None => StreamEvent::End,
        }
    }
    fn cancel(&mut self) {}
}

impl PeerSession for OrderSession {
    fn open_download_stream(
        &self,
        item: &TransferItem,
        cancel: CancelToken,
    ) -> Result<Box<dyn ByteStream>, String> {
        let name = item.display_name();
        let first = {
            let mut opened = self.0.opened.lock().map_err(|_| "poisoned".to_string())?;
            let first = !opened.contains(&name);
            opened.push(name.clone());
            first
        };
        if first && name.starts_with("expire") {
            return Ok(Box::new(StallStream(cancel)));
        }
        if first && name.starts_with("fail") {
            return Err("refused".to_string());
        }
        Ok(Box::new(OnceStream(Some(name.into_bytes()))))
    }

    fn search(&self, _query: &str, _timeout: Duration) -> Result<Vec<TransferItem>, String> {
        Ok(Vec::new())
    }
}

struct OrderClient(Arc<OrderPeer>);

impl TransferClient for OrderClient {
    fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn PeerSession>, SessionError> {
        Ok(Arc::new(OrderSession(self.0.clone())))
    }
}

#[test]
fn requeued_expired_items_run_before_failed_ones() {
    let dir = make_tmp_dir("order");
    let peer = Arc::new(OrderPeer::default());
    let names = ["fail1.mp3", "expire1.mp3", "fine.mp3", "fail2.mp3", "expire2.mp3"];
    let items: Vec<TransferItem> =
        names.iter().map(|n| TransferItem::new("peer", format!("x\\{}", n), 4)).collect();
    let report = run_session(
        &OrderClient(peer.clone()),
        &FixedSelection::new(items),
        &creds(),
        FolderManager::new(&dir, "djt"),
        &options(1, 100, 1, 1),
    )
    .expect("session");
    assert_eq!(report.downloaded, 5);
    assert_eq!(report.rounds, 2);
    let opened = peer.opened.lock().expect("lock").clone();
    // limit 1 runs every round strictly in batch order
    assert_eq!(&opened[..5], &names[..]);
    assert_eq!(&opened[5..], &["expire1.mp3", "expire2.mp3", "fail1.mp3", "fail2.mp3"]);
    let _ = std::fs::remove_dir_all(&dir);
}
