//! Scripted in-memory peer for tests and dry runs.
//!
//! Each item gets a queue of [`Behavior`]s, one per attempt; the last one repeats
//! once the queue runs dry. The peer counts connects, attempts per item and the
//! peak number of simultaneously open streams.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::select;

use super::client::{ByteStream, CancelToken, Credentials, PeerSession, StreamEvent, TransferClient};
use super::item::{ItemId, TransferItem};
use crate::SessionError;

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Stream the bytes, then end.
    Deliver(Vec<u8>),
    /// Stream the bytes, then report an error.
    FailAfter(Vec<u8>, String),
    /// Refuse to open the stream.
    Refuse(String),
    /// Open, then never produce anything until cancelled.
    Stall,
    /// Wait before the first chunk (cut short by cancellation), then deliver.
    SlowDeliver(Duration, Vec<u8>),
    /// Panic while opening the stream.
    Panic(String),
}

#[derive(Default)]
struct PeerState {
    scripts: Mutex<HashMap<ItemId, VecDeque<Behavior>>>,
    attempts: Mutex<HashMap<ItemId, usize>>,
    search_results: Mutex<HashMap<String, Vec<TransferItem>>>,
    connect_error: Mutex<Option<String>>,
    chunk_delay: Mutex<Duration>,
    connects: AtomicUsize,
    open: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedPeer {
    state: Arc<PeerState>,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviours for successive attempts of `item`.
    pub fn script(&self, item: &TransferItem, behaviors: impl IntoIterator<Item = Behavior>) {
        if let Ok(mut scripts) = self.state.scripts.lock() {
            scripts.entry(item.id()).or_default().extend(behaviors);
        }
    }

    pub fn fail_connect(&self, message: impl Into<String>) {
        if let Ok(mut slot) = self.state.connect_error.lock() {
            *slot = Some(message.into());
        }
    }

    /// Pause before every data chunk; the pause itself honours cancellation.
    pub fn set_chunk_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.state.chunk_delay.lock() {
            *slot = delay;
        }
    }

    pub fn add_search_results(&self, query: &str, results: Vec<TransferItem>) {
        if let Ok(mut map) = self.state.search_results.lock() {
            map.insert(query.to_string(), results);
        }
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, item: &TransferItem) -> usize {
        self.state.attempts.lock().ok().and_then(|m| m.get(&item.id()).copied()).unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.state.attempts.lock().map(|m| m.values().sum()).unwrap_or(0)
    }

    /// Highest number of streams that were open at the same time.
    pub fn peak_open_streams(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Session handle without going through `connect`.
    pub fn session(&self) -> Arc<dyn PeerSession> {
        Arc::new(ScriptedSession { state: self.state.clone() })
    }
}

impl TransferClient for ScriptedPeer {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn PeerSession>, SessionError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self.state.connect_error.lock().ok().and_then(|g| g.clone());
        if let Some(msg) = refused {
            return Err(SessionError::Connection(msg));
        }
        if !credentials.is_complete() {
            return Err(SessionError::Connection("missing username or password".to_string()));
        }
        Ok(self.session())
    }
}

struct ScriptedSession {
    state: Arc<PeerState>,
}

impl ScriptedSession {
    fn next_behavior(&self, item: &TransferItem) -> Behavior {
        let id = item.id();
        if let Ok(mut attempts) = self.state.attempts.lock() {
            *attempts.entry(id.clone()).or_insert(0) += 1;
        }
        let mut scripts = match self.state.scripts.lock() {
            Ok(s) => s,
            Err(_) => return Behavior::Refuse("script state poisoned".to_string()),
        };
        match scripts.get_mut(&id) {
            Some(queue) if queue.len() > 1 => {
                queue.pop_front().unwrap_or(Behavior::Refuse("empty script".to_string()))
            }
            Some(queue) => {
                queue.front().cloned().unwrap_or(Behavior::Refuse("empty script".to_string()))
            }
            None => Behavior::Deliver(item.file.as_bytes().to_vec()),
        }
    }
}

impl PeerSession for ScriptedSession {
    fn open_download_stream(
        &self,
        item: &TransferItem,
        cancel: CancelToken,
    ) -> Result<Box<dyn ByteStream>, String> {
        let behavior = self.next_behavior(item);
        let delay = self.state.chunk_delay.lock().map(|d| *d).unwrap_or_default();
        let (data, tail, pre_delay) = match behavior {
            Behavior::Refuse(msg) => return Err(msg),
            Behavior::Panic(msg) => panic!("{}", msg),
            Behavior::Deliver(data) => (data, Tail::End, None),
            Behavior::FailAfter(data, msg) => (data, Tail::Error(msg), None),
            Behavior::Stall => (Vec::new(), Tail::Stall, None),
            Behavior::SlowDeliver(wait, data) => (data, Tail::End, Some(wait)),
        };
        let guard = OpenGuard::new(self.state.clone());
        Ok(Box::new(ScriptedStream {
            chunks: data.chunks(CHUNK).map(|c| c.to_vec()).collect(),
            tail,
            pre_delay,
            delay,
            cancel,
            _guard: guard,
        }))
    }

    fn search(&self, query: &str, _timeout: Duration) -> Result<Vec<TransferItem>, String> {
        let map = self.state.search_results.lock().map_err(|_| "search state poisoned".to_string())?;
        Ok(map.get(query).cloned().unwrap_or_default())
    }
}

enum Tail {
    End,
    Error(String),
    Stall,
}

struct ScriptedStream {
    chunks: VecDeque<Vec<u8>>,
    tail: Tail,
    pre_delay: Option<Duration>,
    delay: Duration,
    cancel: CancelToken,
    _guard: OpenGuard,
}

impl ByteStream for ScriptedStream {
    fn next_event(&mut self) -> StreamEvent {
        if let Some(wait) = self.pre_delay.take() {
            select! {
                recv(self.cancel.signal()) -> _ => return StreamEvent::Error("cancelled".to_string()),
                default(wait) => {}
            }
        }
        if let Some(chunk) = self.chunks.pop_front() {
            if !self.delay.is_zero() {
                select! {
                    recv(self.cancel.signal()) -> _ => return StreamEvent::Error("cancelled".to_string()),
                    default(self.delay) => {}
                }
            }
            return StreamEvent::Data(chunk);
        }
        match &self.tail {
            Tail::End => StreamEvent::End,
            Tail::Error(msg) => StreamEvent::Error(msg.clone()),
            Tail::Stall => {
                // blocks until the token disconnects the signal channel
                let _ = self.cancel.signal().recv();
                StreamEvent::Error("cancelled".to_string())
            }
        }
    }

    fn cancel(&mut self) {
        self.chunks.clear();
        self.tail = Tail::Error("cancelled".to_string());
    }
}

struct OpenGuard {
    state: Arc<PeerState>,
}

impl OpenGuard {
    fn new(state: Arc<PeerState>) -> Self {
        let now = state.open.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}
