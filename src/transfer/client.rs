use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

use super::item::TransferItem;
use crate::SessionError;

/// Login for the peer network.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Single-winner race between a running transfer and its deadline.
///
/// Exactly one of `cancel()` (deadline side) and `try_commit()` (transfer side)
/// succeeds. `signal()` never yields a message; it disconnects once the token is
/// cancelled, so blocking stream implementations can `select!` on it next to
/// their data channel.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

const OPEN: u8 = 0;
const COMMITTED: u8 = 1;
const CANCELLED: u8 = 2;

struct CancelInner {
    state: AtomicU8,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(CancelInner {
                state: AtomicU8::new(OPEN),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    /// Cancel the transfer. Returns false if the transfer already committed its
    /// result, in which case nothing is signalled.
    pub fn cancel(&self) -> bool {
        match self.inner.state.compare_exchange(OPEN, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) | Err(CANCELLED) => {
                if let Ok(mut slot) = self.inner.trigger.lock() {
                    slot.take();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Claim the right to publish a result. Returns false once cancelled.
    pub fn try_commit(&self) -> bool {
        matches!(
            self.inner.state.compare_exchange(OPEN, COMMITTED, Ordering::SeqCst, Ordering::SeqCst),
            Ok(_) | Err(COMMITTED)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == CANCELLED
    }

    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// One step of a download stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Vec<u8>),
    End,
    Error(String),
}

/// Incoming file data from a peer. Implementations must honour the
/// [`CancelToken`] handed to `open_download_stream`: once it fires, `next_event`
/// should return promptly (an `Error` is fine) instead of waiting for more data.
pub trait ByteStream: Send {
    fn next_event(&mut self) -> StreamEvent;
    /// Tear down the stream; further events are irrelevant.
    fn cancel(&mut self);
}

/// An authenticated connection to the peer network, shared by all workers.
pub trait PeerSession: Send + Sync {
    fn open_download_stream(
        &self,
        item: &TransferItem,
        cancel: CancelToken,
    ) -> Result<Box<dyn ByteStream>, String>;

    /// Search the network; results trickle in for `timeout`. Only the selection
    /// step calls this.
    fn search(&self, query: &str, timeout: Duration) -> Result<Vec<TransferItem>, String>;
}

/// Entry point to the peer network.
pub trait TransferClient {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn PeerSession>, SessionError>;
}
