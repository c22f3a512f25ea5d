//! Directory-backed peer.
//!
//! Serves a local directory (for example a synced copy of a friend's share) through
//! the same client interfaces a network peer would use. Remote paths use the
//! network's backslash convention relative to the mirror root.
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use walkdir::WalkDir;

use super::client::{ByteStream, CancelToken, Credentials, PeerSession, StreamEvent, TransferClient};
use super::item::TransferItem;
use crate::SessionError;

/// What the mirror advertises for every shared file.
#[derive(Debug, Clone)]
pub struct MirrorProfile {
    pub user: String,
    pub bitrate: Option<u32>,
    /// Advertised upload speed in bytes/s.
    pub speed: u64,
    pub slots: bool,
}

impl Default for MirrorProfile {
    fn default() -> Self {
        Self { user: "mirror".to_string(), bitrate: Some(320), speed: 1024 * 1024, slots: true }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorClient {
    root: PathBuf,
    profile: MirrorProfile,
    chunk_size: usize,
}

impl MirrorClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), profile: MirrorProfile::default(), chunk_size: 64 * 1024 }
    }

    pub fn with_profile(mut self, profile: MirrorProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl TransferClient for MirrorClient {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn PeerSession>, SessionError> {
        if !credentials.is_complete() {
            return Err(SessionError::Connection("missing username or password".to_string()));
        }
        if !self.root.is_dir() {
            return Err(SessionError::Connection(format!(
                "mirror root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(Arc::new(MirrorSession {
            root: self.root.clone(),
            profile: self.profile.clone(),
            chunk_size: self.chunk_size,
        }))
    }
}

struct MirrorSession {
    root: PathBuf,
    profile: MirrorProfile,
    chunk_size: usize,
}

impl MirrorSession {
    fn local_path(&self, remote: &str) -> Result<PathBuf, String> {
        let rel = PathBuf::from(remote.replace('\\', "/"));
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(format!("refusing path outside the share: {}", remote));
        }
        Ok(self.root.join(rel))
    }

    fn remote_path(&self, local: &Path) -> Option<String> {
        let rel = local.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> =
            rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
        Some(parts.join("\\"))
    }
}

impl PeerSession for MirrorSession {
    fn open_download_stream(
        &self,
        item: &TransferItem,
        cancel: CancelToken,
    ) -> Result<Box<dyn ByteStream>, String> {
        if item.user != self.profile.user {
            return Err(format!("unknown peer: {}", item.user));
        }
        let path = self.local_path(&item.file)?;
        let file = std::fs::File::open(&path).map_err(|e| format!("{}: {}", item.file, e))?;
        let (tx, rx) = bounded::<ReadMsg>(4);
        spawn_file_reader(file, tx, self.chunk_size);
        Ok(Box::new(MirrorStream { rx: Some(rx), cancel }))
    }

    fn search(&self, query: &str, timeout: Duration) -> Result<Vec<TransferItem>, String> {
        let words: Vec<String> = query.split_whitespace().map(|w| w.to_lowercase()).collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            if Instant::now() >= deadline {
                tracing::debug!("[mirror] search '{}' hit its {:?} budget", query, timeout);
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("[mirror] skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(remote) = self.remote_path(entry.path()) else { continue };
            let haystack = remote.to_lowercase();
            if !words.iter().all(|w| haystack.contains(w.as_str())) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            found.push(TransferItem {
                user: self.profile.user.clone(),
                file: remote,
                size,
                bitrate: self.profile.bitrate,
                speed: self.profile.speed,
                slots: self.profile.slots,
            });
        }
        Ok(found)
    }
}

/// Message sent from the reader thread to the stream.
enum ReadMsg {
    Data(Vec<u8>),
    Err(String),
    Eof,
}

/// Read `reader` in `chunk_size` pieces on a helper thread. The thread stops as soon
/// as the receiving side goes away.
fn spawn_file_reader<R: Read + Send + 'static>(
    mut reader: R,
    tx: Sender<ReadMsg>,
    chunk_size: usize,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            let mut buf = vec![0u8; chunk_size];
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(ReadMsg::Eof);
                    break;
                }
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send(ReadMsg::Data(buf)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReadMsg::Err(format!("reader error: {}", e)));
                    break;
                }
            }
        }
    })
}

struct MirrorStream {
    rx: Option<Receiver<ReadMsg>>,
    cancel: CancelToken,
}

impl ByteStream for MirrorStream {
    fn next_event(&mut self) -> StreamEvent {
        let Some(rx) = self.rx.as_ref() else {
            return StreamEvent::Error("stream cancelled".to_string());
        };
        select! {
            recv(rx) -> msg => match msg {
                Ok(ReadMsg::Data(buf)) => StreamEvent::Data(buf),
                Ok(ReadMsg::Eof) => StreamEvent::End,
                Ok(ReadMsg::Err(e)) => StreamEvent::Error(e),
                Err(_) => StreamEvent::Error("reader vanished".to_string()),
            },
            recv(self.cancel.signal()) -> _ => StreamEvent::Error("stream cancelled".to_string()),
        }
    }

    fn cancel(&mut self) {
        // dropping the receiver stops the reader thread at its next send
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_share() -> PathBuf {
        let mut base = std::env::temp_dir();
        let uniq = format!(
            "djt_mirror_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        base.push(uniq);
        std::fs::create_dir_all(base.join("Gesaffelstein")).expect("create share");
        std::fs::write(base.join("Gesaffelstein").join("Atmosphere.mp3"), b"0123456789")
            .expect("write track");
        std::fs::write(base.join("Gesaffelstein").join("Pursuit.flac"), b"abc").expect("write track");
        base
    }

    fn creds() -> Credentials {
        Credentials::new("dj", "secret")
    }

    #[test]
    fn search_matches_all_words_case_insensitive() {
        let share = make_share();
        let session = MirrorClient::new(&share).connect(&creds()).expect("connect");
        let hits = session.search("gesaffelstein ATMOSPHERE", Duration::from_secs(2)).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file, "Gesaffelstein\\Atmosphere.mp3");
        assert_eq!(hits[0].size, 10);
        assert_eq!(hits[0].bitrate, Some(320));
        assert!(session.search("   ", Duration::from_secs(1)).expect("search").is_empty());
        let _ = std::fs::remove_dir_all(&share);
    }

    #[test]
    fn stream_reads_whole_file_in_chunks() {
        let share = make_share();
        let session =
            MirrorClient::new(&share).with_chunk_size(4).connect(&creds()).expect("connect");
        let item = TransferItem::new("mirror", "Gesaffelstein\\Atmosphere.mp3", 10);
        let mut stream = session.open_download_stream(&item, CancelToken::new()).expect("open");
        let mut got = Vec::new();
        loop {
            match stream.next_event() {
                StreamEvent::Data(b) => {
                    assert!(b.len() <= 4);
                    got.extend(b);
                }
                StreamEvent::End => break,
                StreamEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(got, b"0123456789");
        let _ = std::fs::remove_dir_all(&share);
    }

    #[test]
    fn rejects_traversal_and_unknown_peer() {
        let share = make_share();
        let session = MirrorClient::new(&share).connect(&creds()).expect("connect");
        let escape = TransferItem::new("mirror", "..\\secret.txt", 1);
        assert!(session.open_download_stream(&escape, CancelToken::new()).is_err());
        let stranger = TransferItem::new("someone", "Gesaffelstein\\Atmosphere.mp3", 1);
        assert!(session.open_download_stream(&stranger, CancelToken::new()).is_err());
        let _ = std::fs::remove_dir_all(&share);
    }

    #[test]
    fn connect_requires_credentials_and_root() {
        let share = make_share();
        assert!(matches!(
            MirrorClient::new(&share).connect(&Credentials::new("", "")),
            Err(SessionError::Connection(_))
        ));
        assert!(matches!(
            MirrorClient::new(share.join("missing")).connect(&creds()),
            Err(SessionError::Connection(_))
        ));
        let _ = std::fs::remove_dir_all(&share);
    }

    #[test]
    fn cancelled_stream_reports_error() {
        let share = make_share();
        let session = MirrorClient::new(&share).connect(&creds()).expect("connect");
        let item = TransferItem::new("mirror", "Gesaffelstein\\Pursuit.flac", 3);
        let token = CancelToken::new();
        let mut stream = session.open_download_stream(&item, token.clone()).expect("open");
        stream.cancel();
        assert_eq!(stream.next_event(), StreamEvent::Error("stream cancelled".to_string()));
        let _ = std::fs::remove_dir_all(&share);
    }
}
