/// Session-level errors. Any of these aborts the whole download session and is
/// returned to the caller unwrapped; per-item transfer problems never end up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Invalid concurrency / timeout configuration, raised before any work starts.
    Config(String),
    /// Remote session could not be established (authentication or network).
    Connection(String),
    /// Download folder or file could not be created.
    Storage { path: std::path::PathBuf, message: String },
    /// The selection collaborator could not produce a track list.
    Selection(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            SessionError::Connection(msg) => write!(f, "could not connect to peer network: {}", msg),
            SessionError::Storage { path, message } => {
                write!(f, "storage error at {}: {}", display_path(path), message)
            }
            SessionError::Selection(msg) => write!(f, "track selection failed: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    pub fn storage(path: impl Into<std::path::PathBuf>, err: impl std::fmt::Display) -> Self {
        SessionError::Storage { path: path.into(), message: err.to_string() }
    }

    /// Short machine-readable tag, used in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Config(_) => "config",
            SessionError::Connection(_) => "connection",
            SessionError::Storage { .. } => "storage",
            SessionError::Selection(_) => "selection",
        }
    }
}

fn display_path(p: &std::path::Path) -> String {
    let s = p.to_string_lossy().to_string();
    if s.contains('\\') { s.replace('\\', "/") } else { s }
}

/// Why a single transfer attempt failed. Always recoverable at the session level:
/// the classifier decides whether the item is retried or abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// The peer refused or could not open the download stream.
    OpenFailed(String),
    /// The stream reported an error mid-transfer.
    Stream(String),
    /// Writing the local file failed.
    LocalIo(String),
    /// The attempt itself blew up (programmer error), caught by the scheduler.
    Panicked(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::OpenFailed(msg) => write!(f, "open stream failed: {}", msg),
            AttemptError::Stream(msg) => write!(f, "stream error: {}", msg),
            AttemptError::LocalIo(msg) => write!(f, "local io error: {}", msg),
            AttemptError::Panicked(msg) => write!(f, "attempt panicked: {}", msg),
        }
    }
}

impl std::error::Error for AttemptError {}
