use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::SessionError;

/// Session-scoped download folder: `<base>/<namespace>-downloads/<YYYY-MM-DD>-<unix secs>`.
///
/// The path is computed and created on the first `resolve()`; later calls hand back
/// the memoized path without touching storage.
#[derive(Debug)]
pub struct FolderManager {
    base: PathBuf,
    namespace: String,
    resolved: Mutex<Option<PathBuf>>,
}

impl FolderManager {
    pub fn new(base: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self { base: base.into(), namespace: namespace.into(), resolved: Mutex::new(None) }
    }

    /// Folder manager rooted at the current working directory, namespaced by package name.
    pub fn in_current_dir() -> Result<Self, SessionError> {
        let cwd = std::env::current_dir().map_err(|e| SessionError::storage(".", e))?;
        Ok(Self::new(cwd, env!("CARGO_PKG_NAME")))
    }

    pub fn resolve(&self) -> Result<PathBuf, SessionError> {
        self.resolve_at(Utc::now())
    }

    pub(crate) fn resolve_at(&self, now: DateTime<Utc>) -> Result<PathBuf, SessionError> {
        let mut slot = self
            .resolved
            .lock()
            .map_err(|_| SessionError::storage(&self.base, "folder state poisoned"))?;
        if let Some(p) = slot.as_ref() {
            return Ok(p.clone());
        }
        let dir = folder_path(&self.base, &self.namespace, now);
        std::fs::create_dir_all(&dir).map_err(|e| SessionError::storage(&dir, e))?;
        tracing::debug!("[folder] created download folder {}", dir.display());
        *slot = Some(dir.clone());
        Ok(dir)
    }

    /// Memoized path, if `resolve` already ran.
    pub fn current(&self) -> Option<PathBuf> {
        self.resolved.lock().ok().and_then(|g| g.clone())
    }
}

pub fn folder_path(base: &Path, namespace: &str, now: DateTime<Utc>) -> PathBuf {
    let name = format!("{}-{}", now.format("%Y-%m-%d"), now.timestamp());
    base.join(format!("{}-downloads", namespace)).join(name)
}
