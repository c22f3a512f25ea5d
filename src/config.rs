use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SessionError;
use crate::selection::DEFAULT_SEARCH_DURATION;
use crate::transfer::{
    Credentials, DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_MAX_DOWNLOAD_TIME, DEFAULT_MAX_EXPIRE_RETRIES,
    DEFAULT_MAX_FAIL_RETRIES, SessionOptions,
};

pub const USERNAME_ENV: &str = "DJ_TOOLS_USERNAME";
pub const PASSWORD_ENV: &str = "DJ_TOOLS_PASSWORD";

/// Tunables read from an optional JSON file. Missing keys keep their defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub download_concurrency: usize,
    pub search_duration_ms: u64,
    pub max_download_time_secs: u64,
    pub max_expire_retries: u32,
    pub max_fail_retries: u32,
    /// Where session folders are created; the working directory when unset.
    pub download_base: Option<PathBuf>,
    pub username: Option<String>,
    // 明文存储，优先使用环境变量
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            search_duration_ms: DEFAULT_SEARCH_DURATION.as_millis() as u64,
            max_download_time_secs: DEFAULT_MAX_DOWNLOAD_TIME.as_secs(),
            max_expire_retries: DEFAULT_MAX_EXPIRE_RETRIES,
            max_fail_retries: DEFAULT_MAX_FAIL_RETRIES,
            download_base: None,
            username: None,
            password: None,
        }
    }
}

impl Settings {
    /// Read settings from `path`. The file is never written back.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))
    }

    /// `load(path)` when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SessionError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn search_duration(&self) -> Duration {
        Duration::from_millis(self.search_duration_ms)
    }

    pub fn session_options(&self, show_progress: bool) -> SessionOptions {
        SessionOptions {
            download_concurrency: self.download_concurrency,
            max_download_time: Duration::from_secs(self.max_download_time_secs),
            max_expire_retries: self.max_expire_retries,
            max_fail_retries: self.max_fail_retries,
            show_progress,
        }
    }

    /// Resolve credentials: explicit values win over the environment, which wins
    /// over the settings file. `env` is injected so callers and tests control it.
    pub fn credentials(
        &self,
        username: Option<String>,
        password: Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Credentials, SessionError> {
        let pick = |flag: Option<String>, key: &str, file: &Option<String>| {
            flag.filter(|v| !v.is_empty())
                .or_else(|| env(key).filter(|v| !v.is_empty()))
                .or_else(|| file.clone().filter(|v| !v.is_empty()))
        };
        let user = pick(username, USERNAME_ENV, &self.username);
        let pass = pick(password, PASSWORD_ENV, &self.password);
        match (user, pass) {
            (Some(u), Some(p)) => Ok(Credentials::new(u, p)),
            _ => Err(SessionError::Config(format!(
                "missing credentials: pass --username/--password or set {} and {}",
                USERNAME_ENV, PASSWORD_ENV
            ))),
        }
    }
}

/// Process environment lookup for [`Settings::credentials`].
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
