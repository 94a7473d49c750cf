//! Per-host browser session state and login suspension tokens.
//!
//! Sessions are produced out of band (`jobtrail auth import`) and stored as
//! `<sessions_dir>/<host>.json`. Reads of a cached, unexpired session take no
//! lock; loading or replacing a host's session is serialized per host.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Authenticated state for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub host: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(host: impl Into<String>, cookies: Vec<Cookie>) -> Self {
        Self {
            host: host.into(),
            cookies,
            user_agent: None,
            saved_at: Utc::now(),
        }
    }

    /// Value for a `Cookie` request header.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(ttl) = ttl else { return false };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => self.saved_at + ttl < now,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What `auth status` reports for a host.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub host: String,
    pub path: PathBuf,
    pub present: bool,
    pub expired: bool,
    pub saved_at: Option<DateTime<Utc>>,
    pub cookies: usize,
}

pub struct SessionManager {
    dir: PathBuf,
    ttl: Option<Duration>,
    cache: DashMap<String, Arc<SessionState>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn state_path_for(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{}.json", host.replace(':', "_")))
    }

    fn host_lock(&self, host: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cached session for `host`, if present and unexpired.
    pub fn cached(&self, host: &str) -> Option<Arc<SessionState>> {
        let state = self.cache.get(host)?.clone();
        (!state.is_expired(self.ttl, Utc::now())).then_some(state)
    }

    /// Session for `host` from the cache, else from disk.
    ///
    /// A missing, unreadable or expired session file yields `None`.
    pub async fn acquire(&self, host: &str) -> Option<Arc<SessionState>> {
        if let Some(state) = self.cached(host) {
            return Some(state);
        }

        let lock = self.host_lock(host);
        let _guard = lock.lock().await;
        if let Some(state) = self.cached(host) {
            return Some(state);
        }

        let path = self.state_path_for(host);
        let state = match load_state(&path).await {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(host, error = %e, "ignoring unreadable session file");
                return None;
            }
        };
        if state.is_expired(self.ttl, Utc::now()) {
            tracing::info!(host, saved_at = %state.saved_at, "stored session has expired");
            return None;
        }

        let state = Arc::new(state);
        self.cache.insert(host.to_string(), state.clone());
        tracing::debug!(host, "loaded session from disk");
        Some(state)
    }

    /// Persist a session obtained out of band and make it current.
    pub async fn import(&self, host: &str, mut state: SessionState) -> Result<PathBuf, SessionError> {
        let lock = self.host_lock(host);
        let _guard = lock.lock().await;

        state.host = host.to_string();
        let path = self.state_path_for(host);
        save_state(&path, &state).await?;
        self.cache.insert(host.to_string(), Arc::new(state));
        tracing::info!(host, path = %path.display(), "imported session");
        Ok(path)
    }

    /// Forget the cached session of `host`; the file on disk is kept.
    pub fn invalidate(&self, host: &str) {
        self.cache.remove(host);
    }

    pub async fn status(&self, host: &str) -> Result<SessionStatus, SessionError> {
        let path = self.state_path_for(host);
        let state = load_state(&path).await?;
        Ok(SessionStatus {
            host: host.to_string(),
            present: state.is_some(),
            expired: state
                .as_ref()
                .is_some_and(|s| s.is_expired(self.ttl, Utc::now())),
            saved_at: state.as_ref().map(|s| s.saved_at),
            cookies: state.as_ref().map_or(0, |s| s.cookies.len()),
            path,
        })
    }
}

async fn load_state(path: &Path) -> Result<Option<SessionState>, SessionError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SessionError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| SessionError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

async fn save_state(path: &Path, state: &SessionState) -> Result<(), SessionError> {
    let io_err = |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(state).map_err(|source| SessionError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// Opaque token handed to the caller when a run stops for manual login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub run_id: String,
    pub url: String,
    pub host: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ResumeTokenError {
    #[error("resume token is not hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("resume token payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ResumeToken {
    pub fn new(run_id: &str, url: &str, host: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            url: url.to_string(),
            host: host.to_string(),
            issued_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> String {
        // A struct of strings and a timestamp always serializes.
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(token: &str) -> Result<Self, ResumeTokenError> {
        let bytes = hex::decode(token.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
