//! Persisted session facts.
//!
//! Only two things survive a restart: whether a connection previously
//! succeeded (the [`SessionRecord`]) and whether the user explicitly
//! disconnected. No keys, no signatures. The record only justifies
//! trying a silent restore.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Provenance;

const STATE_FILE: &str = "session.json";
const NAMESPACE: &str = "gmlink";

/// "A connection attempt previously succeeded."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub provenance: Provenance,
    /// Unix epoch milliseconds of the successful connect.
    pub connected_at: u64,
}

impl SessionRecord {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            provenance,
            connected_at: epoch_millis(),
        }
    }
}

/// Everything the store holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Set by an explicit user disconnect; blocks silent restore.
    #[serde(default)]
    pub explicitly_disconnected: bool,
    #[serde(default)]
    pub session: Option<SessionRecord>,
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("neither $XDG_STATE_HOME nor $HOME is set")]
    NoStateDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt session file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Client-local persistence for [`PersistedState`].
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, StoreError>;
    fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

/// JSON file under the per-user state directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store at `dir/session.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(STATE_FILE),
        }
    }

    /// Store in the default namespace directory.
    pub fn open_default() -> Result<Self, StoreError> {
        Ok(Self::in_dir(&default_state_dir()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            source: e,
        })
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let io_err = |path: &Path, source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let payload = serde_json::to_vec_pretty(state)?;
        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: std::sync::Mutex<PersistedState>,
}

#[cfg(test)]
impl MemorySessionStore {
    pub fn new(state: PersistedState) -> Self {
        Self {
            state: std::sync::Mutex::new(state),
        }
    }
}

#[cfg(test)]
impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        Ok(self
            .state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state.clone();
        }
        Ok(())
    }
}

/// `$XDG_STATE_HOME/gmlink`, falling back to `$HOME/.local/state/gmlink`.
pub fn default_state_dir() -> Result<PathBuf, StoreError> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir).join(NAMESPACE));
    }
    let home = std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .ok_or(StoreError::NoStateDir)?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("state")
        .join(NAMESPACE))
}

/// Current time as Unix epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
