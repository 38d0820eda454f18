use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use bridgedeck_core::{InstanceId, StatusSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::lock;

/// `client_state.json` holds three small values; anything larger is corrupt.
pub const MAX_CLIENT_STATE_BYTES: u64 = 64 * 1024;
pub const CLIENT_STATE_FILE: &str = "client_state.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedClientState {
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub current_instance: Option<InstanceId>,
    #[serde(default)]
    pub instance_status: Option<StatusSnapshot>,
}

#[derive(Debug, Error)]
pub enum ClientStateLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClientStateSaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn client_state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CLIENT_STATE_FILE)
}

pub fn load_client_state_from_path(path: &Path) -> Result<PersistedClientState, ClientStateLoadError> {
    let meta = fs::metadata(path).map_err(ClientStateLoadError::Metadata)?;
    if meta.len() > MAX_CLIENT_STATE_BYTES {
        return Err(ClientStateLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CLIENT_STATE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ClientStateLoadError::Read)?;
    serde_json::from_str(&data).map_err(ClientStateLoadError::Parse)
}

pub fn save_client_state_to_path(
    path: &Path,
    state: &PersistedClientState,
) -> Result<(), ClientStateSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(state).map_err(ClientStateSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ClientStateSaveError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(ClientStateSaveError::Rename)?;
    Ok(())
}

pub fn save_client_state_with_retry(
    path: &Path,
    state: &PersistedClientState,
) -> Result<(), ClientStateSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_client_state_to_path(path, state) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                debug!(attempt, path = %path.display(), "client state save failed: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

/// Small key-value client state, optionally mirrored to disk. Inside a
/// tokio runtime the file is written on the blocking pool.
#[derive(Debug)]
pub struct ClientStateStore {
    path: Option<PathBuf>,
    state: Arc<Mutex<PersistedClientState>>,
    /// Serializes file writes; each write saves the latest state.
    writer: Arc<Mutex<()>>,
}

impl ClientStateStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Arc::new(Mutex::new(PersistedClientState::default())),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Missing files start empty; unreadable ones are logged and replaced on
    /// the next write.
    pub fn open(path: PathBuf) -> Self {
        let state = match load_client_state_from_path(&path) {
            Ok(state) => state,
            Err(ClientStateLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
                PersistedClientState::default()
            }
            Err(err) => {
                warn!(path = %path.display(), "ignoring saved client state: {err}");
                PersistedClientState::default()
            }
        };

        if let Some(parent) = path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), "failed to create state directory: {err}");
        }

        Self {
            path: Some(path),
            state: Arc::new(Mutex::new(state)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> PersistedClientState {
        lock(&self.state).clone()
    }

    /// Applies `mutate` and writes the file only when something changed.
    /// Returns whether the state changed.
    pub fn update(&self, mutate: impl FnOnce(&mut PersistedClientState)) -> bool {
        {
            let mut guard = lock(&self.state);
            let before = guard.clone();
            mutate(&mut *guard);
            if *guard == before {
                return false;
            }
        }

        if let Some(path) = &self.path {
            self.persist(path.clone());
        }
        true
    }

    fn persist(&self, path: PathBuf) {
        let state = self.state.clone();
        let writer = self.writer.clone();
        let write = move || {
            let _writing = lock(&writer);
            let latest = lock(&state).clone();
            if let Err(err) = save_client_state_with_retry(&path, &latest) {
                warn!(path = %path.display(), "failed to persist client state: {err}");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}
