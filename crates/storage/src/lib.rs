#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use in3_node_types::WatcherCheckpoint;
use tracing::warn;

const MAX_CHECKPOINT_FILE_BYTES: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to {action} checkpoint {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("checkpoint lock poisoned")]
    Poisoned,
}

/// Durable position of the event watcher.
pub trait CheckpointStore: Send + Sync {
    /// Last committed checkpoint, or the default when nothing usable is stored.
    fn load(&self) -> Result<WatcherCheckpoint, CheckpointError>;

    /// Persists `checkpoint` if it moves forward; returns whether it was written.
    fn save(&self, checkpoint: WatcherCheckpoint) -> Result<bool, CheckpointError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    current: Mutex<Option<WatcherCheckpoint>>,
    history: Mutex<Vec<WatcherCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint accepted so far, oldest first.
    pub fn history(&self) -> Result<Vec<WatcherCheckpoint>, CheckpointError> {
        Ok(self
            .history
            .lock()
            .map_err(|_| CheckpointError::Poisoned)?
            .clone())
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self) -> Result<WatcherCheckpoint, CheckpointError> {
        let current = self.current.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(current.unwrap_or_default())
    }

    fn save(&self, checkpoint: WatcherCheckpoint) -> Result<bool, CheckpointError> {
        let mut current = self.current.lock().map_err(|_| CheckpointError::Poisoned)?;
        if !advances(current.as_ref(), &checkpoint) {
            return Ok(false);
        }
        *current = Some(checkpoint);
        self.history
            .lock()
            .map_err(|_| CheckpointError::Poisoned)?
            .push(checkpoint);
        Ok(true)
    }
}

/// JSON checkpoint file replaced atomically on every save.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    current: Mutex<Option<WatcherCheckpoint>>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn read_file(&self) -> Result<Option<WatcherCheckpoint>, CheckpointError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    action: "inspect",
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if metadata.len() > MAX_CHECKPOINT_FILE_BYTES {
            warn!(
                path = %self.path.display(),
                size = metadata.len(),
                "checkpoint file is oversized, starting from default"
            );
            return Ok(None);
        }
        let raw = fs::read(&self.path).map_err(|source| CheckpointError::Io {
            action: "read",
            path: self.path.clone(),
            source,
        })?;
        match serde_json::from_slice::<WatcherCheckpoint>(&raw) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(error) => {
                warn!(
                    path = %self.path.display(),
                    %error,
                    "checkpoint file is corrupt, starting from default"
                );
                Ok(None)
            }
        }
    }

    fn write_file(&self, checkpoint: &WatcherCheckpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                action: "create directory for",
                path: self.path.clone(),
                source,
            })?;
        }
        let encoded = serde_json::to_vec(checkpoint)?;
        let temp = self.temp_path();
        let mut file = File::create(&temp).map_err(|source| CheckpointError::Io {
            action: "create",
            path: temp.clone(),
            source,
        })?;
        file.write_all(&encoded).map_err(|source| CheckpointError::Io {
            action: "write",
            path: temp.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| CheckpointError::Io {
            action: "fsync",
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, &self.path).map_err(|source| CheckpointError::Io {
            action: "rename",
            path: self.path.clone(),
            source,
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<WatcherCheckpoint, CheckpointError> {
        let mut current = self.current.lock().map_err(|_| CheckpointError::Poisoned)?;
        if current.is_none() {
            *current = self.read_file()?;
        }
        Ok(current.unwrap_or_default())
    }

    fn save(&self, checkpoint: WatcherCheckpoint) -> Result<bool, CheckpointError> {
        let mut current = self.current.lock().map_err(|_| CheckpointError::Poisoned)?;
        if current.is_none() {
            *current = self.read_file()?;
        }
        if !advances(current.as_ref(), &checkpoint) {
            return Ok(false);
        }
        self.write_file(&checkpoint)?;
        *current = Some(checkpoint);
        Ok(true)
    }
}

fn advances(stored: Option<&WatcherCheckpoint>, next: &WatcherCheckpoint) -> bool {
    stored.is_none_or(|stored| next.number > stored.number)
}
