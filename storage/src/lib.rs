//! The durable snapshot store.
//!
//! The server treats persistence as `load` once at boot plus `save` after
//! any mutation. Save failures are reported to the caller, which logs them
//! and keeps serving; nothing in the request path waits on durability.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tumble_core::error::{Error, Result};
use tumble_core::state::Snapshot;
use tumble_env::StoreConfig;

#[async_trait]
pub trait StorageT: Send + Sync {
    /// Load the full snapshot, or a fresh one when none was persisted yet.
    async fn load(&self) -> Result<Snapshot>;

    /// Replace the durable copy with the given snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// JSON file on disk. Writes go to a temp file first and are renamed over
/// the previous copy so a crash never leaves a torn snapshot.
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            path: config.data_dir.join(&config.data_file),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl StorageT for FileStorage {
    async fn load(&self) -> Result<Snapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::StorageError(e.to_string()))?;
                info!(
                    "Loaded snapshot from {:?}, {} sessions",
                    self.path,
                    snapshot.multiplayer_sessions.len()
                );
                Ok(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {:?}, starting fresh", self.path);
                Ok(Snapshot::new())
            }
            Err(e) => Err(Error::StorageError(e.to_string())),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::StorageError(e.to_string()))?;
        }
        let bytes =
            serde_json::to_vec(snapshot).map_err(|e| Error::StorageError(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and the `memory` backend.
#[derive(Default)]
pub struct MemStorage {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageT for MemStorage {
    async fn load(&self) -> Result<Snapshot> {
        Ok(self
            .snapshot
            .lock()
            .await
            .clone()
            .unwrap_or_else(Snapshot::new))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

/// Build the backend named by the config, falling back to `file`.
pub fn create_storage(config: &StoreConfig) -> Arc<dyn StorageT> {
    match config.backend.as_str() {
        "memory" => Arc::new(MemStorage::new()),
        "file" => Arc::new(FileStorage::new(config)),
        other => {
            warn!("Unknown store backend {:?}, using file", other);
            Arc::new(FileStorage::new(config))
        }
    }
}
