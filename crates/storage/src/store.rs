//! Snapshot store abstraction and JSON implementation.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored snapshot exists but cannot be read back
    #[error("store {path} is corrupt: {source}")]
    Corrupt {
        /// Store location
        path: PathBuf,
        /// Parse failure
        source: serde_json::Error,
    },

    /// Another process holds the store lock
    #[error("workflow is locked: {0} is in use by another process")]
    Locked(PathBuf),
}

/// Whole-state persistence: one snapshot, replaced on every save.
#[async_trait]
pub trait Storage<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Load the last saved snapshot, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<T>>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &T) -> Result<()>;

    /// Discard the stored snapshot.
    async fn reset(&self) -> Result<()>;

    /// Where the snapshot lives.
    fn location(&self) -> &Path;
}

/// Single-file JSON store.
///
/// Saves write a sibling temporary file, sync it, then rename it over the
/// store, so readers only ever see a complete snapshot.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store at `path`. Nothing is touched until the first save.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl<T> Storage<T> for JsonStore
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> Result<Option<T>> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    async fn save(&self, snapshot: &T) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = json.len(), "saved snapshot");
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                warn!(path = %self.path.display(), "discarded stored snapshot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> &Path {
        &self.path
    }
}
