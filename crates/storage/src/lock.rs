//! Process-level exclusive lock on a store.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::store::{Result, StoreError};

/// Exclusive advisory lock on `<store>.lock`, held until dropped.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Lock the store at `store`, failing with [`StoreError::Locked`] if
    /// another process holds it.
    pub fn acquire(store: impl AsRef<Path>) -> Result<Self> {
        let store = store.as_ref();
        let mut name = store.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let path = store.with_file_name(name);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|e| {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                StoreError::Locked(store.to_path_buf())
            } else {
                StoreError::Io(e)
            }
        })?;

        debug!(path = %path.display(), "acquired store lock");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
