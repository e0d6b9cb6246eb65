//! File-backed document store
//!
//! One pretty-printed JSON file per key inside a data directory. Reads take a
//! shared advisory lock and writes an exclusive one on a `<key>.lock` sidecar,
//! so separate processes sharing the directory do not interleave writes. A
//! write goes to a temporary file in the same directory which is flushed,
//! synced and renamed over the target: readers see either the old document or
//! the new one, never a torn write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::DocumentStore;
use crate::{Error, Result};

/// JSON documents stored as files in a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Storage(format!("failed to create data dir {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    fn paths(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::Storage(format!("invalid document key: {key:?}")));
        }
        Ok((self.dir.join(key), self.dir.join(format!("{key}.lock"))))
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let (path, lock_path) = self.paths(key)?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || read_document(&key, &path, &lock_path))
            .await
            .map_err(|e| Error::Storage(format!("read task failed: {e}")))?
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        let (path, lock_path) = self.paths(key)?;
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || write_document(&dir, &path, &lock_path, &bytes))
            .await
            .map_err(|e| Error::Storage(format!("write task failed: {e}")))?
    }
}

fn read_document(key: &str, path: &Path, lock_path: &Path) -> Result<Option<Value>> {
    let _lock = lock::acquire(open_lock_file(lock_path)?, false)
        .map_err(|e| Error::Storage(format!("failed to lock {}: {e}", lock_path.display())))?;

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "corrupt document, treating as empty");
            Ok(None)
        }
    }
}

fn write_document(dir: &Path, path: &Path, lock_path: &Path, bytes: &[u8]) -> Result<()> {
    let _lock = lock::acquire(open_lock_file(lock_path)?, true)
        .map_err(|e| Error::Storage(format!("failed to lock {}: {e}", lock_path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        Error::Storage(format!("failed to replace {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

fn open_lock_file(lock_path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| Error::Storage(format!("failed to open {}: {e}", lock_path.display())))
}

#[cfg(unix)]
mod lock {
    use std::fs::File;

    use nix::fcntl::{Flock, FlockArg};

    /// Held advisory lock, released on drop
    pub struct FileLock {
        _flock: Flock<File>,
    }

    pub fn acquire(file: File, exclusive: bool) -> std::io::Result<FileLock> {
        let arg = if exclusive {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockShared
        };
        Flock::lock(file, arg)
            .map(|flock| FileLock { _flock: flock })
            .map_err(|(_, errno)| std::io::Error::from(errno))
    }
}

#[cfg(not(unix))]
mod lock {
    use std::fs::File;

    /// Placeholder guard; advisory locks are unix-only
    pub struct FileLock {
        _file: File,
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn acquire(file: File, _exclusive: bool) -> std::io::Result<FileLock> {
        Ok(FileLock { _file: file })
    }
}
