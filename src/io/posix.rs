//! Local POSIX filesystem backend
//!
//! Positional reads go through `read_at` on plain file handles, optionally
//! cached across reads. Appends are true appends; `commit` fsyncs. This is
//! the only backend with advisory locking.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{FileLock, FsBackend};
use crate::config::Config;
use crate::error::{Result, StorageError};

pub struct PosixBackend {
    keep_file_handles_open: bool,
    disable_file_locking: bool,
    read_handles: Mutex<HashMap<String, Arc<std::fs::File>>>,
}

impl PosixBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            keep_file_handles_open: config.keep_file_handles_open,
            disable_file_locking: config.disable_file_locking,
            read_handles: Mutex::new(HashMap::new()),
        }
    }

    fn read_handle(&self, path: &str) -> Result<Arc<std::fs::File>> {
        if self.keep_file_handles_open {
            if let Some(handle) = self.read_handles.lock().get(path) {
                return Ok(handle.clone());
            }
        }
        let file = std::fs::File::open(path).map_err(|e| StorageError::io(path, e))?;
        let handle = Arc::new(file);
        if self.keep_file_handles_open {
            self.read_handles
                .lock()
                .insert(path.to_string(), handle.clone());
        }
        Ok(handle)
    }

    fn drop_read_handle(&self, path: &str) {
        self.read_handles.lock().remove(path);
    }
}

#[async_trait]
impl FsBackend for PosixBackend {
    async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(path, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        fs::remove_dir_all(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Ok(meta.len())
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        trace!("posix read {path} offset={offset} len={len}");
        let handle = self.read_handle(path)?;
        let owned_path = path.to_string();
        let buf = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = handle
                    .read_at(&mut buf[filled..], offset + filled as u64)
                    .map_err(|e| StorageError::io(&owned_path, e))?;
                if n == 0 {
                    return Err(StorageError::io(
                        &owned_path,
                        format!("short read: wanted {len} bytes at offset {offset}"),
                    ));
                }
                filled += n;
            }
            Ok(buf)
        })
        .await
        .map_err(|e| StorageError::io(path, e))??;
        Ok(Bytes::from(buf))
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }

    async fn commit(&self, path: &str) -> Result<()> {
        // Appends are already visible; commit makes them durable.
        let file = fs::File::open(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.drop_read_handle(path);
        fs::remove_file(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        self.drop_read_handle(from);
        fs::rename(from, to)
            .await
            .map_err(|e| StorageError::io(from, e))
    }

    fn supports_locking(&self) -> bool {
        !self.disable_file_locking
    }

    async fn acquire_lock(&self, path: &str, exclusive: bool) -> Result<Option<FileLock>> {
        if self.disable_file_locking {
            return Ok(None);
        }
        let owned_path = path.to_string();
        let lock = tokio::task::spawn_blocking(move || -> Result<FileLock> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&owned_path)
                .map_err(|e| StorageError::io(&owned_path, e))?;
            if exclusive {
                file.lock().map_err(|e| StorageError::io(&owned_path, e))?;
            } else {
                file.lock_shared()
                    .map_err(|e| StorageError::io(&owned_path, e))?;
            }
            Ok(FileLock::new(file))
        })
        .await
        .map_err(|e| StorageError::io(path, e))??;
        Ok(Some(lock))
    }
}
