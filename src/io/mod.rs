//! Virtual filesystem: one capability set over pluggable storage backends
//!
//! The engine sees a single byte-range contract. POSIX paths get true
//! positional reads and appends; object stores emulate directories with
//! marker objects and buffer appends until `commit` issues the block-list
//! commit. Backends are small variant types behind [`FsBackend`], shared
//! per authority through the [`Vfs`] registry for the life of a context.

pub mod object;
pub mod posix;
pub mod uri;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, StorageError};
use uri::{parse_uri, ParsedUri};

/// Advisory lock holder; dropping it releases the lock.
pub struct FileLock {
    _file: Option<std::fs::File>,
}

impl FileLock {
    pub(crate) fn new(file: std::fs::File) -> Self {
        Self { _file: Some(file) }
    }
}

/// The capability set every storage backend implements.
#[async_trait]
pub trait FsBackend: Send + Sync {
    /// Existence and kind; on object stores a directory is a common prefix
    /// or a marker object.
    async fn is_dir(&self, path: &str) -> Result<bool>;

    async fn is_file(&self, path: &str) -> Result<bool>;

    /// Names of the immediate children of a directory.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Idempotent directory creation.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Recursive directory removal.
    async fn delete_dir(&self, path: &str) -> Result<()>;

    async fn file_size(&self, path: &str) -> Result<u64>;

    /// Positional read of exactly `len` bytes.
    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes>;

    /// Append-only write; object stores may buffer until `commit`.
    async fn append(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Make pending appends durable and visible.
    async fn commit(&self, path: &str) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Rename within one backend.
    async fn move_path(&self, from: &str, to: &str) -> Result<()>;

    /// Advisory lock capability; true only for local POSIX.
    fn supports_locking(&self) -> bool;

    /// Take an advisory lock on `path`; `None` when the backend has no
    /// locking or it is disabled.
    async fn acquire_lock(&self, path: &str, exclusive: bool) -> Result<Option<FileLock>>;
}

/// Backend registry and URI dispatch for one context.
pub struct Vfs {
    config: Config,
    posix: Arc<posix::PosixBackend>,
    stores: Mutex<HashMap<String, Arc<dyn FsBackend>>>,
}

impl Vfs {
    pub fn new(config: Config) -> Self {
        let posix = Arc::new(posix::PosixBackend::new(&config));
        Self {
            config,
            posix,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a URI to its backend and backend-local path.
    fn resolve(&self, uri: &str) -> Result<(Arc<dyn FsBackend>, String)> {
        let parsed = parse_uri(uri)?;
        match &parsed {
            ParsedUri::File { path } => {
                let backend: Arc<dyn FsBackend> = self.posix.clone();
                Ok((backend, path.clone()))
            }
            _ => {
                let key = parsed.authority_key();
                let path = parsed.path().to_string();
                if let Some(backend) = self.stores.lock().get(&key) {
                    return Ok((backend.clone(), path));
                }
                let backend: Arc<dyn FsBackend> =
                    Arc::new(object::ObjectBackend::connect(&parsed, &self.config)?);
                self.stores.lock().insert(key, backend.clone());
                Ok((backend, path))
            }
        }
    }

    pub async fn is_dir(&self, uri: &str) -> Result<bool> {
        let (backend, path) = self.resolve(uri)?;
        backend.is_dir(&path).await
    }

    pub async fn is_file(&self, uri: &str) -> Result<bool> {
        let (backend, path) = self.resolve(uri)?;
        backend.is_file(&path).await
    }

    pub async fn list(&self, uri: &str) -> Result<Vec<String>> {
        let (backend, path) = self.resolve(uri)?;
        backend.list(&path).await
    }

    pub async fn create_dir(&self, uri: &str) -> Result<()> {
        let (backend, path) = self.resolve(uri)?;
        backend.create_dir(&path).await
    }

    pub async fn delete_dir(&self, uri: &str) -> Result<()> {
        let (backend, path) = self.resolve(uri)?;
        backend.delete_dir(&path).await
    }

    pub async fn file_size(&self, uri: &str) -> Result<u64> {
        let (backend, path) = self.resolve(uri)?;
        backend.file_size(&path).await
    }

    pub async fn read(&self, uri: &str, offset: u64, len: usize) -> Result<Bytes> {
        let (backend, path) = self.resolve(uri)?;
        backend.read(&path, offset, len).await
    }

    /// Read a whole file.
    pub async fn read_full(&self, uri: &str) -> Result<Bytes> {
        let (backend, path) = self.resolve(uri)?;
        let size = backend.file_size(&path).await?;
        backend.read(&path, 0, size as usize).await
    }

    pub async fn append(&self, uri: &str, data: &[u8]) -> Result<()> {
        let (backend, path) = self.resolve(uri)?;
        backend.append(&path, data).await
    }

    pub async fn commit(&self, uri: &str) -> Result<()> {
        let (backend, path) = self.resolve(uri)?;
        backend.commit(&path).await
    }

    /// Append and commit in one step, for small whole files.
    pub async fn write_file(&self, uri: &str, data: &[u8]) -> Result<()> {
        let (backend, path) = self.resolve(uri)?;
        backend.append(&path, data).await?;
        backend.commit(&path).await
    }

    pub async fn delete_file(&self, uri: &str) -> Result<()> {
        let (backend, path) = self.resolve(uri)?;
        backend.delete_file(&path).await
    }

    /// Rename; moving between different backends is not implemented.
    pub async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let from_parsed = parse_uri(from)?;
        let to_parsed = parse_uri(to)?;
        if from_parsed.authority_key() != to_parsed.authority_key() {
            return Err(StorageError::Unsupported(
                "move across filesystems is not supported".to_string(),
            ));
        }
        let (backend, from_path) = self.resolve(from)?;
        backend.move_path(&from_path, to_parsed.path()).await
    }

    pub async fn supports_locking(&self, uri: &str) -> Result<bool> {
        let (backend, _) = self.resolve(uri)?;
        Ok(backend.supports_locking())
    }

    pub async fn acquire_lock(&self, uri: &str, exclusive: bool) -> Result<Option<FileLock>> {
        let (backend, path) = self.resolve(uri)?;
        backend.acquire_lock(&path, exclusive).await
    }
}
