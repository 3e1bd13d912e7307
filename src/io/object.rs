//! Object-store backend: Azure Blob, GCS, optional HDFS
//!
//! Directories are common prefixes plus a `.dir.marker` placeholder object.
//! Appends buffer in memory; once the buffered size crosses one upload
//! block the write switches to a multipart upload with bounded parallelism,
//! and `commit` issues the block-list commit that makes the object visible.
//! Reads under the grain size go through a single range request, larger
//! reads fan out into parallel disjoint range requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use log::{debug, trace};
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::sync::Mutex;

use super::uri::ParsedUri;
use super::{FileLock, FsBackend};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::utils::format_bytes;

/// Directory placeholder object name.
pub const DIR_MARKER: &str = ".dir.marker";

/// Reads at or under this size use one range request.
const READ_GRAIN: usize = 4 * 1024 * 1024;

/// Upper bound on blocks per object, mirroring the blob block-list limit.
const MAX_BLOCK_COUNT: usize = 50_000;

struct PendingWrite {
    buf: Vec<u8>,
    upload: Option<WriteMultipart>,
    total_bytes: usize,
}

pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    download_buffer_size: usize,
    upload_block_size: usize,
    max_parallel_ops: usize,
    pending: Mutex<HashMap<String, PendingWrite>>,
}

impl ObjectBackend {
    /// Connect to the store named by a parsed URI, with credentials from the
    /// environment.
    pub fn connect(parsed: &ParsedUri, config: &Config) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match parsed {
            ParsedUri::Azure {
                account, container, ..
            } => {
                let mut builder = MicrosoftAzureBuilder::from_env()
                    .with_account(account.clone())
                    .with_container_name(container.clone());
                if std::env::var("AZURE_STORAGE_ACCOUNT").as_deref() == Ok(account.as_str()) {
                    if let Ok(key) = std::env::var("AZURE_STORAGE_KEY") {
                        builder = builder.with_access_key(key);
                    }
                }
                if let Ok(endpoint) = std::env::var("AZURE_BLOB_ENDPOINT") {
                    if !endpoint.is_empty() {
                        builder = builder.with_endpoint(endpoint);
                    }
                }
                Arc::new(
                    builder
                        .build()
                        .map_err(|e| StorageError::io(format!("az://{container}@{account}"), e))?,
                )
            }
            ParsedUri::Gcs { bucket, .. } => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket.clone())
                    .build()
                    .map_err(|e| StorageError::io(format!("gs://{bucket}"), e))?,
            ),
            #[cfg(feature = "hdfs")]
            ParsedUri::Hdfs { authority, .. } => Arc::new(
                hdfs_native_object_store::HdfsObjectStore::with_url(&format!(
                    "hdfs://{authority}"
                ))
                .map_err(|e| StorageError::io(format!("hdfs://{authority}"), e))?,
            ),
            #[cfg(not(feature = "hdfs"))]
            ParsedUri::Hdfs { authority, .. } => {
                return Err(StorageError::Unsupported(format!(
                    "hdfs://{authority}: enable the `hdfs` feature for HDFS support"
                )))
            }
            ParsedUri::File { .. } => {
                return Err(StorageError::InvalidArgument(
                    "file uris are served by the posix backend".to_string(),
                ))
            }
        };
        Ok(Self::with_store(store, config))
    }

    /// Wrap an existing `ObjectStore` client.
    pub fn with_store(store: Arc<dyn ObjectStore>, config: &Config) -> Self {
        Self {
            store,
            download_buffer_size: config.download_buffer_size.max(1),
            upload_block_size: config.upload_buffer_size.max(1),
            max_parallel_ops: config.max_parallel_ops.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn location(path: &str) -> StorePath {
        StorePath::from(path)
    }

    fn marker_location(path: &str) -> StorePath {
        StorePath::from(format!("{}/{}", path.trim_matches('/'), DIR_MARKER))
    }

    fn map_err(path: &str, e: object_store::Error) -> StorageError {
        StorageError::io(path, e)
    }
}

#[async_trait]
impl FsBackend for ObjectBackend {
    async fn is_dir(&self, path: &str) -> Result<bool> {
        if path.trim_matches('/').is_empty() {
            // The container root.
            return Ok(true);
        }
        if self.store.head(&Self::marker_location(path)).await.is_ok() {
            return Ok(true);
        }
        let listing = self
            .store
            .list_with_delimiter(Some(&Self::location(path)))
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        match self.store.head(&Self::location(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Self::map_err(path, e)),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let listing = self
            .store
            .list_with_delimiter(Some(&Self::location(path)))
            .await
            .map_err(|e| Self::map_err(path, e))?;
        let mut names = Vec::new();
        for prefix in &listing.common_prefixes {
            if let Some(name) = prefix.filename() {
                names.push(name.to_string());
            }
        }
        for object in &listing.objects {
            match object.location.filename() {
                Some(name) if name != DIR_MARKER => names.push(name.to_string()),
                _ => {}
            }
        }
        Ok(names)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        if path.trim_matches('/').is_empty() {
            return Ok(());
        }
        self.store
            .put(&Self::marker_location(path), PutPayload::new())
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(())
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        debug!("object delete_dir {path}");
        let locations: Vec<StorePath> = self
            .store
            .list(Some(&Self::location(path)))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .map_err(|e| Self::map_err(path, e))?;
        futures::stream::iter(locations.into_iter().map(Ok))
            .try_for_each_concurrent(self.max_parallel_ops, |location| {
                let store = self.store.clone();
                async move { store.delete(&location).await }
            })
            .await
            .map_err(|e| Self::map_err(path, e))?;
        match self.store.delete(&Self::marker_location(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Self::map_err(path, e)),
        }
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let meta = self
            .store
            .head(&Self::location(path))
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(meta.size)
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        trace!("object read {path} offset={offset} len={len}");
        if len == 0 {
            return Ok(Bytes::new());
        }
        let location = Self::location(path);
        if len <= READ_GRAIN {
            let data = self
                .store
                .get_range(&location, offset..offset + len as u64)
                .await
                .map_err(|e| Self::map_err(path, e))?;
            if data.len() != len {
                return Err(StorageError::io(
                    path,
                    format!("short read: wanted {len} bytes, got {}", data.len()),
                ));
            }
            return Ok(data);
        }

        // Disjoint ranges fetched in parallel, reassembled in order.
        let mut ranges = Vec::new();
        let mut start = offset;
        let end = offset + len as u64;
        while start < end {
            let stop = (start + self.download_buffer_size as u64).min(end);
            ranges.push(start..stop);
            start = stop;
        }
        let parts: Vec<Bytes> = futures::stream::iter(ranges.into_iter().map(|range| {
            let store = self.store.clone();
            let location = location.clone();
            async move { store.get_range(&location, range).await }
        }))
        .buffered(self.max_parallel_ops)
        .try_collect()
        .await
        .map_err(|e| Self::map_err(path, e))?;

        let mut out = BytesMut::with_capacity(len);
        for part in parts {
            out.extend_from_slice(&part);
        }
        if out.len() != len {
            return Err(StorageError::io(
                path,
                format!("short read: wanted {len} bytes, got {}", out.len()),
            ));
        }
        Ok(out.freeze())
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let entry = pending.entry(path.to_string()).or_insert(PendingWrite {
            buf: Vec::new(),
            upload: None,
            total_bytes: 0,
        });
        entry.total_bytes += data.len();
        if entry.total_bytes > MAX_BLOCK_COUNT.saturating_mul(self.upload_block_size) {
            return Err(StorageError::Capacity(format!(
                "pending write to {path} exceeds the backend block limits"
            )));
        }

        if let Some(upload) = entry.upload.as_mut() {
            upload.write(data);
            upload
                .wait_for_capacity(self.max_parallel_ops)
                .await
                .map_err(|e| Self::map_err(path, e))?;
            return Ok(());
        }

        entry.buf.extend_from_slice(data);
        if entry.buf.len() >= self.upload_block_size {
            let raw = self
                .store
                .put_multipart(&Self::location(path))
                .await
                .map_err(|e| Self::map_err(path, e))?;
            let mut upload = WriteMultipart::new_with_chunk_size(raw, self.upload_block_size);
            upload.write(&entry.buf);
            entry.buf = Vec::new();
            upload
                .wait_for_capacity(self.max_parallel_ops)
                .await
                .map_err(|e| Self::map_err(path, e))?;
            entry.upload = Some(upload);
        }
        Ok(())
    }

    async fn commit(&self, path: &str) -> Result<()> {
        let entry = self.pending.lock().await.remove(path);
        let Some(entry) = entry else {
            return Ok(());
        };
        match entry.upload {
            Some(mut upload) => {
                if !entry.buf.is_empty() {
                    upload.write(&entry.buf);
                }
                upload
                    .finish()
                    .await
                    .map_err(|e| Self::map_err(path, e))?;
            }
            None => {
                self.store
                    .put(&Self::location(path), PutPayload::from(entry.buf))
                    .await
                    .map_err(|e| Self::map_err(path, e))?;
            }
        }
        debug!("object commit {path} ({})", format_bytes(entry.total_bytes));
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.store
            .delete(&Self::location(path))
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn move_path(&self, _from: &str, _to: &str) -> Result<()> {
        Err(StorageError::Unsupported(
            "object stores do not support renames".to_string(),
        ))
    }

    fn supports_locking(&self) -> bool {
        // No file locking on distributed object stores.
        false
    }

    async fn acquire_lock(&self, _path: &str, _exclusive: bool) -> Result<Option<FileLock>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn backend() -> ObjectBackend {
        let mut config = Config::default();
        config.download_buffer_size = 16;
        config.upload_buffer_size = 64;
        ObjectBackend::with_store(Arc::new(InMemory::new()), &config)
    }

    #[tokio::test]
    async fn test_append_invisible_until_commit() {
        let fs = backend();
        fs.append("a/data.tdb", b"hello").await.unwrap();
        assert!(!fs.is_file("a/data.tdb").await.unwrap());
        fs.commit("a/data.tdb").await.unwrap();
        assert!(fs.is_file("a/data.tdb").await.unwrap());
        assert_eq!(fs.file_size("a/data.tdb").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_multipart_append_round_trip() {
        let fs = backend();
        // Cross the 64-byte block threshold several times.
        let chunk: Vec<u8> = (0..50u8).collect();
        for _ in 0..10 {
            fs.append("big.tdb", &chunk).await.unwrap();
        }
        fs.commit("big.tdb").await.unwrap();
        assert_eq!(fs.file_size("big.tdb").await.unwrap(), 500);
        let all = fs.read("big.tdb", 0, 500).await.unwrap();
        assert_eq!(&all[..50], &chunk[..]);
        assert_eq!(&all[450..], &chunk[..]);
    }

    #[tokio::test]
    async fn test_parallel_range_read() {
        let fs = backend();
        let data: Vec<u8> = (0..=255u8).collect();
        fs.append("r.tdb", &data).await.unwrap();
        fs.commit("r.tdb").await.unwrap();
        // 200 bytes > 16-byte grain chunks, still reassembled in order.
        let out = fs.read("r.tdb", 10, 200).await.unwrap();
        assert_eq!(&out[..], &data[10..210]);
    }

    #[tokio::test]
    async fn test_dir_markers_and_listing() {
        let fs = backend();
        assert!(fs.is_dir("").await.unwrap());
        assert!(!fs.is_dir("arrays/a").await.unwrap());
        fs.create_dir("arrays/a").await.unwrap();
        fs.create_dir("arrays/a").await.unwrap(); // idempotent
        assert!(fs.is_dir("arrays/a").await.unwrap());

        fs.write_file_for_test("arrays/a/s.tdb", b"x").await;
        fs.create_dir("arrays/a/__frag").await.unwrap();

        let mut names = fs.list("arrays/a").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["__frag".to_string(), "s.tdb".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_dir_removes_prefix() {
        let fs = backend();
        fs.create_dir("arrays/a").await.unwrap();
        fs.write_file_for_test("arrays/a/f1.tdb", b"1").await;
        fs.write_file_for_test("arrays/a/sub/f2.tdb", b"2").await;
        fs.delete_dir("arrays/a").await.unwrap();
        assert!(!fs.is_dir("arrays/a").await.unwrap());
        assert!(!fs.is_file("arrays/a/f1.tdb").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_is_unsupported() {
        let fs = backend();
        assert!(matches!(
            fs.move_path("a", "b").await,
            Err(StorageError::Unsupported(_))
        ));
        assert!(!fs.supports_locking());
    }

    impl ObjectBackend {
        async fn write_file_for_test(&self, path: &str, data: &[u8]) {
            self.append(path, data).await.unwrap();
            self.commit(path).await.unwrap();
        }
    }
}
