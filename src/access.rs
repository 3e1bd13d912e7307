//! Array access: create, open, delete, and the writer/reader entry points

use std::sync::Arc;

use log::info;

use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::fragment::writer::{ArrayWriter, WriteMode};
use crate::fragment::{list_fragments, FragmentInfo};
use crate::io::uri;
use crate::read::ArrayReader;
use crate::schema::ArraySchema;
use crate::{ARRAY_SCHEMA_FILE, CONSOLIDATION_LOCK_FILE};

/// Handle to one array: the cached schema plus the snapshot of committed
/// fragments taken when the array was opened. Readers built from this
/// handle observe exactly that snapshot.
pub struct Array {
    ctx: Context,
    uri: String,
    schema: Arc<ArraySchema>,
    fragments: Vec<FragmentInfo>,
}

impl Array {
    /// Create a new array at `array_uri` from a validated schema.
    pub async fn create(ctx: &Context, array_uri: &str, schema: ArraySchema) -> Result<()> {
        let schema_uri = uri::join(array_uri, ARRAY_SCHEMA_FILE);
        if ctx.vfs().is_file(&schema_uri).await? {
            return Err(StorageError::SchemaConflict(format!(
                "array already exists at {array_uri}"
            )));
        }
        ctx.vfs().create_dir(array_uri).await?;
        ctx.vfs().write_file(&schema_uri, &schema.serialize()).await?;
        info!("created array {array_uri}");
        Ok(())
    }

    /// Open an existing array, loading and caching its schema and taking the
    /// fragment snapshot readers will observe.
    pub async fn open(ctx: &Context, array_uri: &str) -> Result<Self> {
        let schema_uri = uri::join(array_uri, ARRAY_SCHEMA_FILE);
        if !ctx.vfs().is_file(&schema_uri).await? {
            return Err(StorageError::InvalidArgument(format!(
                "no array at {array_uri}"
            )));
        }
        let raw = ctx.vfs().read_full(&schema_uri).await?;
        let schema = Arc::new(ArraySchema::deserialize(&raw)?);

        // Shared lock while snapshotting, so consolidation cannot retire
        // fragments out from under the listing.
        let lock_uri = uri::join(array_uri, CONSOLIDATION_LOCK_FILE);
        let lock = ctx.vfs().acquire_lock(&lock_uri, false).await?;
        let fragments = list_fragments(ctx.vfs(), array_uri).await?;
        drop(lock);

        Ok(Self {
            ctx: ctx.clone(),
            uri: array_uri.to_string(),
            schema,
            fragments,
        })
    }

    /// Delete an array and everything it owns.
    pub async fn delete(ctx: &Context, array_uri: &str) -> Result<()> {
        let schema_uri = uri::join(array_uri, ARRAY_SCHEMA_FILE);
        if !ctx.vfs().is_file(&schema_uri).await? {
            return Err(StorageError::InvalidArgument(format!(
                "no array at {array_uri}"
            )));
        }
        ctx.vfs().delete_dir(array_uri).await?;
        info!("deleted array {array_uri}");
        Ok(())
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn schema_arc(&self) -> Arc<ArraySchema> {
        self.schema.clone()
    }

    /// Committed fragments at open time, oldest first.
    pub fn fragments(&self) -> &[FragmentInfo] {
        &self.fragments
    }

    /// Open a write session covering the whole domain (dense) or carrying
    /// its own coordinates (sparse and unordered modes).
    pub async fn writer(&self, mode: WriteMode, attrs: &[&str]) -> Result<ArrayWriter> {
        ArrayWriter::open(
            self.ctx.clone(),
            self.schema.clone(),
            &self.uri,
            mode,
            attrs,
            None,
        )
        .await
    }

    /// Open a dense write session over a tile-aligned subarray.
    pub async fn writer_with_subarray(
        &self,
        mode: WriteMode,
        attrs: &[&str],
        subarray: &[u8],
    ) -> Result<ArrayWriter> {
        ArrayWriter::open(
            self.ctx.clone(),
            self.schema.clone(),
            &self.uri,
            mode,
            attrs,
            Some(subarray),
        )
        .await
    }

    /// Open a read stream over a subarray for the requested attributes
    /// (sparse arrays may request the `__coords` pseudo-attribute).
    pub async fn reader(&self, subarray: &[u8], attrs: &[&str]) -> Result<ArrayReader> {
        ArrayReader::open(
            self.ctx.clone(),
            self.schema.clone(),
            &self.fragments,
            subarray,
            attrs,
        )
        .await
    }
}
