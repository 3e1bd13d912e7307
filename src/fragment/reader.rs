//! Fragment reader: book-keeping-driven access to one fragment's tiles

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::trace;
use tokio::sync::Mutex;

use super::bookkeeping::Bookkeeping;
use super::{coords_file_index, fragment_files, AttrFileInfo, FragmentInfo};
use crate::cache::TileKey;
use crate::compression::{decode_frame, frame_size};
use crate::context::Context;
use crate::coords::{DenseGrid, RectU64, Subarray};
use crate::error::{Result, StorageError};
use crate::io::uri;
use crate::schema::ArraySchema;
use crate::BOOKKEEPING_FILE;

/// Reader over one committed fragment.
pub struct FragmentReader {
    ctx: Context,
    schema: Arc<ArraySchema>,
    info: FragmentInfo,
    bookkeeping: Bookkeeping,
    files: Vec<AttrFileInfo>,
    file_sizes: Mutex<HashMap<usize, u64>>,
    /// Tile grid over the fragment's non-empty domain; dense only.
    grid: Option<DenseGrid>,
    region: Option<RectU64>,
}

impl FragmentReader {
    pub async fn open(
        ctx: Context,
        schema: Arc<ArraySchema>,
        info: FragmentInfo,
    ) -> Result<Self> {
        let bk_uri = uri::join(&info.uri, BOOKKEEPING_FILE);
        let raw = ctx.vfs().read_full(&bk_uri).await?;
        let box_size = 2 * schema.coords_size();
        let bookkeeping = Bookkeeping::from_file_bytes(&raw, box_size)?;

        if bookkeeping.sparse == schema.is_dense() {
            return Err(StorageError::Corruption(format!(
                "fragment {} kind contradicts the array schema",
                info.name
            )));
        }
        let files = fragment_files(&schema);
        if bookkeeping.file_offsets.len() != files.len() {
            return Err(StorageError::Corruption(format!(
                "fragment {} book-keeping indexes {} files, schema implies {}",
                info.name,
                bookkeeping.file_offsets.len(),
                files.len()
            )));
        }

        let (grid, region) = if schema.is_dense() {
            let sub = Subarray::from_bytes(
                schema.coords_type(),
                schema.rank(),
                &bookkeeping.non_empty_domain,
            )?;
            let rect = sub.to_offsets(schema.domain())?;
            let shape: Vec<u64> = rect
                .lo
                .iter()
                .zip(&rect.hi)
                .map(|(&lo, &hi)| hi - lo + 1)
                .collect();
            let grid = DenseGrid::new(
                rect.lo.clone(),
                shape,
                schema.extent_shape()?,
                schema.tile_order(),
                schema.cell_order(),
            )?;
            if grid.tile_count() != bookkeeping.tile_count {
                return Err(StorageError::Corruption(format!(
                    "fragment {} holds {} tiles, its domain implies {}",
                    info.name,
                    bookkeeping.tile_count,
                    grid.tile_count()
                )));
            }
            (Some(grid), Some(rect))
        } else {
            (None, None)
        };

        Ok(Self {
            ctx,
            schema,
            info,
            bookkeeping,
            files,
            file_sizes: Mutex::new(HashMap::new()),
            grid,
            region,
        })
    }

    pub fn info(&self) -> &FragmentInfo {
        &self.info
    }

    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    /// Offset-space region covered by a dense fragment.
    pub fn region(&self) -> Option<&RectU64> {
        self.region.as_ref()
    }

    /// Tile grid of a dense fragment.
    pub fn grid(&self) -> Option<&DenseGrid> {
        self.grid.as_ref()
    }

    async fn file_size(&self, file_idx: usize) -> Result<u64> {
        let mut sizes = self.file_sizes.lock().await;
        if let Some(&size) = sizes.get(&file_idx) {
            return Ok(size);
        }
        let file_uri = uri::join(&self.info.uri, &self.files[file_idx].file_name);
        let size = self.ctx.vfs().file_size(&file_uri).await?;
        sizes.insert(file_idx, size);
        Ok(size)
    }

    /// Decoded payload of one tile of one attribute file, through the tile
    /// cache.
    pub async fn tile_bytes(&self, file_idx: usize, tile: u64) -> Result<Bytes> {
        let key = TileKey {
            fragment: self.info.name.clone(),
            file: file_idx as u32,
            tile,
        };
        if let Some(hit) = self.ctx.tile_cache().get(&key) {
            return Ok(hit);
        }

        let offsets = &self.bookkeeping.file_offsets[file_idx];
        let start = *offsets.get(tile as usize).ok_or_else(|| {
            StorageError::Corruption(format!(
                "tile {} out of range in fragment {}",
                tile, self.info.name
            ))
        })?;
        let end = match offsets.get(tile as usize + 1) {
            Some(&next) => next,
            None => self.file_size(file_idx).await?,
        };
        if end < start {
            return Err(StorageError::Corruption(format!(
                "tile offsets of fragment {} are not monotonic",
                self.info.name
            )));
        }

        let file_uri = uri::join(&self.info.uri, &self.files[file_idx].file_name);
        trace!(
            "fetch tile {tile} of {file_uri} (bytes {start}..{end})"
        );
        let frame = self
            .ctx
            .vfs()
            .read(&file_uri, start, (end - start) as usize)
            .await?;
        // The byte extent the offsets table implies must match the frame's
        // own header.
        if frame_size(&frame)? != frame.len() {
            return Err(StorageError::Corruption(format!(
                "tile {} of {} disagrees with the book-keeping offsets",
                tile, file_uri
            )));
        }
        let payload = Bytes::from(decode_frame(&frame, self.files[file_idx].value_size)?);
        self.ctx.tile_cache().insert(key, payload.clone());
        Ok(payload)
    }

    /// Sparse tiles whose MBR intersects the subarray, in tile order.
    pub fn sparse_tiles_intersecting(&self, subarray: &Subarray) -> Vec<u64> {
        self.bookkeeping
            .mbrs
            .iter()
            .enumerate()
            .filter(|(_, mbr)| subarray.intersects_box(mbr))
            .map(|(t, _)| t as u64)
            .collect()
    }

    /// Decoded coordinate tuples of one sparse tile.
    pub async fn coords_tile(&self, tile: u64) -> Result<Bytes> {
        self.tile_bytes(coords_file_index(&self.schema), tile).await
    }

    pub fn cell_count(&self, tile: u64) -> u64 {
        self.bookkeeping.cell_counts[tile as usize]
    }
}

/// Slice one cell out of a decoded fixed-length tile payload.
pub fn fixed_cell(payload: &[u8], pos: u64, cell_size: usize) -> &[u8] {
    &payload[pos as usize * cell_size..(pos as usize + 1) * cell_size]
}

/// Slice one cell out of a decoded var-length tile (offsets + values
/// payloads).
pub fn var_cell<'a>(offsets: &[u8], values: &'a [u8], pos: u64) -> &'a [u8] {
    let idx = pos as usize * 8;
    let start = u64::from_le_bytes(offsets[idx..idx + 8].try_into().unwrap()) as usize;
    let end = if idx + 16 <= offsets.len() {
        u64::from_le_bytes(offsets[idx + 8..idx + 16].try_into().unwrap()) as usize
    } else {
        values.len()
    };
    &values[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_cell_slicing() {
        let payload: Vec<u8> = (0..12).collect();
        assert_eq!(fixed_cell(&payload, 1, 4), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_var_cell_slicing() {
        let offsets = crate::utils::typed_data_to_bytes(&[0u64, 1, 3]);
        let values = b"abbccc";
        assert_eq!(var_cell(&offsets, values, 0), b"a");
        assert_eq!(var_cell(&offsets, values, 1), b"bb");
        assert_eq!(var_cell(&offsets, values, 2), b"ccc");
    }
}
