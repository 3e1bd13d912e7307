//! Fragment writer: one write session producing one fragment
//!
//! Cells flow in through `submit`, are re-sorted into cell order for the
//! unordered modes, buffered into fixed-capacity tiles, compressed in
//! parallel and appended to the per-attribute files. `finalize` flushes the
//! last tile, writes book-keeping and finally the `.ok` sentinel; until the
//! sentinel exists the fragment is invisible, so any failure or a dropped
//! writer leaves the array unchanged.

use std::sync::Arc;

use futures::future::try_join_all;
use log::{info, trace};

use super::bookkeeping::Bookkeeping;
use super::{fragment_files, new_fragment_name, AttrFileInfo};
use crate::compression::encode_frame;
use crate::context::Context;
use crate::coords::{DenseGrid, GlobalCellOrder, RectU64, Subarray};
use crate::error::{Result, StorageError};
use crate::io::uri;
use crate::schema::{ArraySchema, Attribute};
use crate::sort::{CellRecord, CellSorter, CellStream};
use crate::tile::{AttrTile, FixedTile};
use crate::types::{coord_as_i128, coord_cmp};
use crate::utils::format_bytes;
use crate::{BOOKKEEPING_FILE, FRAGMENT_OK_FILE};

/// Write session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Dense cells arriving in global order over the write subarray.
    DenseOrdered,
    /// Dense cells with explicit coordinates, re-sorted internally.
    DenseUnordered,
    /// Sparse cells with explicit coordinates, re-sorted internally.
    SparseUnordered,
}

/// One attribute's buffer in a `submit` call.
pub struct AttributeData<'a> {
    pub data: &'a [u8],
    /// Byte start of each cell within `data`; variable-length only.
    pub offsets: Option<&'a [u64]>,
}

impl<'a> AttributeData<'a> {
    pub fn fixed(data: &'a [u8]) -> Self {
        Self {
            data,
            offsets: None,
        }
    }

    pub fn var(offsets: &'a [u64], data: &'a [u8]) -> Self {
        Self {
            data,
            offsets: Some(offsets),
        }
    }
}

/// Buffers for one `submit` call, attribute buffers in the writer's
/// attribute order.
pub struct WriteBuffers<'a> {
    pub attrs: Vec<AttributeData<'a>>,
    /// Coordinate tuples, required by the unordered modes.
    pub coords: Option<&'a [u8]>,
}

/// Writer handle for one fragment.
pub struct ArrayWriter {
    ctx: Context,
    schema: Arc<ArraySchema>,
    fragment_uri: String,
    fragment_name: String,
    mode: WriteMode,
    /// Schema attribute index for each submit buffer position.
    attr_order: Vec<usize>,
    files: Vec<AttrFileInfo>,
    file_cursors: Vec<u64>,
    file_offsets: Vec<Vec<u64>>,
    cell_counts: Vec<u64>,
    mbrs: Vec<Vec<u8>>,
    bounds: Vec<Vec<u8>>,

    open_tiles: Vec<AttrTile>,
    coords_tile: Option<FixedTile>,
    tile_capacity: u64,
    cells_ingested: u64,

    // Dense state
    grid: Option<DenseGrid>,
    write_rect: Option<RectU64>,
    subarray_raw: Option<Vec<u8>>,
    cells_expected: u64,

    // Sparse state
    current_mbr: Option<Vec<u8>>,
    first_coords: Option<Vec<u8>>,
    last_coords: Option<Vec<u8>>,

    // Unordered state
    sorter: Option<CellSorter>,
    global_order: Option<GlobalCellOrder>,

    finalized: bool,
}

impl ArrayWriter {
    pub(crate) async fn open(
        ctx: Context,
        schema: Arc<ArraySchema>,
        array_uri: &str,
        mode: WriteMode,
        attrs: &[&str],
        subarray: Option<&[u8]>,
    ) -> Result<Self> {
        let dense_mode = mode != WriteMode::SparseUnordered;
        if dense_mode != schema.is_dense() {
            return Err(StorageError::InvalidArgument(format!(
                "write mode {mode:?} does not match the array type"
            )));
        }

        // Every schema attribute must be covered exactly once; the list only
        // fixes the order of the submit buffers.
        let mut attr_order = Vec::with_capacity(attrs.len());
        for name in attrs {
            let idx = schema.attribute_index(name).ok_or_else(|| {
                StorageError::InvalidArgument(format!("unknown attribute {name}"))
            })?;
            if attr_order.contains(&idx) {
                return Err(StorageError::InvalidArgument(format!(
                    "attribute {name} listed twice"
                )));
            }
            attr_order.push(idx);
        }
        if attr_order.len() != schema.attributes().len() {
            return Err(StorageError::InvalidArgument(
                "a write must cover every attribute of the array".to_string(),
            ));
        }

        let files = fragment_files(&schema);
        let file_count = files.len();

        let (grid, write_rect, subarray_raw, cells_expected, tile_capacity) = if schema.is_dense()
        {
            let raw = subarray.unwrap_or_else(|| schema.domain()).to_vec();
            let sub = Subarray::from_bytes(schema.coords_type(), schema.rank(), &raw)?;
            if sub.is_empty() {
                return Err(StorageError::InvalidArgument(
                    "write subarray is empty".to_string(),
                ));
            }
            sub.validate_within(schema.domain())?;
            let rect = sub.to_offsets(schema.domain())?;
            let extents = schema.extent_shape()?;
            for d in 0..schema.rank() {
                if rect.lo[d] % extents[d] != 0 || (rect.hi[d] + 1) % extents[d] != 0 {
                    return Err(StorageError::InvalidArgument(format!(
                        "write subarray is not tile-aligned on dimension {d}"
                    )));
                }
            }
            let shape: Vec<u64> = rect
                .lo
                .iter()
                .zip(&rect.hi)
                .map(|(&lo, &hi)| hi - lo + 1)
                .collect();
            let grid = DenseGrid::new(
                rect.lo.clone(),
                shape,
                extents,
                schema.tile_order(),
                schema.cell_order(),
            )?;
            let volume = rect.volume();
            let capacity = grid.tile_capacity();
            (Some(grid), Some(rect), Some(raw), volume, capacity)
        } else {
            if subarray.is_some() {
                return Err(StorageError::InvalidArgument(
                    "sparse writes take no subarray".to_string(),
                ));
            }
            (None, None, None, 0, schema.capacity())
        };

        let open_tiles = Self::fresh_tiles(&schema, tile_capacity);
        let coords_tile = (!schema.is_dense())
            .then(|| FixedTile::new(schema.coords_size(), tile_capacity));

        let sorter = (mode != WriteMode::DenseOrdered)
            .then(|| CellSorter::new(ctx.config().sort_memory_budget));
        let global_order =
            (mode == WriteMode::SparseUnordered).then(|| schema.global_order());

        let fragment_name = new_fragment_name();
        let fragment_uri = uri::join(array_uri, &fragment_name);
        ctx.vfs().create_dir(&fragment_uri).await?;
        trace!("opened fragment {fragment_uri} in mode {mode:?}");

        Ok(Self {
            ctx,
            schema,
            fragment_uri,
            fragment_name,
            mode,
            attr_order,
            files,
            file_cursors: vec![0; file_count],
            file_offsets: vec![Vec::new(); file_count],
            cell_counts: Vec::new(),
            mbrs: Vec::new(),
            bounds: Vec::new(),
            open_tiles,
            coords_tile,
            tile_capacity,
            cells_ingested: 0,
            grid,
            write_rect,
            subarray_raw,
            cells_expected,
            current_mbr: None,
            first_coords: None,
            last_coords: None,
            sorter,
            global_order,
            finalized: false,
        })
    }

    fn fresh_tiles(schema: &ArraySchema, capacity: u64) -> Vec<AttrTile> {
        schema
            .attributes()
            .iter()
            .map(|a| match a.cell_size() {
                Some(cell_size) => AttrTile::fixed(cell_size, capacity),
                None => AttrTile::var(capacity),
            })
            .collect()
    }

    /// Directory name of the fragment being written.
    pub fn fragment_name(&self) -> &str {
        &self.fragment_name
    }

    /// Append cells to the write session.
    pub async fn submit(&mut self, buffers: &WriteBuffers<'_>) -> Result<()> {
        if self.finalized {
            return Err(StorageError::InvalidArgument(
                "writer already finalized".to_string(),
            ));
        }
        let cell_count = self.validate_buffers(buffers)?;
        trace!("submit of {cell_count} cells to {}", self.fragment_uri);

        match self.mode {
            WriteMode::DenseOrdered => {
                if self.cells_ingested + cell_count > self.cells_expected {
                    return Err(StorageError::InvalidArgument(format!(
                        "write of {} cells overflows the subarray volume {}",
                        self.cells_ingested + cell_count,
                        self.cells_expected
                    )));
                }
                for i in 0..cell_count as usize {
                    let values = self.cell_values(buffers, i)?;
                    self.ingest_cell(None, values).await?;
                }
            }
            WriteMode::DenseUnordered | WriteMode::SparseUnordered => {
                let coords = buffers.coords.expect("validated above");
                let coords_size = self.schema.coords_size();
                for i in 0..cell_count as usize {
                    let tuple = &coords[i * coords_size..(i + 1) * coords_size];
                    let key = self.sort_key(tuple)?;
                    let values = self
                        .cell_values(buffers, i)?
                        .into_iter()
                        .map(|v| v.to_vec())
                        .collect();
                    self.sorter
                        .as_mut()
                        .expect("unordered writers have a sorter")
                        .push(CellRecord {
                            key,
                            coords: tuple.to_vec(),
                            values,
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Check buffer shapes and return the cell count of this submission.
    fn validate_buffers(&self, buffers: &WriteBuffers<'_>) -> Result<u64> {
        if buffers.attrs.len() != self.attr_order.len() {
            return Err(StorageError::InvalidArgument(format!(
                "{} attribute buffers for {} attributes",
                buffers.attrs.len(),
                self.attr_order.len()
            )));
        }
        let mut cell_count: Option<u64> = None;
        for (pos, buf) in buffers.attrs.iter().enumerate() {
            let attr = &self.schema.attributes()[self.attr_order[pos]];
            let n = match attr.cell_size() {
                Some(cell_size) => {
                    if buf.data.len() % cell_size != 0 {
                        return Err(StorageError::InvalidArgument(format!(
                            "buffer for {} is not a whole number of cells",
                            attr.name()
                        )));
                    }
                    (buf.data.len() / cell_size) as u64
                }
                None => {
                    let offsets = buf.offsets.ok_or_else(|| {
                        StorageError::InvalidArgument(format!(
                            "attribute {} is variable-length and needs offsets",
                            attr.name()
                        ))
                    })?;
                    for pair in offsets.windows(2) {
                        if pair[0] > pair[1] {
                            return Err(StorageError::InvalidArgument(format!(
                                "offsets for {} are not monotonic",
                                attr.name()
                            )));
                        }
                    }
                    if let Some(&last) = offsets.last() {
                        if last as usize > buf.data.len() {
                            return Err(StorageError::InvalidArgument(format!(
                                "offsets for {} point past the value buffer",
                                attr.name()
                            )));
                        }
                    }
                    offsets.len() as u64
                }
            };
            match cell_count {
                None => cell_count = Some(n),
                Some(prev) if prev != n => {
                    return Err(StorageError::InvalidArgument(format!(
                        "attribute buffers disagree on the cell count ({prev} vs {n})"
                    )))
                }
                _ => {}
            }
        }
        let cell_count = cell_count.unwrap_or(0);

        match (self.mode, buffers.coords) {
            (WriteMode::DenseOrdered, Some(_)) => {
                return Err(StorageError::InvalidArgument(
                    "ordered dense writes take no coordinates".to_string(),
                ))
            }
            (WriteMode::DenseOrdered, None) => {}
            (_, None) => {
                return Err(StorageError::InvalidArgument(
                    "unordered writes require a coordinates buffer".to_string(),
                ))
            }
            (_, Some(coords)) => {
                let coords_size = self.schema.coords_size();
                if coords.len() % coords_size != 0
                    || (coords.len() / coords_size) as u64 != cell_count
                {
                    return Err(StorageError::InvalidArgument(format!(
                        "coordinates buffer holds {} tuples for {} cells",
                        coords.len() / coords_size,
                        cell_count
                    )));
                }
            }
        }
        Ok(cell_count)
    }

    /// Values of cell `i` from the submit buffers, re-ordered to schema
    /// attribute order.
    fn cell_values<'a>(
        &self,
        buffers: &WriteBuffers<'a>,
        i: usize,
    ) -> Result<Vec<&'a [u8]>> {
        let mut values: Vec<&[u8]> = vec![&[]; self.attr_order.len()];
        for (pos, buf) in buffers.attrs.iter().enumerate() {
            let attr_idx = self.attr_order[pos];
            let attr = &self.schema.attributes()[attr_idx];
            values[attr_idx] = extract_cell(attr, buf, i);
        }
        Ok(values)
    }

    /// Sort key of one coordinate tuple, validating domain membership.
    fn sort_key(&self, tuple: &[u8]) -> Result<Vec<u64>> {
        match self.mode {
            WriteMode::DenseUnordered => {
                let rect = self.write_rect.as_ref().expect("dense writer");
                let grid = self.grid.as_ref().expect("dense writer");
                let size = self.schema.coords_type().size();
                let mut offsets = Vec::with_capacity(self.schema.rank());
                for d in 0..self.schema.rank() {
                    let lo = coord_as_i128(self.schema.coords_type(), self.schema.dim_lo(d))?;
                    let v = coord_as_i128(self.schema.coords_type(), &tuple[d * size..])?;
                    let off = v - lo;
                    if off < 0 {
                        return Err(StorageError::InvalidArgument(
                            "coordinates outside the array domain".to_string(),
                        ));
                    }
                    offsets.push(off as u64);
                }
                if !rect.contains(&offsets) {
                    return Err(StorageError::InvalidArgument(
                        "coordinates outside the write subarray".to_string(),
                    ));
                }
                let (tile, pos) = grid.locate(&offsets);
                Ok(vec![tile, pos])
            }
            WriteMode::SparseUnordered => {
                let sub = Subarray::from_bytes(
                    self.schema.coords_type(),
                    self.schema.rank(),
                    self.schema.domain(),
                )?;
                if !sub.contains(tuple) {
                    return Err(StorageError::InvalidArgument(
                        "coordinates outside the array domain".to_string(),
                    ));
                }
                Ok(self
                    .global_order
                    .as_ref()
                    .expect("sparse writer")
                    .key(tuple))
            }
            WriteMode::DenseOrdered => unreachable!("ordered writes carry no coordinates"),
        }
    }

    /// Push one cell into the open tile, sealing it when full.
    async fn ingest_cell(&mut self, coords: Option<&[u8]>, values: Vec<&[u8]>) -> Result<()> {
        for (attr_idx, value) in values.iter().enumerate() {
            self.open_tiles[attr_idx].push_cell(value)?;
        }
        if let Some(tuple) = coords {
            self.coords_tile
                .as_mut()
                .expect("sparse writer")
                .push_cell(tuple)?;
            self.expand_mbr(tuple);
            if self.first_coords.is_none() {
                self.first_coords = Some(tuple.to_vec());
            }
            self.last_coords = Some(tuple.to_vec());
        }
        self.cells_ingested += 1;
        if self.open_tiles[0].cells() >= self.tile_capacity {
            self.seal_tile().await?;
        }
        Ok(())
    }

    fn expand_mbr(&mut self, tuple: &[u8]) {
        let dtype = self.schema.coords_type();
        let size = dtype.size();
        let rank = self.schema.rank();
        match self.current_mbr.as_mut() {
            None => {
                let mut mbr = Vec::with_capacity(2 * rank * size);
                for d in 0..rank {
                    mbr.extend_from_slice(&tuple[d * size..(d + 1) * size]);
                    mbr.extend_from_slice(&tuple[d * size..(d + 1) * size]);
                }
                self.current_mbr = Some(mbr);
            }
            Some(mbr) => {
                for d in 0..rank {
                    let c = &tuple[d * size..(d + 1) * size];
                    let lo_range = 2 * d * size..(2 * d + 1) * size;
                    let hi_range = (2 * d + 1) * size..(2 * d + 2) * size;
                    if coord_cmp(dtype, c, &mbr[lo_range.clone()]) == std::cmp::Ordering::Less {
                        mbr[lo_range].copy_from_slice(c);
                    }
                    if coord_cmp(dtype, c, &mbr[hi_range.clone()]) == std::cmp::Ordering::Greater {
                        mbr[hi_range].copy_from_slice(c);
                    }
                }
            }
        }
    }

    /// Compress the open tile's streams in parallel and append them to the
    /// attribute files.
    async fn seal_tile(&mut self) -> Result<()> {
        let cell_count = self.open_tiles[0].cells();
        if cell_count == 0 {
            return Ok(());
        }

        // Payloads in canonical file order.
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(self.files.len());
        for tile in self.open_tiles.iter_mut() {
            match tile {
                AttrTile::Fixed(t) => payloads.push(t.take_payload()),
                AttrTile::Var(t) => {
                    let (offsets, values) = t.take_payloads();
                    payloads.push(offsets);
                    payloads.push(values);
                }
            }
        }
        if let Some(coords) = self.coords_tile.as_mut() {
            payloads.push(coords.take_payload());
        }
        debug_assert_eq!(payloads.len(), self.files.len());

        let permits = self.ctx.codec_permits();
        let frames: Vec<Vec<u8>> = try_join_all(payloads.into_iter().zip(&self.files).map(
            |(payload, file)| {
                let permits = permits.clone();
                let spec = file.compressor;
                let value_size = file.value_size;
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| StorageError::io("<codec pool>", e))?;
                    tokio::task::spawn_blocking(move || encode_frame(spec, value_size, &payload))
                        .await
                        .map_err(|e| StorageError::io("<codec pool>", e))?
                }
            },
        ))
        .await?;

        for (file_idx, frame) in frames.into_iter().enumerate() {
            let file_uri = uri::join(&self.fragment_uri, &self.files[file_idx].file_name);
            self.file_offsets[file_idx].push(self.file_cursors[file_idx]);
            self.ctx.vfs().append(&file_uri, &frame).await?;
            self.file_cursors[file_idx] += frame.len() as u64;
        }

        self.cell_counts.push(cell_count);
        if !self.schema.is_dense() {
            let mbr = self.current_mbr.take().expect("sealed tile has an mbr");
            self.mbrs.push(mbr);
            let mut bounds = self.first_coords.take().expect("sealed tile has bounds");
            bounds.extend_from_slice(&self.last_coords.take().expect("sealed tile has bounds"));
            self.bounds.push(bounds);
        }
        Ok(())
    }

    /// Drain the sorter of an unordered write into the tiling path.
    async fn drain_sorted(&mut self, mut stream: CellStream) -> Result<()> {
        let mut expected = 0u64;
        let mut last_key: Option<Vec<u64>> = None;
        while let Some(record) = stream.next()? {
            if self.mode == WriteMode::DenseUnordered {
                let cap = self.tile_capacity;
                let want = vec![expected / cap, expected % cap];
                if record.key != want {
                    return Err(StorageError::InvalidArgument(
                        if last_key.as_ref() == Some(&record.key) {
                            "duplicate coordinates in dense write".to_string()
                        } else {
                            "dense write does not cover its subarray exactly".to_string()
                        },
                    ));
                }
                last_key = Some(record.key.clone());
                expected += 1;
            }
            let values: Vec<&[u8]> = record.values.iter().map(|v| v.as_slice()).collect();
            let coords = (!self.schema.is_dense()).then_some(record.coords.as_slice());
            self.ingest_cell(coords, values).await?;
        }
        Ok(())
    }

    /// Flush remaining cells, write book-keeping, then the `.ok` sentinel.
    pub async fn finalize(mut self) -> Result<()> {
        if self.finalized {
            return Err(StorageError::InvalidArgument(
                "writer already finalized".to_string(),
            ));
        }
        if let Some(sorter) = self.sorter.take() {
            let stream = sorter.finish()?;
            self.drain_sorted(stream).await?;
        }
        if self.schema.is_dense() {
            if self.cells_ingested != self.cells_expected {
                return Err(StorageError::InvalidArgument(format!(
                    "dense write covered {} of {} cells of its subarray",
                    self.cells_ingested, self.cells_expected
                )));
            }
        } else {
            self.seal_tile().await?;
        }

        for (file_idx, &cursor) in self.file_cursors.iter().enumerate() {
            if cursor > 0 {
                let file_uri = uri::join(&self.fragment_uri, &self.files[file_idx].file_name);
                self.ctx.vfs().commit(&file_uri).await?;
            }
        }

        let non_empty_domain = if self.schema.is_dense() {
            self.subarray_raw.clone().expect("dense writer")
        } else {
            self.sparse_non_empty_domain()
        };
        let bookkeeping = Bookkeeping {
            sparse: !self.schema.is_dense(),
            tile_count: self.cell_counts.len() as u64,
            file_offsets: std::mem::take(&mut self.file_offsets),
            non_empty_domain,
            mbrs: std::mem::take(&mut self.mbrs),
            bounds: std::mem::take(&mut self.bounds),
            cell_counts: std::mem::take(&mut self.cell_counts),
        };
        let bk_uri = uri::join(&self.fragment_uri, BOOKKEEPING_FILE);
        self.ctx
            .vfs()
            .write_file(&bk_uri, &bookkeeping.to_file_bytes()?)
            .await?;

        // Visibility flips with the sentinel; everything before it is
        // invisible to readers.
        let ok_uri = uri::join(&self.fragment_uri, FRAGMENT_OK_FILE);
        self.ctx.vfs().write_file(&ok_uri, &[]).await?;
        self.finalized = true;
        let written: u64 = self.file_cursors.iter().sum();
        info!(
            "committed fragment {} ({} tiles, {} cells, {})",
            self.fragment_uri,
            bookkeeping.tile_count,
            bookkeeping.total_cells(),
            format_bytes(written as usize)
        );
        Ok(())
    }

    fn sparse_non_empty_domain(&self) -> Vec<u8> {
        let dtype = self.schema.coords_type();
        let size = dtype.size();
        let rank = self.schema.rank();
        let mut domain: Option<Vec<u8>> = None;
        for mbr in &self.mbrs {
            match domain.as_mut() {
                None => domain = Some(mbr.clone()),
                Some(acc) => {
                    for d in 0..rank {
                        let lo_range = 2 * d * size..(2 * d + 1) * size;
                        let hi_range = (2 * d + 1) * size..(2 * d + 2) * size;
                        if coord_cmp(dtype, &mbr[lo_range.clone()], &acc[lo_range.clone()])
                            == std::cmp::Ordering::Less
                        {
                            acc[lo_range.clone()].copy_from_slice(&mbr[lo_range.clone()]);
                        }
                        if coord_cmp(dtype, &mbr[hi_range.clone()], &acc[hi_range.clone()])
                            == std::cmp::Ordering::Greater
                        {
                            acc[hi_range.clone()].copy_from_slice(&mbr[hi_range.clone()]);
                        }
                    }
                }
            }
        }
        domain.unwrap_or_default()
    }
}

/// Slice one cell's value out of a submit buffer.
fn extract_cell<'a>(attr: &Attribute, buf: &AttributeData<'a>, i: usize) -> &'a [u8] {
    match attr.cell_size() {
        Some(cell_size) => &buf.data[i * cell_size..(i + 1) * cell_size],
        None => {
            let offsets = buf.offsets.expect("validated var buffer");
            let start = offsets[i] as usize;
            let end = offsets
                .get(i + 1)
                .map(|&o| o as usize)
                .unwrap_or(buf.data.len());
            &buf.data[start..end]
        }
    }
}
