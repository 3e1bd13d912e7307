//! Read coordinator: merges fragment streams into the array-level result
//!
//! Fragments are visited newest-first. Dense arrays resolve each array tile
//! from the newest fragment whose non-empty domain covers it (tile-aligned
//! fragments cover whole tiles, so coverage is per tile); cells no fragment
//! covers read back as empty values. Sparse arrays merge the per-fragment
//! cell streams through a priority queue keyed by global cell order, with
//! newer fragments masking older ones at equal coordinates.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use log::debug;

use crate::context::Context;
use crate::coords::{DenseGrid, Order, RectU64, Subarray};
use crate::error::{Result, StorageError};
use crate::fragment::reader::{fixed_cell, var_cell, FragmentReader};
use crate::fragment::{files_for_attr, FragmentInfo};
use crate::schema::{ArraySchema, COORDS_ATTR};

/// Caller-provided result buffer for one attribute.
///
/// `data` receives the value bytes, `offsets` the per-cell byte starts for
/// variable-length attributes. Capacities bound how much one `next` call
/// may deliver.
pub struct ReadBuffer {
    max_data_bytes: usize,
    max_cells: usize,
    pub data: Vec<u8>,
    pub offsets: Vec<u64>,
}

impl ReadBuffer {
    /// Buffer for a fixed-length attribute.
    pub fn with_capacity(data_bytes: usize) -> Self {
        Self {
            max_data_bytes: data_bytes,
            max_cells: usize::MAX,
            data: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Buffer for a variable-length attribute.
    pub fn var_with_capacity(cells: usize, data_bytes: usize) -> Self {
        Self {
            max_data_bytes: data_bytes,
            max_cells: cells,
            data: Vec::new(),
            offsets: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.offsets.clear();
    }

    fn fits(&self, value_len: usize, var: bool) -> bool {
        self.data.len() + value_len <= self.max_data_bytes
            && (!var || self.offsets.len() < self.max_cells)
    }

    fn push(&mut self, value: &[u8], var: bool) {
        if var {
            self.offsets.push(self.data.len() as u64);
        }
        self.data.extend_from_slice(value);
    }

    /// Bytes delivered into this buffer by the last `next` call.
    pub fn filled_bytes(&self) -> usize {
        self.data.len() + self.offsets.len() * 8
    }
}

/// Outcome of one `next` call.
#[derive(Debug)]
pub struct BuffersFilled {
    /// No more cells remain after this call.
    pub complete: bool,
    /// Filled byte count per buffer.
    pub sizes: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
enum RequestedAttr {
    Coords,
    Fixed { first_file: usize, cell_size: usize },
    Var { first_file: usize },
}

impl RequestedAttr {
    fn is_var(&self) -> bool {
        matches!(self, RequestedAttr::Var { .. })
    }
}

fn resolve_attrs(schema: &ArraySchema, attrs: &[&str]) -> Result<Vec<RequestedAttr>> {
    let mut resolved = Vec::with_capacity(attrs.len());
    for name in attrs {
        if *name == COORDS_ATTR {
            if schema.is_dense() {
                return Err(StorageError::InvalidArgument(
                    "dense arrays have no coordinate attribute".to_string(),
                ));
            }
            resolved.push(RequestedAttr::Coords);
            continue;
        }
        let idx = schema
            .attribute_index(name)
            .ok_or_else(|| StorageError::InvalidArgument(format!("unknown attribute {name}")))?;
        let attr = &schema.attributes()[idx];
        let (first_file, _) = files_for_attr(schema, idx);
        resolved.push(match attr.cell_size() {
            Some(cell_size) => RequestedAttr::Fixed {
                first_file,
                cell_size,
            },
            None => RequestedAttr::Var { first_file },
        });
    }
    Ok(resolved)
}

/// Reader handle producing the merged cell stream of one subarray.
pub struct ArrayReader {
    attrs: Vec<RequestedAttr>,
    state: ReaderState,
}

enum ReaderState {
    /// Empty subarray or zero fragments.
    Empty,
    Dense(Box<DenseRead>),
    Sparse(Box<SparseRead>),
}

impl ArrayReader {
    pub(crate) async fn open(
        ctx: Context,
        schema: Arc<ArraySchema>,
        fragments: &[FragmentInfo],
        subarray: &[u8],
        attrs: &[&str],
    ) -> Result<Self> {
        let resolved = resolve_attrs(&schema, attrs)?;
        let sub = Subarray::from_bytes(schema.coords_type(), schema.rank(), subarray)?;
        if sub.is_empty() {
            return Ok(Self {
                attrs: resolved,
                state: ReaderState::Empty,
            });
        }
        sub.validate_within(schema.domain())?;
        if fragments.is_empty() {
            return Ok(Self {
                attrs: resolved,
                state: ReaderState::Empty,
            });
        }

        // Newest first: later fragments mask older ones.
        let readers: Vec<FragmentReader> = try_join_all(
            fragments
                .iter()
                .rev()
                .map(|info| FragmentReader::open(ctx.clone(), schema.clone(), info.clone())),
        )
        .await?;
        debug!(
            "read over {} fragments, {} attributes",
            readers.len(),
            attrs.len()
        );

        let state = if schema.is_dense() {
            ReaderState::Dense(Box::new(DenseRead::new(
                schema,
                resolved.clone(),
                readers,
                sub,
            )?))
        } else {
            ReaderState::Sparse(Box::new(
                SparseRead::new(schema, resolved.clone(), readers, sub).await?,
            ))
        };
        Ok(Self {
            attrs: resolved,
            state,
        })
    }

    /// Fill the caller's buffers with the next run of cells, in the array's
    /// cell order. Returns the filled byte counts; `complete` flips once
    /// the stream is exhausted.
    pub async fn next(&mut self, buffers: &mut [ReadBuffer]) -> Result<BuffersFilled> {
        if buffers.len() != self.attrs.len() {
            return Err(StorageError::InvalidArgument(format!(
                "{} buffers for {} requested attributes",
                buffers.len(),
                self.attrs.len()
            )));
        }
        for buf in buffers.iter_mut() {
            buf.clear();
        }
        let complete = match &mut self.state {
            ReaderState::Empty => true,
            ReaderState::Dense(dense) => dense.fill(buffers).await?,
            ReaderState::Sparse(sparse) => sparse.fill(&self.attrs, buffers).await?,
        };
        Ok(BuffersFilled {
            complete,
            sizes: buffers.iter().map(|b| b.filled_bytes()).collect(),
        })
    }
}

/// One array tile resolved across fragments.
enum MergedAttr {
    Fixed { cell_size: usize, data: Vec<u8> },
    Var { cells: Vec<Option<Vec<u8>>> },
}

struct MergedTile {
    attrs: Vec<MergedAttr>,
}

struct DenseRead {
    schema: Arc<ArraySchema>,
    grid: DenseGrid,
    sub_rect: RectU64,
    frags: Vec<FragmentReader>,
    merged: HashMap<u64, MergedTile>,
    cursor: Option<Vec<u64>>,
    attrs: Vec<RequestedAttr>,
}

impl DenseRead {
    fn new(
        schema: Arc<ArraySchema>,
        attrs: Vec<RequestedAttr>,
        frags: Vec<FragmentReader>,
        sub: Subarray,
    ) -> Result<Self> {
        let grid = schema.dense_grid()?;
        let sub_rect = sub.to_offsets(schema.domain())?;
        let cursor = Some(sub_rect.lo.clone());
        Ok(Self {
            schema,
            grid,
            sub_rect,
            frags,
            merged: HashMap::new(),
            cursor,
            attrs,
        })
    }

    /// Advance the subarray odometer in cell order.
    fn step(&mut self) {
        let Some(cur) = self.cursor.as_mut() else {
            return;
        };
        let rank = cur.len();
        let dims: Box<dyn Iterator<Item = usize>> = match self.schema.cell_order() {
            Order::ColumnMajor => Box::new(0..rank),
            _ => Box::new((0..rank).rev()),
        };
        for d in dims {
            if cur[d] < self.sub_rect.hi[d] {
                cur[d] += 1;
                return;
            }
            cur[d] = self.sub_rect.lo[d];
        }
        self.cursor = None;
    }

    /// Whether the cell at an intra-tile position falls inside the region
    /// being filled.
    fn cell_in_region(&self, pos: u64, tile_region: &RectU64, fill_region: &RectU64) -> bool {
        let cell: Vec<u64> = self
            .grid
            .pos_to_intra(pos)
            .iter()
            .zip(&tile_region.lo)
            .map(|(&intra, &lo)| lo + intra)
            .collect();
        fill_region.contains(&cell)
    }

    async fn ensure_merged(&mut self, tile_id: u64) -> Result<()> {
        if self.merged.contains_key(&tile_id) {
            return Ok(());
        }
        let tile_region = self.grid.tile_region(tile_id);
        let fill_region = tile_region
            .intersect(&self.sub_rect)
            .expect("tile comes from the subarray walk");
        let cap = self.grid.tile_capacity() as usize;

        let mut attrs: Vec<MergedAttr> = self
            .attrs
            .iter()
            .map(|a| match a {
                RequestedAttr::Fixed { cell_size, .. } => MergedAttr::Fixed {
                    cell_size: *cell_size,
                    data: vec![0u8; cap * cell_size],
                },
                RequestedAttr::Var { .. } => MergedAttr::Var {
                    cells: vec![None; cap],
                },
                RequestedAttr::Coords => unreachable!("rejected for dense arrays"),
            })
            .collect();

        // Tile-aligned fragments cover whole tiles, so the newest fragment
        // touching this tile supersedes all older ones here.
        for frag in &self.frags {
            let fregion = frag.region().expect("dense fragment");
            if tile_region.intersect(fregion).is_none() {
                continue;
            }
            let fgrid = frag.grid().expect("dense fragment");
            let ftile_coords: Vec<u64> = tile_region
                .lo
                .iter()
                .zip(fgrid.origin().iter().zip(fgrid.extents()))
                .map(|(&lo, (&origin, &extent))| (lo - origin) / extent)
                .collect();
            let ftile = fgrid.tile_id(&ftile_coords);

            // Walk the intra-tile cell order, skipping cells outside the
            // fill region.
            for (slot, req) in self.attrs.iter().enumerate() {
                match req {
                    RequestedAttr::Fixed {
                        first_file,
                        cell_size,
                    } => {
                        let payload = frag.tile_bytes(*first_file, ftile).await?;
                        let MergedAttr::Fixed { data, .. } = &mut attrs[slot] else {
                            unreachable!()
                        };
                        for pos in 0..cap as u64 {
                            if !self.cell_in_region(pos, &tile_region, &fill_region) {
                                continue;
                            }
                            let value = fixed_cell(&payload, pos, *cell_size);
                            data[pos as usize * cell_size..(pos as usize + 1) * cell_size]
                                .copy_from_slice(value);
                        }
                    }
                    RequestedAttr::Var { first_file } => {
                        let offsets = frag.tile_bytes(*first_file, ftile).await?;
                        let values = frag.tile_bytes(*first_file + 1, ftile).await?;
                        let MergedAttr::Var { cells } = &mut attrs[slot] else {
                            unreachable!()
                        };
                        for pos in 0..cap as u64 {
                            if !self.cell_in_region(pos, &tile_region, &fill_region) {
                                continue;
                            }
                            cells[pos as usize] =
                                Some(var_cell(&offsets, &values, pos).to_vec());
                        }
                    }
                    RequestedAttr::Coords => unreachable!(),
                }
            }
            break;
        }

        self.merged.insert(tile_id, MergedTile { attrs });
        Ok(())
    }

    /// Emit cells until the buffers fill or the subarray is exhausted;
    /// returns true when exhausted.
    async fn fill(&mut self, buffers: &mut [ReadBuffer]) -> Result<bool> {
        let mut emitted = false;
        loop {
            let Some(cell) = self.cursor.clone() else {
                return Ok(true);
            };
            let (tile_id, pos) = self.grid.locate(&cell);
            self.ensure_merged(tile_id).await?;
            let tile = &self.merged[&tile_id];

            // All of the cell's values must fit to emit it at all.
            let fits = tile.attrs.iter().zip(buffers.iter()).all(|(merged, buf)| {
                match merged {
                    MergedAttr::Fixed { cell_size, .. } => buf.fits(*cell_size, false),
                    MergedAttr::Var { cells } => {
                        let len = cells[pos as usize].as_deref().unwrap_or(&[]).len();
                        buf.fits(len, true)
                    }
                }
            });
            if !fits {
                if !emitted {
                    return Err(StorageError::Capacity(
                        "result buffers cannot hold a single cell".to_string(),
                    ));
                }
                return Ok(false);
            }

            for (slot, merged) in tile.attrs.iter().enumerate() {
                match merged {
                    MergedAttr::Fixed { cell_size, data } => {
                        let value = &data[pos as usize * cell_size..(pos as usize + 1) * cell_size];
                        buffers[slot].push(value, false);
                    }
                    MergedAttr::Var { cells } => {
                        let value = cells[pos as usize].as_deref().unwrap_or(&[]);
                        buffers[slot].push(value, true);
                    }
                }
            }
            emitted = true;
            self.step();
        }
    }
}

struct SparseCursor {
    tiles: Vec<u64>,
    tile_idx: usize,
    cell: u64,
    coords: Option<Bytes>,
    count: u64,
}

struct HeapEntry {
    key: Vec<u64>,
    /// Position in the newest-first fragment list; smaller is newer.
    rank: usize,
    tile: u64,
    cell: u64,
    coords: Vec<u8>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.rank == other.rank
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap; reverse so the smallest (key, rank) pops first.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.rank.cmp(&self.rank))
    }
}

struct SparseRead {
    schema: Arc<ArraySchema>,
    sub: Subarray,
    order: crate::coords::GlobalCellOrder,
    frags: Vec<FragmentReader>,
    cursors: Vec<SparseCursor>,
    heap: BinaryHeap<HeapEntry>,
    last: Option<Vec<u8>>,
}

impl SparseRead {
    async fn new(
        schema: Arc<ArraySchema>,
        _attrs: Vec<RequestedAttr>,
        frags: Vec<FragmentReader>,
        sub: Subarray,
    ) -> Result<Self> {
        let order = schema.global_order();
        let cursors = frags
            .iter()
            .map(|f| SparseCursor {
                tiles: f.sparse_tiles_intersecting(&sub),
                tile_idx: 0,
                cell: 0,
                coords: None,
                count: 0,
            })
            .collect();
        let mut read = Self {
            schema,
            sub,
            order,
            frags,
            cursors,
            heap: BinaryHeap::new(),
            last: None,
        };
        for rank in 0..read.frags.len() {
            read.refill(rank).await?;
        }
        Ok(read)
    }

    /// Advance one fragment cursor to its next in-subarray cell and push it
    /// onto the queue.
    async fn refill(&mut self, rank: usize) -> Result<()> {
        let coords_size = self.schema.coords_size();
        loop {
            let cursor = &mut self.cursors[rank];
            if cursor.coords.is_none() {
                let Some(&tile) = cursor.tiles.get(cursor.tile_idx) else {
                    return Ok(());
                };
                let frag = &self.frags[rank];
                let payload = frag.coords_tile(tile).await?;
                let cursor = &mut self.cursors[rank];
                cursor.count = self.frags[rank].cell_count(tile);
                cursor.coords = Some(payload);
                cursor.cell = 0;
            }
            let cursor = &mut self.cursors[rank];
            let coords = cursor.coords.as_ref().expect("loaded above").clone();
            while cursor.cell < cursor.count {
                let at = cursor.cell as usize * coords_size;
                let tuple = &coords[at..at + coords_size];
                cursor.cell += 1;
                if self.sub.contains(tuple) {
                    let entry = HeapEntry {
                        key: self.order.key(tuple),
                        rank,
                        tile: cursor.tiles[cursor.tile_idx],
                        cell: cursor.cell - 1,
                        coords: tuple.to_vec(),
                    };
                    self.heap.push(entry);
                    return Ok(());
                }
            }
            cursor.coords = None;
            cursor.tile_idx += 1;
        }
    }

    /// Value bytes of one cell for one requested attribute.
    async fn cell_value(
        &self,
        req: &RequestedAttr,
        entry: &HeapEntry,
    ) -> Result<Vec<u8>> {
        let frag = &self.frags[entry.rank];
        Ok(match req {
            RequestedAttr::Coords => entry.coords.clone(),
            RequestedAttr::Fixed {
                first_file,
                cell_size,
            } => {
                let payload = frag.tile_bytes(*first_file, entry.tile).await?;
                fixed_cell(&payload, entry.cell, *cell_size).to_vec()
            }
            RequestedAttr::Var { first_file } => {
                let offsets = frag.tile_bytes(*first_file, entry.tile).await?;
                let values = frag.tile_bytes(*first_file + 1, entry.tile).await?;
                var_cell(&offsets, &values, entry.cell).to_vec()
            }
        })
    }

    async fn fill(
        &mut self,
        attrs: &[RequestedAttr],
        buffers: &mut [ReadBuffer],
    ) -> Result<bool> {
        let mut emitted = false;
        loop {
            let Some(entry) = self.heap.pop() else {
                return Ok(true);
            };
            // Newer fragments win at equal coordinates; everything older is
            // discarded.
            if self.last.as_deref() == Some(entry.coords.as_slice()) {
                self.refill(entry.rank).await?;
                continue;
            }

            let mut values = Vec::with_capacity(attrs.len());
            for req in attrs {
                values.push(self.cell_value(req, &entry).await?);
            }
            let fits = attrs
                .iter()
                .zip(buffers.iter())
                .zip(&values)
                .all(|((req, buf), value)| buf.fits(value.len(), req.is_var()));
            if !fits {
                if !emitted {
                    return Err(StorageError::Capacity(
                        "result buffers cannot hold a single cell".to_string(),
                    ));
                }
                self.heap.push(entry);
                return Ok(false);
            }
            for ((req, buf), value) in attrs.iter().zip(buffers.iter_mut()).zip(&values) {
                buf.push(value, req.is_var());
            }
            emitted = true;
            self.last = Some(entry.coords.clone());
            self.refill(entry.rank).await?;
        }
    }
}
