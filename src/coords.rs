//! Coordinate algebra: cell and tile orders, tile grids, subarray math
//!
//! Dense arithmetic happens in offset space: coordinates are mapped to
//! unsigned offsets from the domain low corner, so tile ids and intra-tile
//! positions are plain stride calculations. Sparse arrays keep raw typed
//! coordinate tuples and compare them through order-preserving key words.

use std::cmp::Ordering;

use crate::error::{Result, StorageError};
use crate::hilbert;
use crate::types::{coord_as_f64, coord_as_i128, coord_cmp, coord_order_word, Datatype};

/// Traversal order for cells within a tile and for tiles within the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Order {
    RowMajor = 0,
    ColumnMajor = 1,
    Hilbert = 2,
}

impl Order {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Order::RowMajor),
            1 => Some(Order::ColumnMajor),
            2 => Some(Order::Hilbert),
            _ => None,
        }
    }
}

/// Closed axis-aligned box in offset space, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RectU64 {
    pub lo: Vec<u64>,
    pub hi: Vec<u64>,
}

impl RectU64 {
    pub fn new(lo: Vec<u64>, hi: Vec<u64>) -> Self {
        debug_assert_eq!(lo.len(), hi.len());
        Self { lo, hi }
    }

    pub fn rank(&self) -> usize {
        self.lo.len()
    }

    pub fn volume(&self) -> u64 {
        self.lo
            .iter()
            .zip(&self.hi)
            .map(|(&lo, &hi)| hi - lo + 1)
            .product()
    }

    pub fn contains(&self, cell: &[u64]) -> bool {
        cell.iter()
            .zip(self.lo.iter().zip(&self.hi))
            .all(|(&c, (&lo, &hi))| c >= lo && c <= hi)
    }

    pub fn intersect(&self, other: &RectU64) -> Option<RectU64> {
        let mut lo = Vec::with_capacity(self.rank());
        let mut hi = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            let l = self.lo[d].max(other.lo[d]);
            let h = self.hi[d].min(other.hi[d]);
            if l > h {
                return None;
            }
            lo.push(l);
            hi.push(h);
        }
        Some(RectU64::new(lo, hi))
    }
}

/// Odometer over the cells of a rect, in row- or column-major order.
pub struct OrderedCellIter {
    lo: Vec<u64>,
    hi: Vec<u64>,
    cur: Vec<u64>,
    order: Order,
    started: bool,
    done: bool,
}

impl OrderedCellIter {
    pub fn new(rect: &RectU64, order: Order) -> Self {
        debug_assert!(order != Order::Hilbert, "hilbert rect iteration unsupported");
        Self {
            lo: rect.lo.clone(),
            hi: rect.hi.clone(),
            cur: rect.lo.clone(),
            order,
            started: false,
            done: rect.lo.is_empty(),
        }
    }

    /// Step to the next cell; the returned slice is valid until the next call.
    pub fn advance(&mut self) -> Option<&[u64]> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(&self.cur);
        }

        let rank = self.cur.len();
        // Row-major spins the last dimension fastest, column-major the first.
        let dims: Box<dyn Iterator<Item = usize>> = match self.order {
            Order::ColumnMajor => Box::new(0..rank),
            _ => Box::new((0..rank).rev()),
        };
        for d in dims {
            if self.cur[d] < self.hi[d] {
                self.cur[d] += 1;
                return Some(&self.cur);
            }
            self.cur[d] = self.lo[d];
        }
        self.done = true;
        None
    }
}

/// A tile grid over a rectangular region of offset space.
///
/// The array itself is a grid anchored at the domain low corner; every dense
/// fragment is a grid over its tile-aligned subregion with the same extents,
/// so fragment tiles coincide with array tiles.
#[derive(Debug, Clone)]
pub struct DenseGrid {
    origin: Vec<u64>,
    shape: Vec<u64>,
    extents: Vec<u64>,
    tiles: Vec<u64>,
    tile_order: Order,
    cell_order: Order,
}

impl DenseGrid {
    pub fn new(
        origin: Vec<u64>,
        shape: Vec<u64>,
        extents: Vec<u64>,
        tile_order: Order,
        cell_order: Order,
    ) -> Result<Self> {
        if shape.len() != extents.len() || shape.len() != origin.len() || shape.is_empty() {
            return Err(StorageError::InvalidArgument(
                "mismatched grid dimensionality".to_string(),
            ));
        }
        let mut tiles = Vec::with_capacity(shape.len());
        for (d, (&n, &e)) in shape.iter().zip(&extents).enumerate() {
            if e == 0 || n % e != 0 {
                return Err(StorageError::InvalidArgument(format!(
                    "extent {e} does not divide the region of {n} cells along dimension {d}"
                )));
            }
            tiles.push(n / e);
        }
        Ok(Self {
            origin,
            shape,
            extents,
            tiles,
            tile_order,
            cell_order,
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn origin(&self) -> &[u64] {
        &self.origin
    }

    pub fn extents(&self) -> &[u64] {
        &self.extents
    }

    /// Cells per tile.
    pub fn tile_capacity(&self) -> u64 {
        self.extents.iter().product()
    }

    pub fn tile_count(&self) -> u64 {
        self.tiles.iter().product()
    }

    /// The region this grid covers, in absolute offsets.
    pub fn region(&self) -> RectU64 {
        let hi = self
            .origin
            .iter()
            .zip(&self.shape)
            .map(|(&o, &n)| o + n - 1)
            .collect();
        RectU64::new(self.origin.clone(), hi)
    }

    fn tile_strides(&self) -> Vec<u64> {
        strides(&self.tiles, self.tile_order)
    }

    /// Sequence number of a tile (grid-relative tile coordinates) under the
    /// tile order.
    pub fn tile_id(&self, tile_coords: &[u64]) -> u64 {
        let strides = self.tile_strides();
        tile_coords
            .iter()
            .zip(&strides)
            .map(|(&c, &s)| c * s)
            .sum()
    }

    /// Grid-relative tile coordinates of a tile sequence number.
    pub fn tile_coords(&self, tile_id: u64) -> Vec<u64> {
        unflatten(tile_id, &self.tiles, self.tile_order)
    }

    /// Absolute offset-space rect covered by a tile.
    pub fn tile_region(&self, tile_id: u64) -> RectU64 {
        let coords = self.tile_coords(tile_id);
        let lo: Vec<u64> = coords
            .iter()
            .zip(self.extents.iter().zip(&self.origin))
            .map(|(&t, (&e, &o))| o + t * e)
            .collect();
        let hi = lo.iter().zip(&self.extents).map(|(&l, &e)| l + e - 1).collect();
        RectU64::new(lo, hi)
    }

    /// Map an absolute cell offset to its tile sequence number and cell
    /// position within that tile.
    pub fn locate(&self, cell: &[u64]) -> (u64, u64) {
        let mut tile_coords = Vec::with_capacity(self.rank());
        let mut intra = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            let rel = cell[d] - self.origin[d];
            tile_coords.push(rel / self.extents[d]);
            intra.push(rel % self.extents[d]);
        }
        (self.tile_id(&tile_coords), self.cell_pos(&intra))
    }

    /// Position of a cell inside a tile from its intra-tile offsets, under
    /// the cell order.
    pub fn cell_pos(&self, intra: &[u64]) -> u64 {
        let strides = strides(&self.extents, self.cell_order);
        intra.iter().zip(&strides).map(|(&c, &s)| c * s).sum()
    }

    /// Intra-tile offsets of a cell position.
    pub fn pos_to_intra(&self, pos: u64) -> Vec<u64> {
        unflatten(pos, &self.extents, self.cell_order)
    }

    /// Tile sequence numbers of the tiles whose region intersects `rect`,
    /// in tile order.
    pub fn tiles_intersecting(&self, rect: &RectU64) -> Vec<u64> {
        let region = self.region();
        let clamped = match region.intersect(rect) {
            Some(r) => r,
            None => return Vec::new(),
        };
        let mut t_lo = Vec::with_capacity(self.rank());
        let mut t_hi = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            t_lo.push((clamped.lo[d] - self.origin[d]) / self.extents[d]);
            t_hi.push((clamped.hi[d] - self.origin[d]) / self.extents[d]);
        }
        let tile_rect = RectU64::new(t_lo, t_hi);
        let mut iter = OrderedCellIter::new(&tile_rect, self.tile_order);
        let mut ids = Vec::new();
        while let Some(tc) = iter.advance() {
            ids.push(self.tile_id(tc));
        }
        ids
    }
}

fn strides(dims: &[u64], order: Order) -> Vec<u64> {
    let rank = dims.len();
    let mut strides = vec![1u64; rank];
    match order {
        Order::ColumnMajor => {
            for d in 1..rank {
                strides[d] = strides[d - 1] * dims[d - 1];
            }
        }
        _ => {
            for d in (0..rank.saturating_sub(1)).rev() {
                strides[d] = strides[d + 1] * dims[d + 1];
            }
        }
    }
    strides
}

fn unflatten(mut id: u64, dims: &[u64], order: Order) -> Vec<u64> {
    let strides = strides(dims, order);
    let mut coords = vec![0u64; dims.len()];
    let dims_by_stride: Box<dyn Iterator<Item = usize>> = match order {
        Order::ColumnMajor => Box::new((0..dims.len()).rev()),
        _ => Box::new(0..dims.len()),
    };
    for d in dims_by_stride {
        coords[d] = id / strides[d];
        id %= strides[d];
    }
    coords
}

/// Normalizes typed coordinates onto the hilbert grid.
#[derive(Debug, Clone)]
pub struct HilbertMap {
    dtype: Datatype,
    rank: usize,
    bits: u32,
    lo_f: Vec<f64>,
    span_f: Vec<f64>,
    lo_i: Option<Vec<i128>>,
    span_i: Option<Vec<u128>>,
}

impl HilbertMap {
    /// `domain` is the 2-rank coordinate box `[lo0,hi0,lo1,hi1,..]`.
    pub fn new(dtype: Datatype, rank: usize, domain: &[u8]) -> Self {
        let size = dtype.size();
        let bits = hilbert::bits_per_dimension(rank);
        let mut lo_f = Vec::with_capacity(rank);
        let mut span_f = Vec::with_capacity(rank);
        let mut lo_i = Vec::with_capacity(rank);
        let mut span_i = Vec::with_capacity(rank);
        let integer = dtype.is_integer();
        for d in 0..rank {
            let lo = &domain[2 * d * size..];
            let hi = &domain[(2 * d + 1) * size..];
            lo_f.push(coord_as_f64(dtype, lo));
            span_f.push((coord_as_f64(dtype, hi) - coord_as_f64(dtype, lo)).max(0.0));
            if integer {
                let l = coord_as_i128(dtype, lo).unwrap_or(0);
                let h = coord_as_i128(dtype, hi).unwrap_or(0);
                lo_i.push(l);
                span_i.push((h - l).max(0) as u128 + 1);
            }
        }
        Self {
            dtype,
            rank,
            bits,
            lo_f,
            span_f,
            lo_i: integer.then_some(lo_i),
            span_i: integer.then_some(span_i),
        }
    }

    /// Hilbert curve position of one coordinate tuple.
    pub fn index(&self, coords: &[u8]) -> u128 {
        let size = self.dtype.size();
        let buckets = if self.bits == 64 {
            u64::MAX as u128 + 1
        } else {
            1u128 << self.bits
        };
        let mut grid = Vec::with_capacity(self.rank);
        for d in 0..self.rank {
            let raw = &coords[d * size..];
            let bucket = match (&self.lo_i, &self.span_i) {
                (Some(lo_i), Some(span_i)) => {
                    let off = (coord_as_i128(self.dtype, raw).unwrap_or(0) - lo_i[d]).max(0) as u128;
                    if span_i[d] <= buckets {
                        off
                    } else {
                        off / span_i[d].div_ceil(buckets)
                    }
                }
                _ => {
                    let span = self.span_f[d];
                    let frac = if span > 0.0 {
                        ((coord_as_f64(self.dtype, raw) - self.lo_f[d]) / span).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    (frac * (buckets - 1) as f64) as u128
                }
            };
            grid.push((bucket.min(buckets - 1)) as u64);
        }
        hilbert::hilbert_index(&grid, self.bits)
    }
}

/// Global cell order of a sparse array: the comparator that sorts cells
/// before they are cut into capacity-sized tiles, and that merges fragment
/// streams at read time. Ties always break on the lexicographic coordinate
/// tuple, making the order total.
#[derive(Debug, Clone)]
pub struct GlobalCellOrder {
    dtype: Datatype,
    rank: usize,
    cell_order: Order,
    hilbert: Option<HilbertMap>,
}

impl GlobalCellOrder {
    pub fn new(dtype: Datatype, rank: usize, cell_order: Order, domain: &[u8]) -> Self {
        let hilbert = (cell_order == Order::Hilbert).then(|| HilbertMap::new(dtype, rank, domain));
        Self {
            dtype,
            rank,
            cell_order,
            hilbert,
        }
    }

    /// Sort key of one coordinate tuple: `u64` words compared
    /// lexicographically.
    pub fn key(&self, coords: &[u8]) -> Vec<u64> {
        let size = self.dtype.size();
        let mut key = Vec::with_capacity(self.rank + 2);
        if let Some(h) = &self.hilbert {
            let index = h.index(coords);
            key.push((index >> 64) as u64);
            key.push(index as u64);
        }
        let dims: Box<dyn Iterator<Item = usize>> = match self.cell_order {
            Order::ColumnMajor => Box::new((0..self.rank).rev()),
            _ => Box::new(0..self.rank),
        };
        for d in dims {
            key.push(coord_order_word(self.dtype, &coords[d * size..]));
        }
        key
    }

    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.key(a).cmp(&self.key(b))
    }
}

/// A subarray request: one inclusive coordinate box `[lo0,hi0,lo1,hi1,..]`
/// in the array's coordinate type.
#[derive(Debug, Clone)]
pub struct Subarray {
    raw: Vec<u8>,
    dtype: Datatype,
    rank: usize,
}

impl Subarray {
    pub fn from_bytes(dtype: Datatype, rank: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 2 * rank * dtype.size() {
            return Err(StorageError::InvalidArgument(format!(
                "subarray of {} bytes does not match {} bounds of type {}",
                bytes.len(),
                2 * rank,
                dtype
            )));
        }
        Ok(Self {
            raw: bytes.to_vec(),
            dtype,
            rank,
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn lo(&self, d: usize) -> &[u8] {
        let size = self.dtype.size();
        &self.raw[2 * d * size..2 * d * size + size]
    }

    pub fn hi(&self, d: usize) -> &[u8] {
        let size = self.dtype.size();
        &self.raw[(2 * d + 1) * size..(2 * d + 1) * size + size]
    }

    /// A subarray with an inverted bound on any dimension selects nothing.
    pub fn is_empty(&self) -> bool {
        (0..self.rank).any(|d| coord_cmp(self.dtype, self.lo(d), self.hi(d)) == Ordering::Greater)
    }

    /// Every bound must lie inside the domain box.
    pub fn validate_within(&self, domain: &[u8]) -> Result<()> {
        let size = self.dtype.size();
        for d in 0..self.rank {
            let dom_lo = &domain[2 * d * size..];
            let dom_hi = &domain[(2 * d + 1) * size..];
            if coord_cmp(self.dtype, self.lo(d), dom_lo) == Ordering::Less
                || coord_cmp(self.dtype, self.hi(d), &dom_hi[..size]) == Ordering::Greater
            {
                return Err(StorageError::InvalidArgument(format!(
                    "subarray bound on dimension {d} lies outside the array domain"
                )));
            }
        }
        Ok(())
    }

    /// Whether a coordinate tuple lies inside the subarray.
    pub fn contains(&self, coords: &[u8]) -> bool {
        let size = self.dtype.size();
        (0..self.rank).all(|d| {
            let c = &coords[d * size..];
            coord_cmp(self.dtype, c, self.lo(d)) != Ordering::Less
                && coord_cmp(self.dtype, &c[..size], self.hi(d)) != Ordering::Greater
        })
    }

    /// Whether a coordinate box (same layout) intersects the subarray.
    pub fn intersects_box(&self, mbr: &[u8]) -> bool {
        let size = self.dtype.size();
        (0..self.rank).all(|d| {
            let box_lo = &mbr[2 * d * size..2 * d * size + size];
            let box_hi = &mbr[(2 * d + 1) * size..(2 * d + 1) * size + size];
            coord_cmp(self.dtype, box_lo, self.hi(d)) != Ordering::Greater
                && coord_cmp(self.dtype, box_hi, self.lo(d)) != Ordering::Less
        })
    }

    /// Offset-space rect relative to an integer domain's low corner.
    pub fn to_offsets(&self, domain: &[u8]) -> Result<RectU64> {
        let size = self.dtype.size();
        let mut lo = Vec::with_capacity(self.rank);
        let mut hi = Vec::with_capacity(self.rank);
        for d in 0..self.rank {
            let dom_lo = coord_as_i128(self.dtype, &domain[2 * d * size..])?;
            lo.push((coord_as_i128(self.dtype, self.lo(d))? - dom_lo) as u64);
            hi.push((coord_as_i128(self.dtype, self.hi(d))? - dom_lo) as u64);
        }
        Ok(RectU64::new(lo, hi))
    }
}
