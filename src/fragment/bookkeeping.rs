//! Fragment book-keeping: the binary index into a fragment's files
//!
//! One little-endian record per fragment, gzip-compressed at rest inside
//! `__book_keeping.tdb`:
//!
//! ```text
//! [magic u32][version u32][#files u32][#tiles u64]
//! [per file: #tiles x u64 tile offsets]
//! [non-empty domain: 2 * rank coords]
//! [sparse only: per tile MBR, 2 * rank coords]
//! [sparse only: per tile bounds (first and last cell), 2 * rank coords]
//! [per tile: cell count u64]
//! [sparse flag u8]
//! ```
//!
//! The record is the sole authoritative index into its fragment: tile
//! offsets must match the data files bit-exact.

use crate::compression::{decode_frame, encode_frame, Compressor, CompressorSpec};
use crate::error::{Result, StorageError};
use crate::utils::{RecordReader, RecordWriter};
use crate::{BOOKKEEPING_MAGIC, FORMAT_VERSION};

/// Compression applied to the serialized record at rest.
const FILE_CODEC: CompressorSpec = CompressorSpec {
    codec: Compressor::Gzip,
    level: 6,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookkeeping {
    pub sparse: bool,
    pub tile_count: u64,
    /// Byte offset of each tile frame, per attribute file in canonical
    /// order.
    pub file_offsets: Vec<Vec<u64>>,
    /// Coordinate box `[lo0,hi0,..]` covered by this fragment.
    pub non_empty_domain: Vec<u8>,
    /// Sparse: minimum bounding box of each tile's coordinates, inclusive.
    pub mbrs: Vec<Vec<u8>>,
    /// Sparse: first and last coordinate tuple of each tile in cell order.
    pub bounds: Vec<Vec<u8>>,
    pub cell_counts: Vec<u64>,
}

impl Bookkeeping {
    /// Serialize to the raw (uncompressed) record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.write_u32(BOOKKEEPING_MAGIC);
        w.write_u32(FORMAT_VERSION);
        w.write_u32(self.file_offsets.len() as u32);
        w.write_u64(self.tile_count);
        for offsets in &self.file_offsets {
            debug_assert_eq!(offsets.len() as u64, self.tile_count);
            for &offset in offsets {
                w.write_u64(offset);
            }
        }
        w.write_len_prefixed(&self.non_empty_domain);
        if self.sparse {
            for mbr in &self.mbrs {
                w.write_bytes(mbr);
            }
            for bounds in &self.bounds {
                w.write_bytes(bounds);
            }
        }
        for &count in &self.cell_counts {
            w.write_u64(count);
        }
        w.write_u8(self.sparse as u8);
        w.into_bytes()
    }

    /// Parse the raw record; `box_size` is the byte width of one coordinate
    /// box (`2 * rank * coord_size`).
    pub fn deserialize(bytes: &[u8], box_size: usize) -> Result<Self> {
        let mut r = RecordReader::new(bytes);
        let magic = r.read_u32()?;
        if magic != BOOKKEEPING_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad book-keeping magic {magic:#010x}"
            )));
        }
        let version = r.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported book-keeping version {version}"
            )));
        }
        let file_count = r.read_u32()? as usize;
        let tile_count = r.read_u64()?;
        let mut file_offsets = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let mut offsets = Vec::with_capacity(tile_count as usize);
            for _ in 0..tile_count {
                offsets.push(r.read_u64()?);
            }
            file_offsets.push(offsets);
        }
        let non_empty_domain = r.read_len_prefixed()?.to_vec();

        // The sparse flag trails the record; its position is computable from
        // what remains.
        let tail = r.remaining();
        let per_tile_boxes = 8 + 2 * box_size; // cell count + mbr + bounds
        let sparse = if tile_count == 0 {
            // Both layouts coincide for an empty fragment; trust the flag.
            tail == 1 && bytes[bytes.len() - 1] == 1
        } else {
            tail != tile_count as usize * 8 + 1
        };

        let (mbrs, bounds) = if sparse {
            if tail != tile_count as usize * per_tile_boxes + 1 {
                return Err(StorageError::Corruption(format!(
                    "book-keeping record tail of {tail} bytes matches neither dense nor sparse layout"
                )));
            }
            let mut mbrs = Vec::with_capacity(tile_count as usize);
            for _ in 0..tile_count {
                mbrs.push(r.read_bytes(box_size)?.to_vec());
            }
            let mut bounds = Vec::with_capacity(tile_count as usize);
            for _ in 0..tile_count {
                bounds.push(r.read_bytes(box_size)?.to_vec());
            }
            (mbrs, bounds)
        } else {
            (Vec::new(), Vec::new())
        };

        let mut cell_counts = Vec::with_capacity(tile_count as usize);
        for _ in 0..tile_count {
            cell_counts.push(r.read_u64()?);
        }
        let flag = r.read_u8()?;
        if flag > 1 || (flag == 1) != sparse {
            return Err(StorageError::Corruption(format!(
                "book-keeping sparse flag {flag} contradicts the record layout"
            )));
        }
        if r.remaining() != 0 {
            return Err(StorageError::Corruption(format!(
                "{} trailing bytes after book-keeping record",
                r.remaining()
            )));
        }
        Ok(Self {
            sparse,
            tile_count,
            file_offsets,
            non_empty_domain,
            mbrs,
            bounds,
            cell_counts,
        })
    }

    /// Gzip-compressed bytes as stored in `__book_keeping.tdb`.
    pub fn to_file_bytes(&self) -> Result<Vec<u8>> {
        encode_frame(FILE_CODEC, 1, &self.serialize())
    }

    /// Parse the gzip-compressed file content.
    pub fn from_file_bytes(bytes: &[u8], box_size: usize) -> Result<Self> {
        let raw = decode_frame(bytes, 1)?;
        Self::deserialize(&raw, box_size)
    }

    /// Total cells across all tiles.
    pub fn total_cells(&self) -> u64 {
        self.cell_counts.iter().sum()
    }
}
