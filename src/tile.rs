//! In-memory tile buffers filled by the write pipeline

use crate::error::{Result, StorageError};
use crate::utils::typed_data_to_bytes;

/// Buffer for one tile of a fixed-multiplicity attribute.
#[derive(Debug)]
pub struct FixedTile {
    cell_size: usize,
    capacity_cells: u64,
    data: Vec<u8>,
}

impl FixedTile {
    pub fn new(cell_size: usize, capacity_cells: u64) -> Self {
        Self {
            cell_size,
            capacity_cells,
            data: Vec::with_capacity((capacity_cells as usize).saturating_mul(cell_size)),
        }
    }

    pub fn push_cell(&mut self, value: &[u8]) -> Result<()> {
        if value.len() != self.cell_size {
            return Err(StorageError::InvalidArgument(format!(
                "cell value of {} bytes, attribute cell size is {}",
                value.len(),
                self.cell_size
            )));
        }
        debug_assert!(!self.is_full());
        self.data.extend_from_slice(value);
        Ok(())
    }

    pub fn cells(&self) -> u64 {
        (self.data.len() / self.cell_size) as u64
    }

    pub fn is_full(&self) -> bool {
        self.cells() >= self.capacity_cells
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The values stream of this tile.
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

/// Buffer for one tile of a variable-length attribute: an offsets stream
/// (byte start of each cell within the values stream) plus the values.
#[derive(Debug)]
pub struct VarTile {
    capacity_cells: u64,
    offsets: Vec<u64>,
    values: Vec<u8>,
}

impl VarTile {
    pub fn new(capacity_cells: u64) -> Self {
        Self {
            capacity_cells,
            offsets: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn push_cell(&mut self, value: &[u8]) {
        debug_assert!(!self.is_full());
        self.offsets.push(self.values.len() as u64);
        self.values.extend_from_slice(value);
    }

    pub fn cells(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn is_full(&self) -> bool {
        self.cells() >= self.capacity_cells
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The two streams of this tile: little-endian offsets, then values.
    pub fn take_payloads(&mut self) -> (Vec<u8>, Vec<u8>) {
        let offsets = typed_data_to_bytes(&std::mem::take(&mut self.offsets));
        let values = std::mem::take(&mut self.values);
        (offsets, values)
    }
}

/// One attribute's tile buffer, fixed or variable length.
#[derive(Debug)]
pub enum AttrTile {
    Fixed(FixedTile),
    Var(VarTile),
}

impl AttrTile {
    pub fn fixed(cell_size: usize, capacity_cells: u64) -> Self {
        AttrTile::Fixed(FixedTile::new(cell_size, capacity_cells))
    }

    pub fn var(capacity_cells: u64) -> Self {
        AttrTile::Var(VarTile::new(capacity_cells))
    }

    pub fn push_cell(&mut self, value: &[u8]) -> Result<()> {
        match self {
            AttrTile::Fixed(t) => t.push_cell(value),
            AttrTile::Var(t) => {
                t.push_cell(value);
                Ok(())
            }
        }
    }

    pub fn cells(&self) -> u64 {
        match self {
            AttrTile::Fixed(t) => t.cells(),
            AttrTile::Var(t) => t.cells(),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            AttrTile::Fixed(t) => t.is_full(),
            AttrTile::Var(t) => t.is_full(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AttrTile::Fixed(t) => t.is_empty(),
            AttrTile::Var(t) => t.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bytes_to_typed_data;

    #[test]
    fn test_fixed_tile_fill() {
        let mut tile = FixedTile::new(4, 3);
        assert!(tile.is_empty());
        for v in [1i32, 2, 3] {
            tile.push_cell(&v.to_le_bytes()).unwrap();
        }
        assert!(tile.is_full());
        assert_eq!(tile.cells(), 3);
        let payload = tile.take_payload();
        let back: Vec<i32> = bytes_to_typed_data(&payload).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn test_fixed_tile_rejects_wrong_size() {
        let mut tile = FixedTile::new(4, 3);
        assert!(tile.push_cell(&[1, 2]).is_err());
    }

    #[test]
    fn test_var_tile_streams() {
        let mut tile = VarTile::new(10);
        tile.push_cell(b"a");
        tile.push_cell(b"bb");
        tile.push_cell(b"ccc");
        let (offsets, values) = tile.take_payloads();
        let offsets: Vec<u64> = bytes_to_typed_data(&offsets).unwrap();
        assert_eq!(offsets, vec![0, 1, 3]);
        assert_eq!(values, b"abbccc");
    }
}
