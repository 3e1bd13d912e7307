//! Array schema: dimensions, attributes, domain, tiling, persistence
//!
//! The schema is created once, validated, persisted as a single binary
//! record (`__array_schema.tdb`) in the array directory, and cached for the
//! lifetime of the array handle.

use crate::compression::{Compressor, CompressorSpec};
use crate::coords::{DenseGrid, GlobalCellOrder, Order};
use crate::error::{Result, StorageError};
use crate::types::{coord_as_i128, coord_cmp, CellValNum, CoordScalar, Datatype};
use crate::utils::{RecordReader, RecordWriter};
use crate::{FORMAT_VERSION, SCHEMA_MAGIC};

/// Reserved name of the coordinate pseudo-attribute of sparse arrays.
pub const COORDS_ATTR: &str = "__coords";

/// Dense or sparse array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArrayType {
    Dense = 0,
    Sparse = 1,
}

impl ArrayType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ArrayType::Dense),
            1 => Some(ArrayType::Sparse),
            _ => None,
        }
    }
}

/// A named value carrier with element type, cell multiplicity and codec.
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: CellValNum,
    compressor: CompressorSpec,
}

impl Attribute {
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Fixed(1),
            compressor: CompressorSpec::none(),
        }
    }

    /// Fixed number of values per cell.
    pub fn with_cell_val_num(mut self, k: u32) -> Self {
        self.cell_val_num = CellValNum::Fixed(k);
        self
    }

    /// Variable number of values per cell.
    pub fn var_sized(mut self) -> Self {
        self.cell_val_num = CellValNum::Var;
        self
    }

    pub fn with_compressor(mut self, codec: Compressor, level: i32) -> Self {
        self.compressor = CompressorSpec::new(codec, level);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn cell_val_num(&self) -> CellValNum {
        self.cell_val_num
    }

    pub fn compressor(&self) -> CompressorSpec {
        self.compressor
    }

    pub fn is_var(&self) -> bool {
        self.cell_val_num.is_var()
    }

    /// Bytes per cell for fixed-multiplicity attributes.
    pub fn cell_size(&self) -> Option<usize> {
        match self.cell_val_num {
            CellValNum::Fixed(k) => Some(self.datatype.size() * k as usize),
            CellValNum::Var => None,
        }
    }
}

/// Immutable definition of an array.
#[derive(Debug, Clone)]
pub struct ArraySchema {
    array_type: ArrayType,
    dim_names: Vec<String>,
    coords_type: Datatype,
    domain: Vec<u8>,
    tile_extents: Option<Vec<u8>>,
    cell_order: Order,
    tile_order: Order,
    capacity: u64,
    attributes: Vec<Attribute>,
}

impl ArraySchema {
    pub fn builder(array_type: ArrayType) -> ArraySchemaBuilder {
        ArraySchemaBuilder::new(array_type)
    }

    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn is_dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    pub fn rank(&self) -> usize {
        self.dim_names.len()
    }

    pub fn dim_names(&self) -> &[String] {
        &self.dim_names
    }

    pub fn coords_type(&self) -> Datatype {
        self.coords_type
    }

    /// Byte size of one full coordinate tuple.
    pub fn coords_size(&self) -> usize {
        self.rank() * self.coords_type.size()
    }

    /// The domain box `[lo0,hi0,lo1,hi1,..]` in raw coordinate bytes.
    pub fn domain(&self) -> &[u8] {
        &self.domain
    }

    pub fn dim_lo(&self, d: usize) -> &[u8] {
        let size = self.coords_type.size();
        &self.domain[2 * d * size..2 * d * size + size]
    }

    pub fn dim_hi(&self, d: usize) -> &[u8] {
        let size = self.coords_type.size();
        &self.domain[(2 * d + 1) * size..(2 * d + 1) * size + size]
    }

    pub fn tile_extents(&self) -> Option<&[u8]> {
        self.tile_extents.as_deref()
    }

    pub fn cell_order(&self) -> Order {
        self.cell_order
    }

    pub fn tile_order(&self) -> Order {
        self.tile_order
    }

    /// Sparse tile capacity in cells.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name() == name)
    }

    /// Number of cells along each dimension (integer domains).
    pub fn domain_shape(&self) -> Result<Vec<u64>> {
        let size = self.coords_type.size();
        let mut shape = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            let lo = coord_as_i128(self.coords_type, &self.domain[2 * d * size..])?;
            let hi = coord_as_i128(self.coords_type, &self.domain[(2 * d + 1) * size..])?;
            shape.push((hi - lo + 1) as u64);
        }
        Ok(shape)
    }

    /// Tile extents as cell counts (integer domains).
    pub fn extent_shape(&self) -> Result<Vec<u64>> {
        let extents = self.tile_extents.as_ref().ok_or_else(|| {
            StorageError::InvalidArgument("array has no tile extents".to_string())
        })?;
        let size = self.coords_type.size();
        let mut shape = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            shape.push(coord_as_i128(self.coords_type, &extents[d * size..])? as u64);
        }
        Ok(shape)
    }

    /// The tile grid over the full domain of a dense array.
    pub fn dense_grid(&self) -> Result<DenseGrid> {
        DenseGrid::new(
            vec![0; self.rank()],
            self.domain_shape()?,
            self.extent_shape()?,
            self.tile_order,
            self.cell_order,
        )
    }

    /// The global cell order comparator of a sparse array.
    pub fn global_order(&self) -> GlobalCellOrder {
        GlobalCellOrder::new(self.coords_type, self.rank(), self.cell_order, &self.domain)
    }

    fn validate(&self) -> Result<()> {
        if self.dim_names.is_empty() {
            return Err(StorageError::InvalidArgument(
                "array needs at least one dimension".to_string(),
            ));
        }
        if !self.coords_type.is_coordinate_type() {
            return Err(StorageError::InvalidArgument(format!(
                "{} is not a coordinate type",
                self.coords_type
            )));
        }
        if self.attributes.is_empty() {
            return Err(StorageError::InvalidArgument(
                "array needs at least one attribute".to_string(),
            ));
        }
        for (i, a) in self.attributes.iter().enumerate() {
            if a.name().is_empty() || a.name() == COORDS_ATTR {
                return Err(StorageError::InvalidArgument(format!(
                    "attribute name {:?} is reserved",
                    a.name()
                )));
            }
            if let CellValNum::Fixed(0) = a.cell_val_num() {
                return Err(StorageError::InvalidArgument(format!(
                    "attribute {} has zero values per cell",
                    a.name()
                )));
            }
            if self.attributes[..i].iter().any(|b| b.name() == a.name()) {
                return Err(StorageError::InvalidArgument(format!(
                    "duplicate attribute name {}",
                    a.name()
                )));
            }
        }
        let size = self.coords_type.size();
        for d in 0..self.rank() {
            if coord_cmp(self.coords_type, self.dim_lo(d), self.dim_hi(d)) == std::cmp::Ordering::Greater {
                return Err(StorageError::InvalidArgument(format!(
                    "dimension {} has an inverted domain",
                    self.dim_names[d]
                )));
            }
        }
        if self.tile_order == Order::Hilbert {
            return Err(StorageError::InvalidArgument(
                "hilbert tile order is not supported".to_string(),
            ));
        }

        match self.array_type {
            ArrayType::Dense => {
                if !self.coords_type.is_integer() {
                    return Err(StorageError::InvalidArgument(
                        "dense arrays require an integer coordinate type".to_string(),
                    ));
                }
                if self.cell_order == Order::Hilbert {
                    return Err(StorageError::InvalidArgument(
                        "hilbert cell order is only supported for sparse arrays".to_string(),
                    ));
                }
                let extents = self.tile_extents.as_ref().ok_or_else(|| {
                    StorageError::InvalidArgument(
                        "dense arrays require tile extents".to_string(),
                    )
                })?;
                for d in 0..self.rank() {
                    let e = coord_as_i128(self.coords_type, &extents[d * size..])?;
                    let lo = coord_as_i128(self.coords_type, self.dim_lo(d))?;
                    let hi = coord_as_i128(self.coords_type, self.dim_hi(d))?;
                    let span = hi - lo + 1;
                    if e <= 0 {
                        return Err(StorageError::InvalidArgument(format!(
                            "tile extent on dimension {} must be positive",
                            self.dim_names[d]
                        )));
                    }
                    if span % e != 0 {
                        return Err(StorageError::InvalidArgument(format!(
                            "tile extent {} does not divide the {} cells of dimension {}",
                            e, span, self.dim_names[d]
                        )));
                    }
                }
            }
            ArrayType::Sparse => {
                if self.capacity == 0 {
                    return Err(StorageError::InvalidArgument(
                        "sparse arrays require capacity > 0".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Serialize to the on-disk binary record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.write_u32(SCHEMA_MAGIC);
        w.write_u32(FORMAT_VERSION);
        w.write_u8(self.array_type as u8);
        w.write_u32(self.rank() as u32);
        for name in &self.dim_names {
            w.write_len_prefixed(name.as_bytes());
        }
        w.write_u8(self.coords_type as u8);
        w.write_bytes(&self.domain);
        match &self.tile_extents {
            Some(extents) => w.write_bytes(extents),
            // Absent extents serialize as zero bytes of the coordinate type.
            None => w.write_bytes(&vec![0u8; self.rank() * self.coords_type.size()]),
        }
        w.write_u8(self.cell_order as u8);
        w.write_u8(self.tile_order as u8);
        w.write_u64(self.capacity);
        w.write_u32(self.attributes.len() as u32);
        for a in &self.attributes {
            w.write_len_prefixed(a.name().as_bytes());
            w.write_u8(a.datatype() as u8);
            w.write_u32(a.cell_val_num().to_u32());
            w.write_u8(a.compressor().codec as u8);
            w.write_i32(a.compressor().level);
        }
        w.into_bytes()
    }

    /// Deserialize from the on-disk binary record.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = RecordReader::new(bytes);
        let magic = r.read_u32()?;
        if magic != SCHEMA_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad schema magic {magic:#010x}"
            )));
        }
        let version = r.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported schema version {version}"
            )));
        }
        let array_type = ArrayType::from_u8(r.read_u8()?)
            .ok_or_else(|| StorageError::Corruption("bad array type".to_string()))?;
        let rank = r.read_u32()? as usize;
        let mut dim_names = Vec::with_capacity(rank);
        for _ in 0..rank {
            let raw = r.read_len_prefixed()?;
            let name = String::from_utf8(raw.to_vec())
                .map_err(|_| StorageError::Corruption("dimension name not utf-8".to_string()))?;
            dim_names.push(name);
        }
        let coords_type = Datatype::from_u8(r.read_u8()?)
            .ok_or_else(|| StorageError::Corruption("bad coordinate type".to_string()))?;
        let size = coords_type.size();
        let domain = r.read_bytes(2 * rank * size)?.to_vec();
        let extents_raw = r.read_bytes(rank * size)?.to_vec();
        let tile_extents = if extents_raw.iter().all(|&b| b == 0) {
            None
        } else {
            Some(extents_raw)
        };
        let cell_order = Order::from_u8(r.read_u8()?)
            .ok_or_else(|| StorageError::Corruption("bad cell order".to_string()))?;
        let tile_order = Order::from_u8(r.read_u8()?)
            .ok_or_else(|| StorageError::Corruption("bad tile order".to_string()))?;
        let capacity = r.read_u64()?;
        let n_attrs = r.read_u32()? as usize;
        let mut attributes = Vec::with_capacity(n_attrs);
        for _ in 0..n_attrs {
            let raw = r.read_len_prefixed()?;
            let name = String::from_utf8(raw.to_vec())
                .map_err(|_| StorageError::Corruption("attribute name not utf-8".to_string()))?;
            let datatype = Datatype::from_u8(r.read_u8()?)
                .ok_or_else(|| StorageError::Corruption("bad attribute type".to_string()))?;
            let cell_val_num = CellValNum::from_u32(r.read_u32()?);
            let codec = Compressor::from_u8(r.read_u8()?)
                .ok_or_else(|| StorageError::Corruption("bad compressor id".to_string()))?;
            let level = r.read_i32()?;
            attributes.push(Attribute {
                name,
                datatype,
                cell_val_num,
                compressor: CompressorSpec::new(codec, level),
            });
        }

        let schema = Self {
            array_type,
            dim_names,
            coords_type,
            domain,
            tile_extents,
            cell_order,
            tile_order,
            capacity,
            attributes,
        };
        schema.validate().map_err(|e| {
            StorageError::Corruption(format!("stored schema fails validation: {e}"))
        })?;
        Ok(schema)
    }
}

/// Declarative schema construction; `build` runs creation-time validation.
pub struct ArraySchemaBuilder {
    array_type: ArrayType,
    dim_names: Vec<String>,
    coords_type: Option<Datatype>,
    domain: Vec<u8>,
    tile_extents: Vec<u8>,
    has_extents: bool,
    missing_extents: bool,
    cell_order: Order,
    tile_order: Order,
    capacity: u64,
    attributes: Vec<Attribute>,
    error: Option<StorageError>,
}

impl ArraySchemaBuilder {
    fn new(array_type: ArrayType) -> Self {
        Self {
            array_type,
            dim_names: Vec::new(),
            coords_type: None,
            domain: Vec::new(),
            tile_extents: Vec::new(),
            has_extents: false,
            missing_extents: false,
            cell_order: Order::RowMajor,
            tile_order: Order::RowMajor,
            capacity: 10_000,
            attributes: Vec::new(),
            error: None,
        }
    }

    /// Add a dimension with domain `[lo, hi]` and an optional tile extent.
    /// All dimensions share one coordinate type.
    pub fn dimension<T: CoordScalar>(
        mut self,
        name: impl Into<String>,
        lo: T,
        hi: T,
        extent: Option<T>,
    ) -> Self {
        match self.coords_type {
            None => self.coords_type = Some(T::DATATYPE),
            Some(dt) if dt != T::DATATYPE => {
                self.error = Some(StorageError::InvalidArgument(format!(
                    "dimension coordinate type {} conflicts with {}",
                    T::DATATYPE,
                    dt
                )));
                return self;
            }
            _ => {}
        }
        self.dim_names.push(name.into());
        lo.write_le(&mut self.domain);
        hi.write_le(&mut self.domain);
        match extent {
            Some(e) => {
                self.has_extents = true;
                e.write_le(&mut self.tile_extents);
            }
            None => {
                self.missing_extents = true;
                let mut zero = vec![0u8; T::DATATYPE.size()];
                self.tile_extents.append(&mut zero);
            }
        }
        self
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn cell_order(mut self, order: Order) -> Self {
        self.cell_order = order;
        self
    }

    pub fn tile_order(mut self, order: Order) -> Self {
        self.tile_order = order;
        self
    }

    /// Sparse tile capacity in cells.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ArraySchema> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.has_extents && self.missing_extents {
            return Err(StorageError::InvalidArgument(
                "tile extents must be set on all dimensions or none".to_string(),
            ));
        }
        let schema = ArraySchema {
            array_type: self.array_type,
            dim_names: self.dim_names,
            coords_type: self.coords_type.unwrap_or(Datatype::Int64),
            domain: self.domain,
            tile_extents: self.has_extents.then_some(self.tile_extents),
            cell_order: self.cell_order,
            tile_order: self.tile_order,
            capacity: self.capacity,
            attributes: self.attributes,
        };
        schema.validate()?;
        Ok(schema)
    }
}
