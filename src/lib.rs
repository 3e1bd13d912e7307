//! tilestore - tiled multi-dimensional array storage
//!
//! A storage engine for dense and sparse multi-dimensional arrays. Logical
//! cell coordinates are mapped onto fixed-capacity tiles, compressed, and
//! written as append-only *fragments* over a pluggable virtual filesystem
//! (local POSIX, Azure Blob, GCS, optionally HDFS).
//!
//! # Features
//!
//! - Dense and sparse arrays with row-major, column-major and (sparse)
//!   hilbert cell orders
//! - Fixed and variable-length attributes with per-attribute compression
//!   (gzip, zstd, lz4, blosc-style shuffle, RLE)
//! - Crash-safe fragment commits: a fragment is visible only after its
//!   `.ok` sentinel, so interrupted writes leave the array unchanged
//! - Reads merge overlapping fragments newest-first and stream cells in
//!   the array's cell order
//! - Consolidation folds the fragment history into a single fragment
//!
//! # Example
//!
//! ```rust,ignore
//! use tilestore::{Array, ArraySchema, ArrayType, Attribute, Context, Config, Datatype, WriteMode};
//!
//! # async fn example() -> tilestore::Result<()> {
//! let ctx = Context::new(Config::from_env())?;
//! let schema = ArraySchema::builder(ArrayType::Dense)
//!     .dimension("rows", 0i64, 3, Some(2))
//!     .dimension("cols", 0i64, 3, Some(2))
//!     .attribute(Attribute::new("v", Datatype::Int32))
//!     .build()?;
//! Array::create(&ctx, "/data/arrays/example", schema).await?;
//!
//! let array = Array::open(&ctx, "/data/arrays/example").await?;
//! let mut writer = array.writer(WriteMode::DenseOrdered, &["v"]).await?;
//! // writer.submit(...) in global order, then:
//! writer.finalize().await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod compression;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod coords;
pub mod error;
pub mod fragment;
pub mod hilbert;
pub mod io;
pub mod read;
pub mod schema;
pub mod sort;
pub mod tile;
pub mod types;
pub mod utils;

// Re-exports
pub use access::Array;
pub use compression::{Compressor, CompressorSpec};
pub use config::Config;
pub use consolidation::consolidate;
pub use context::Context;
pub use coords::{Order, Subarray};
pub use error::{Result, StorageError};
pub use fragment::writer::{ArrayWriter, AttributeData, WriteBuffers, WriteMode};
pub use read::{ArrayReader, BuffersFilled, ReadBuffer};
pub use schema::{ArraySchema, ArrayType, Attribute, COORDS_ATTR};
pub use types::{CellValNum, Datatype};

/// Version of the tilestore implementation.
pub const TILESTORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// On-disk format version; bumped when the schema, book-keeping or frame
/// layout changes (including codec additions).
pub const FORMAT_VERSION: u32 = 1;

/// Magic of the serialized array schema record.
pub const SCHEMA_MAGIC: u32 = u32::from_le_bytes(*b"TDBS");

/// Magic of the serialized book-keeping record.
pub const BOOKKEEPING_MAGIC: u32 = u32::from_le_bytes(*b"TDBK");

/// Schema file inside the array directory.
pub const ARRAY_SCHEMA_FILE: &str = "__array_schema.tdb";

/// Visibility sentinel inside a fragment directory.
pub const FRAGMENT_OK_FILE: &str = "__tiledb_fragment.ok";

/// Book-keeping file inside a fragment directory (gzip-compressed).
pub const BOOKKEEPING_FILE: &str = "__book_keeping.tdb";

/// Coordinates file of sparse fragments.
pub const COORDS_FILE: &str = "__coords.tdb";

/// Advisory lock file inside the array directory.
pub const CONSOLIDATION_LOCK_FILE: &str = "__consolidation_lock";

/// Suffix of every data file.
pub const FILE_SUFFIX: &str = ".tdb";

/// Infix of the values file of variable-length attributes.
pub const VAR_FILE_SUFFIX: &str = "_var";
