//! Fragments: append-only units of one write session
//!
//! A fragment is a directory `__<timestamp>_<uuid>` inside the array
//! directory; the timestamp is zero-padded so lexicographic name order
//! equals write order. A fragment becomes visible only once its `.ok`
//! sentinel exists; directories without the sentinel are ignored at read
//! time and left for garbage collection.

pub mod bookkeeping;
pub mod reader;
pub mod writer;

use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::compression::CompressorSpec;
use crate::error::Result;
use crate::io::{uri, Vfs};
use crate::schema::ArraySchema;
use crate::{COORDS_FILE, FRAGMENT_OK_FILE, VAR_FILE_SUFFIX, FILE_SUFFIX};

/// One visible fragment of an array.
#[derive(Debug, Clone)]
pub struct FragmentInfo {
    /// Directory name `__<timestamp>_<uuid>`.
    pub name: String,
    /// Write timestamp in wall-clock nanoseconds.
    pub timestamp: i64,
    /// Full URI of the fragment directory.
    pub uri: String,
}

/// Fresh fragment directory name for a write starting now.
pub fn new_fragment_name() -> String {
    let ts = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("__{:020}_{}", ts, Uuid::new_v4().simple())
}

/// Timestamp encoded in a fragment directory name, if it is one.
pub fn parse_fragment_timestamp(name: &str) -> Option<i64> {
    let rest = name.strip_prefix("__")?;
    let (ts, uuid) = rest.split_once('_')?;
    if ts.is_empty() || uuid.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ts.parse().ok()
}

/// Snapshot the committed fragments of an array, oldest first.
///
/// Directories without the sentinel are crash leftovers and are skipped.
pub async fn list_fragments(vfs: &Vfs, array_uri: &str) -> Result<Vec<FragmentInfo>> {
    let mut fragments = Vec::new();
    for name in vfs.list(array_uri).await? {
        let Some(timestamp) = parse_fragment_timestamp(&name) else {
            continue;
        };
        let fragment_uri = uri::join(array_uri, &name);
        if !vfs
            .is_file(&uri::join(&fragment_uri, FRAGMENT_OK_FILE))
            .await?
        {
            warn!("skipping uncommitted fragment {fragment_uri}");
            continue;
        }
        fragments.push(FragmentInfo {
            name,
            timestamp,
            uri: fragment_uri,
        });
    }
    fragments.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(fragments)
}

/// One physical attribute file of a fragment.
#[derive(Debug, Clone)]
pub struct AttrFileInfo {
    /// File name within the fragment directory.
    pub file_name: String,
    pub compressor: CompressorSpec,
    /// Element width the codec shuffles and run-length-encodes over.
    pub value_size: usize,
}

/// The canonical file list of a fragment: every schema attribute in order,
/// variable-length attributes as an offsets file then a values file, and the
/// coordinates file last for sparse arrays. Book-keeping offset tables use
/// this exact order.
pub fn fragment_files(schema: &ArraySchema) -> Vec<AttrFileInfo> {
    let mut files = Vec::new();
    for attr in schema.attributes() {
        match attr.cell_size() {
            Some(cell_size) => files.push(AttrFileInfo {
                file_name: format!("{}{}", attr.name(), FILE_SUFFIX),
                compressor: attr.compressor(),
                value_size: cell_size,
            }),
            None => {
                files.push(AttrFileInfo {
                    file_name: format!("{}{}", attr.name(), FILE_SUFFIX),
                    compressor: attr.compressor(),
                    value_size: 8,
                });
                files.push(AttrFileInfo {
                    file_name: format!("{}{}{}", attr.name(), VAR_FILE_SUFFIX, FILE_SUFFIX),
                    compressor: attr.compressor(),
                    value_size: attr.datatype().size(),
                });
            }
        }
    }
    if !schema.is_dense() {
        files.push(AttrFileInfo {
            file_name: COORDS_FILE.to_string(),
            compressor: CompressorSpec::none(),
            value_size: schema.coords_size(),
        });
    }
    files
}

/// First file index and file count of one attribute in the canonical order.
pub fn files_for_attr(schema: &ArraySchema, attr_index: usize) -> (usize, usize) {
    let mut first = 0;
    for attr in &schema.attributes()[..attr_index] {
        first += if attr.is_var() { 2 } else { 1 };
    }
    let count = if schema.attributes()[attr_index].is_var() {
        2
    } else {
        1
    };
    (first, count)
}

/// File index of the coordinates file of a sparse array.
pub fn coords_file_index(schema: &ArraySchema) -> usize {
    schema
        .attributes()
        .iter()
        .map(|a| if a.is_var() { 2 } else { 1 })
        .sum()
}
