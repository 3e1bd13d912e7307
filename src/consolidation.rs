//! Consolidation: merge all committed fragments into one and retire them
//!
//! The merged fragment is written through the normal write path, so it
//! becomes visible atomically with its `.ok` sentinel and its timestamp
//! supersedes every retired fragment. Old directories are deleted under an
//! exclusive lock where the backend supports locking; on object stores the
//! sentinel protocol alone keeps concurrent readers consistent (a stronger
//! two-phase marker would be needed to also protect readers that listed the
//! directory mid-retire).

use log::info;

use crate::access::Array;
use crate::context::Context;
use crate::coords::RectU64;
use crate::error::Result;
use crate::fragment::writer::{AttributeData, WriteBuffers, WriteMode};
use crate::io::uri;
use crate::read::ReadBuffer;
use crate::schema::{ArraySchema, COORDS_ATTR};
use crate::types::coord_from_i128;
use crate::CONSOLIDATION_LOCK_FILE;

/// Merge the committed fragments of the array at `array_uri` into a single
/// fragment. A no-op for arrays with fewer than two fragments.
pub async fn consolidate(ctx: &Context, array_uri: &str) -> Result<()> {
    let array = Array::open(ctx, array_uri).await?;
    if array.fragments().len() < 2 {
        return Ok(());
    }
    let retired: Vec<String> = array
        .fragments()
        .iter()
        .map(|f| f.name.clone())
        .collect();

    if array.schema().is_dense() {
        consolidate_dense(&array).await?;
    } else {
        consolidate_sparse(&array).await?;
    }

    // Retire the old fragments under an exclusive lock; readers snapshot
    // under the shared lock.
    let lock_uri = uri::join(array_uri, CONSOLIDATION_LOCK_FILE);
    let lock = ctx.vfs().acquire_lock(&lock_uri, true).await?;
    for name in &retired {
        ctx.vfs().delete_dir(&uri::join(array_uri, name)).await?;
        ctx.tile_cache().evict_fragment(name);
    }
    drop(lock);

    info!(
        "consolidated {} fragments of {array_uri}",
        retired.len()
    );
    Ok(())
}

/// Coordinate box of one offset-space rect, in the array's coordinate type.
fn rect_to_subarray(schema: &ArraySchema, rect: &RectU64) -> Result<Vec<u8>> {
    let dtype = schema.coords_type();
    let size = dtype.size();
    let mut raw = Vec::with_capacity(2 * rect.rank() * size);
    for d in 0..rect.rank() {
        let lo = crate::types::coord_as_i128(dtype, schema.dim_lo(d))?;
        coord_from_i128(dtype, lo + rect.lo[d] as i128, &mut raw)?;
        coord_from_i128(dtype, lo + rect.hi[d] as i128, &mut raw)?;
    }
    Ok(raw)
}

/// Dense arrays re-read tile by tile in global order and feed an ordered
/// write over the union of the fragment regions.
async fn consolidate_dense(array: &Array) -> Result<()> {
    let schema = array.schema();
    let grid = schema.dense_grid()?;

    // Union bounding box of the fragment domains; fragment regions are
    // tile-aligned, so the union box is too.
    let mut union: Option<RectU64> = None;
    for info in array.fragments() {
        let reader = crate::fragment::reader::FragmentReader::open(
            array.context().clone(),
            array.schema_arc(),
            info.clone(),
        )
        .await?;
        let region = reader.region().expect("dense fragment").clone();
        union = Some(match union {
            None => region,
            Some(acc) => RectU64::new(
                acc.lo
                    .iter()
                    .zip(&region.lo)
                    .map(|(&a, &b)| a.min(b))
                    .collect(),
                acc.hi
                    .iter()
                    .zip(&region.hi)
                    .map(|(&a, &b)| a.max(b))
                    .collect(),
            ),
        });
    }
    let union = union.expect("at least two fragments");

    let attr_names: Vec<&str> = schema.attributes().iter().map(|a| a.name()).collect();
    let subarray = rect_to_subarray(schema, &union)?;
    let mut writer = array
        .writer_with_subarray(WriteMode::DenseOrdered, &attr_names, &subarray)
        .await?;

    // One read per tile: a single tile's subarray traversal in cell order
    // is exactly its global order.
    let tile_cap = grid.tile_capacity() as usize;
    for tile_id in grid.tiles_intersecting(&union) {
        let region = grid.tile_region(tile_id);
        let tile_sub = rect_to_subarray(schema, &region)?;
        let mut reader = array.reader(&tile_sub, &attr_names).await?;
        let mut buffers: Vec<ReadBuffer> = schema
            .attributes()
            .iter()
            .map(|a| match a.cell_size() {
                Some(cell_size) => ReadBuffer::with_capacity(tile_cap * cell_size),
                None => ReadBuffer::var_with_capacity(tile_cap, usize::MAX),
            })
            .collect();
        loop {
            let filled = reader.next(&mut buffers).await?;
            let attr_data: Vec<AttributeData> = schema
                .attributes()
                .iter()
                .zip(&buffers)
                .map(|(a, b)| {
                    if a.is_var() {
                        AttributeData::var(&b.offsets, &b.data)
                    } else {
                        AttributeData::fixed(&b.data)
                    }
                })
                .collect();
            writer
                .submit(&WriteBuffers {
                    attrs: attr_data,
                    coords: None,
                })
                .await?;
            if filled.complete {
                break;
            }
        }
    }
    writer.finalize().await
}

/// Sparse arrays stream every cell of the full domain, coordinates
/// included, back through an unordered write.
async fn consolidate_sparse(array: &Array) -> Result<()> {
    let schema = array.schema();
    let attr_names: Vec<&str> = schema.attributes().iter().map(|a| a.name()).collect();
    let mut read_attrs = attr_names.clone();
    read_attrs.push(COORDS_ATTR);

    let mut reader = array.reader(schema.domain(), &read_attrs).await?;
    let mut writer = array.writer(WriteMode::SparseUnordered, &attr_names).await?;

    let batch = schema.capacity() as usize;
    let mut buffers: Vec<ReadBuffer> = schema
        .attributes()
        .iter()
        .map(|a| match a.cell_size() {
            Some(cell_size) => ReadBuffer::with_capacity(batch * cell_size),
            None => ReadBuffer::var_with_capacity(batch, usize::MAX),
        })
        .chain(std::iter::once(ReadBuffer::with_capacity(
            batch * schema.coords_size(),
        )))
        .collect();

    loop {
        let filled = reader.next(&mut buffers).await?;
        let (attr_bufs, coords_buf) = buffers.split_at(buffers.len() - 1);
        let attr_data: Vec<AttributeData> = schema
            .attributes()
            .iter()
            .zip(attr_bufs)
            .map(|(a, b)| {
                if a.is_var() {
                    AttributeData::var(&b.offsets, &b.data)
                } else {
                    AttributeData::fixed(&b.data)
                }
            })
            .collect();
        writer
            .submit(&WriteBuffers {
                attrs: attr_data,
                coords: Some(&coords_buf[0].data),
            })
            .await?;
        if filled.complete {
            break;
        }
    }
    writer.finalize().await
}
