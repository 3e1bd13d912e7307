//! End-to-end write/read round trips for sparse arrays

use tempfile::TempDir;
use tilestore::utils::{bytes_to_typed_data, typed_data_to_bytes};
use tilestore::{
    Array, ArraySchema, ArrayType, Attribute, AttributeData, Config, Context, Datatype, Order,
    ReadBuffer, StorageError, WriteBuffers, WriteMode, COORDS_ATTR,
};

fn ctx() -> Context {
    Context::new(Config::default()).unwrap()
}

async fn write_sparse_1d(array: &Array, cells: &[(i64, i32)]) {
    let coords: Vec<i64> = cells.iter().map(|&(c, _)| c).collect();
    let values: Vec<i32> = cells.iter().map(|&(_, v)| v).collect();
    let coords = typed_data_to_bytes(&coords);
    let values = typed_data_to_bytes(&values);
    let mut writer = array
        .writer(WriteMode::SparseUnordered, &["x"])
        .await
        .unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&values)],
            coords: Some(&coords),
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();
}

fn schema_1d(capacity: u64) -> ArraySchema {
    ArraySchema::builder(ArrayType::Sparse)
        .dimension("i", 0i64, 99, None)
        .capacity(capacity)
        .attribute(Attribute::new("x", Datatype::Int32))
        .build()
        .unwrap()
}

async fn read_cells(array: &Array, subarray: &[i64]) -> Vec<(i64, i32)> {
    let sub = typed_data_to_bytes(subarray);
    let mut reader = array.reader(&sub, &["x", COORDS_ATTR]).await.unwrap();
    let mut buffers = vec![
        ReadBuffer::with_capacity(1 << 20),
        ReadBuffer::with_capacity(1 << 20),
    ];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    let values: Vec<i32> = bytes_to_typed_data(&buffers[0].data).unwrap();
    let coords: Vec<i64> = bytes_to_typed_data(&buffers[1].data).unwrap();
    coords.into_iter().zip(values).collect()
}

#[tokio::test]
async fn test_duplicates_across_fragments_newest_wins() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("dups").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_1d(10_000)).await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    write_sparse_1d(&array, &[(10, 100)]).await;
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_sparse_1d(&array, &[(10, 200)]).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 2);
    // The coordinate appears exactly once, with the newer value.
    assert_eq!(read_cells(&array, &[0, 99]).await, vec![(10, 200)]);
}

#[tokio::test]
async fn test_unordered_cells_come_back_sorted() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("sorted").to_str().unwrap().to_string();
    let ctx = ctx();
    // Capacity 2 forces several tiles.
    Array::create(&ctx, &uri, schema_1d(2)).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_sparse_1d(&array, &[(42, 3), (7, 1), (99, 5), (13, 2), (58, 4)]).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(
        read_cells(&array, &[0, 99]).await,
        vec![(7, 1), (13, 2), (42, 3), (58, 4), (99, 5)]
    );
    // Subarray filtering follows tile MBRs.
    assert_eq!(
        read_cells(&array, &[10, 60]).await,
        vec![(13, 2), (42, 3), (58, 4)]
    );
}

#[tokio::test]
async fn test_merge_interleaves_fragments() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("merge").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_1d(4)).await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    write_sparse_1d(&array, &[(1, 10), (5, 50), (9, 90)]).await;
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_sparse_1d(&array, &[(2, 20), (5, 55), (8, 80)]).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(
        read_cells(&array, &[0, 99]).await,
        vec![(1, 10), (2, 20), (5, 55), (8, 80), (9, 90)]
    );
}

#[tokio::test]
async fn test_coordinates_outside_domain_are_rejected() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("domain").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_1d(10)).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    let coords = typed_data_to_bytes(&[500i64]);
    let values = typed_data_to_bytes(&[1i32]);
    let mut writer = array
        .writer(WriteMode::SparseUnordered, &["x"])
        .await
        .unwrap();
    let err = writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&values)],
            coords: Some(&coords),
        })
        .await;
    assert!(matches!(err, Err(StorageError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_hilbert_order_round_trip() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("hilbert").to_str().unwrap().to_string();
    let ctx = ctx();
    let schema = ArraySchema::builder(ArrayType::Sparse)
        .dimension("r", 0i64, 15, None)
        .dimension("c", 0i64, 15, None)
        .cell_order(Order::Hilbert)
        .capacity(3)
        .attribute(Attribute::new("x", Datatype::Int32))
        .build()
        .unwrap();
    Array::create(&ctx, &uri, schema).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    let cells: Vec<(i64, i64, i32)> = vec![
        (0, 0, 1),
        (15, 15, 2),
        (3, 12, 3),
        (8, 8, 4),
        (12, 3, 5),
        (1, 14, 6),
        (14, 1, 7),
    ];
    let mut coords = Vec::new();
    let mut values = Vec::new();
    for &(r, c, v) in &cells {
        coords.push(r);
        coords.push(c);
        values.push(v);
    }
    let coords = typed_data_to_bytes(&coords);
    let values = typed_data_to_bytes(&values);
    let mut writer = array
        .writer(WriteMode::SparseUnordered, &["x"])
        .await
        .unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&values)],
            coords: Some(&coords),
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    let sub = typed_data_to_bytes(&[0i64, 15, 0, 15]);
    let mut reader = array.reader(&sub, &[COORDS_ATTR, "x"]).await.unwrap();
    let mut buffers = vec![
        ReadBuffer::with_capacity(1 << 20),
        ReadBuffer::with_capacity(1 << 20),
    ];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    let out_coords: Vec<i64> = bytes_to_typed_data(&buffers[0].data).unwrap();
    let out_values: Vec<i32> = bytes_to_typed_data(&buffers[1].data).unwrap();
    assert_eq!(out_values.len(), cells.len());

    // Every written cell comes back exactly once, in the hilbert order the
    // schema comparator defines.
    let order = array.schema().global_order();
    let mut expected: Vec<Vec<u8>> = cells
        .iter()
        .map(|&(r, c, _)| typed_data_to_bytes(&[r, c]))
        .collect();
    expected.sort_by(|a, b| order.cmp(a, b));
    let got: Vec<Vec<u8>> = out_coords
        .chunks(2)
        .map(|pair| typed_data_to_bytes(pair))
        .collect();
    assert_eq!(got, expected);

    let by_coord: std::collections::HashMap<(i64, i64), i32> =
        cells.iter().map(|&(r, c, v)| ((r, c), v)).collect();
    for (pair, v) in out_coords.chunks(2).zip(&out_values) {
        assert_eq!(by_coord[&(pair[0], pair[1])], *v);
    }
}

#[tokio::test]
async fn test_var_length_sparse_attribute() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("tags").to_str().unwrap().to_string();
    let ctx = ctx();
    let schema = ArraySchema::builder(ArrayType::Sparse)
        .dimension("i", 0i64, 99, None)
        .capacity(2)
        .attribute(Attribute::new("tag", Datatype::Char).var_sized())
        .build()
        .unwrap();
    Array::create(&ctx, &uri, schema).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    let coords = typed_data_to_bytes(&[30i64, 10, 20]);
    let offsets = [0u64, 5, 7];
    let mut writer = array
        .writer(WriteMode::SparseUnordered, &["tag"])
        .await
        .unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::var(&offsets, b"wholeofmid")],
            coords: Some(&coords),
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    let sub = typed_data_to_bytes(&[0i64, 99]);
    let mut reader = array.reader(&sub, &["tag", COORDS_ATTR]).await.unwrap();
    let mut buffers = vec![
        ReadBuffer::var_with_capacity(16, 1 << 16),
        ReadBuffer::with_capacity(1 << 16),
    ];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    let coords_out: Vec<i64> = bytes_to_typed_data(&buffers[1].data).unwrap();
    assert_eq!(coords_out, vec![10, 20, 30]);
    // Cells sorted by coordinate: (10,"of"), (20,"mid"), (30,"whole").
    assert_eq!(buffers[0].offsets, vec![0, 2, 5]);
    assert_eq!(buffers[0].data, b"ofmidwhole");
}
