//! Crash recovery (sentinel protocol) and fragment consolidation

use tempfile::TempDir;
use tilestore::utils::{bytes_to_typed_data, typed_data_to_bytes};
use tilestore::{
    consolidate, Array, ArraySchema, ArrayType, Attribute, AttributeData, Config, Context,
    Datatype, ReadBuffer, WriteBuffers, WriteMode, COORDS_ATTR, FRAGMENT_OK_FILE,
};

fn ctx() -> Context {
    Context::new(Config::default()).unwrap()
}

fn dense_schema() -> ArraySchema {
    ArraySchema::builder(ArrayType::Dense)
        .dimension("rows", 0i64, 3, Some(2))
        .dimension("cols", 0i64, 3, Some(2))
        .attribute(Attribute::new("v", Datatype::Int32))
        .build()
        .unwrap()
}

async fn write_dense(array: &Array, subarray: &[i64], values: &[i32]) {
    let sub = typed_data_to_bytes(subarray);
    let data = typed_data_to_bytes(values);
    let mut writer = array
        .writer_with_subarray(WriteMode::DenseOrdered, &["v"], &sub)
        .await
        .unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&data)],
            coords: None,
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();
}

async fn read_dense(array: &Array, subarray: &[i64]) -> Vec<i32> {
    let sub = typed_data_to_bytes(subarray);
    let mut reader = array.reader(&sub, &["v"]).await.unwrap();
    let mut buffers = vec![ReadBuffer::with_capacity(1 << 20)];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    bytes_to_typed_data(&buffers[0].data).unwrap()
}

#[tokio::test]
async fn test_dropped_writer_leaves_array_unchanged() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("crash").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, dense_schema()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    // Flush several tiles, then drop the writer before finalize, as a
    // killed process would.
    {
        let mut writer = array.writer(WriteMode::DenseOrdered, &["v"]).await.unwrap();
        let data = typed_data_to_bytes(&[7i32; 12]); // three of four tiles
        writer
            .submit(&WriteBuffers {
                attrs: vec![AttributeData::fixed(&data)],
                coords: None,
            })
            .await
            .unwrap();
        // No finalize.
    }

    // The fragment directory exists with data files but no sentinel.
    let leftovers: Vec<String> = std::fs::read_dir(&uri)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_str().unwrap().to_string())
        .filter(|name| name.starts_with("__") && !name.ends_with(".tdb"))
        .filter(|name| name != "__consolidation_lock")
        .collect();
    assert_eq!(leftovers.len(), 1);
    let fragment_dir = dir.path().join("crash").join(&leftovers[0]);
    assert!(fragment_dir.join("v.tdb").exists());
    assert!(!fragment_dir.join(FRAGMENT_OK_FILE).exists());

    // Readers ignore it entirely.
    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 0);
    let sub = typed_data_to_bytes(&[0i64, 3, 0, 3]);
    let mut reader = array.reader(&sub, &["v"]).await.unwrap();
    let mut buffers = vec![ReadBuffer::with_capacity(1024)];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    assert_eq!(filled.sizes, vec![0]);
}

#[tokio::test]
async fn test_failed_finalize_stays_invisible() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("partial").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, dense_schema()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    // An under-filled dense write fails finalize; no sentinel is written.
    let mut writer = array.writer(WriteMode::DenseOrdered, &["v"]).await.unwrap();
    let data = typed_data_to_bytes(&[7i32; 4]);
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&data)],
            coords: None,
        })
        .await
        .unwrap();
    assert!(writer.finalize().await.is_err());

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 0);
}

#[tokio::test]
async fn test_dense_consolidation() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("dense").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, dense_schema()).await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    write_dense(&array, &[0, 3, 0, 3], &(0..16).collect::<Vec<i32>>()).await;
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_dense(&array, &[0, 1, 0, 1], &[90, 91, 94, 95]).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 2);
    let before = read_dense(&array, &[0, 3, 0, 3]).await;
    assert_eq!(
        before,
        vec![90, 91, 2, 3, 94, 95, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
    );

    consolidate(&ctx, &uri).await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 1);
    assert_eq!(read_dense(&array, &[0, 3, 0, 3]).await, before);
    assert_eq!(read_dense(&array, &[1, 2, 1, 3]).await, vec![95, 6, 7, 9, 10, 11]);
}

#[tokio::test]
async fn test_sparse_consolidation() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("sparse").to_str().unwrap().to_string();
    let ctx = ctx();
    let schema = ArraySchema::builder(ArrayType::Sparse)
        .dimension("i", 0i64, 99, None)
        .capacity(2)
        .attribute(Attribute::new("x", Datatype::Int32))
        .build()
        .unwrap();
    Array::create(&ctx, &uri, schema).await.unwrap();

    for cells in [
        vec![(5i64, 50i32), (20, 200), (40, 400)],
        vec![(20i64, 999i32), (60, 600)],
    ] {
        let array = Array::open(&ctx, &uri).await.unwrap();
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

    consolidate(&ctx, &uri).await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 1);
    let sub = typed_data_to_bytes(&[0i64, 99]);
    let mut reader = array.reader(&sub, &[COORDS_ATTR, "x"]).await.unwrap();
    let mut buffers = vec![
        ReadBuffer::with_capacity(1 << 16),
        ReadBuffer::with_capacity(1 << 16),
    ];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    let coords: Vec<i64> = bytes_to_typed_data(&buffers[0].data).unwrap();
    let values: Vec<i32> = bytes_to_typed_data(&buffers[1].data).unwrap();
    assert_eq!(coords, vec![5, 20, 40, 60]);
    assert_eq!(values, vec![50, 999, 400, 600]);
}

#[tokio::test]
async fn test_consolidation_of_single_fragment_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("single").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, dense_schema()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_dense(&array, &[0, 3, 0, 3], &(0..16).collect::<Vec<i32>>()).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    let name_before = array.fragments()[0].name.clone();
    consolidate(&ctx, &uri).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 1);
    assert_eq!(array.fragments()[0].name, name_before);
}

#[tokio::test]
async fn test_fragment_layout_on_disk() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("layout").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, dense_schema()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_dense(&array, &[0, 3, 0, 3], &(0..16).collect::<Vec<i32>>()).await;

    assert!(dir.path().join("layout/__array_schema.tdb").exists());
    let array = Array::open(&ctx, &uri).await.unwrap();
    let fragment = std::path::PathBuf::from(&array.fragments()[0].uri);
    assert!(fragment.join("__tiledb_fragment.ok").exists());
    assert!(fragment.join("__book_keeping.tdb").exists());
    assert!(fragment.join("v.tdb").exists());
}
