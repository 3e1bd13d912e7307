//! End-to-end write/read round trips for dense arrays

use tempfile::TempDir;
use tilestore::utils::{bytes_to_typed_data, typed_data_to_bytes};
use tilestore::{
    Array, ArraySchema, ArrayType, Attribute, AttributeData, Compressor, Config, Context,
    Datatype, ReadBuffer, StorageError, WriteBuffers, WriteMode,
};

fn ctx() -> Context {
    Context::new(Config::default()).unwrap()
}

fn schema_4x4() -> ArraySchema {
    ArraySchema::builder(ArrayType::Dense)
        .dimension("rows", 0i64, 3, Some(2))
        .dimension("cols", 0i64, 3, Some(2))
        .attribute(Attribute::new("v", Datatype::Int32))
        .build()
        .unwrap()
}

/// Write `v = i*4 + j` over the full 4x4 domain with explicit coordinates.
async fn write_4x4(array: &Array) {
    let mut coords = Vec::new();
    let mut values = Vec::new();
    for i in 0..4i64 {
        for j in 0..4i64 {
            coords.push(i);
            coords.push(j);
            values.push((i * 4 + j) as i32);
        }
    }
    let coords = typed_data_to_bytes(&coords);
    let values = typed_data_to_bytes(&values);
    let mut writer = array.writer(WriteMode::DenseUnordered, &["v"]).await.unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&values)],
            coords: Some(&coords),
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();
}

async fn read_i32(array: &Array, subarray: &[i64]) -> Vec<i32> {
    let sub = typed_data_to_bytes(subarray);
    let mut reader = array.reader(&sub, &["v"]).await.unwrap();
    let mut buffers = vec![ReadBuffer::with_capacity(1 << 20)];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    bytes_to_typed_data(&buffers[0].data).unwrap()
}

#[tokio::test]
async fn test_dense_2d_round_trip() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("grid").to_str().unwrap().to_string();
    let ctx = ctx();

    Array::create(&ctx, &uri, schema_4x4()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_4x4(&array).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 1);
    assert_eq!(read_i32(&array, &[1, 2, 1, 3]).await, vec![5, 6, 7, 9, 10, 11]);
    // Full domain comes back in row-major order.
    let all = read_i32(&array, &[0, 3, 0, 3]).await;
    assert_eq!(all, (0..16).collect::<Vec<i32>>());
}

#[tokio::test]
async fn test_dense_global_order_write_matches_unordered() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("grid").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_4x4()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    // Same data as write_4x4, fed in global order: tiles row-major, cells
    // row-major within each tile.
    let mut values: Vec<i32> = Vec::new();
    for (ti, tj) in [(0i64, 0i64), (0, 1), (1, 0), (1, 1)] {
        for i in 0..2i64 {
            for j in 0..2i64 {
                values.push(((ti * 2 + i) * 4 + tj * 2 + j) as i32);
            }
        }
    }
    let data = typed_data_to_bytes(&values);
    let mut writer = array.writer(WriteMode::DenseOrdered, &["v"]).await.unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&data)],
            coords: None,
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(read_i32(&array, &[1, 2, 1, 3]).await, vec![5, 6, 7, 9, 10, 11]);
}

#[tokio::test]
async fn test_newer_fragment_masks_older() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("grid").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_4x4()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_4x4(&array).await;

    // Overwrite the top-left tile with nines.
    let sub = typed_data_to_bytes(&[0i64, 1, 0, 1]);
    let nines = typed_data_to_bytes(&[9i32; 4]);
    let mut writer = array
        .writer_with_subarray(WriteMode::DenseOrdered, &["v"], &sub)
        .await
        .unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&nines)],
            coords: None,
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    assert_eq!(array.fragments().len(), 2);
    assert_eq!(
        read_i32(&array, &[0, 3, 0, 3]).await,
        vec![9, 9, 2, 3, 9, 9, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
    );
}

#[tokio::test]
async fn test_variable_length_attribute() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("strings").to_str().unwrap().to_string();
    let ctx = ctx();
    let schema = ArraySchema::builder(ArrayType::Dense)
        .dimension("i", 0i64, 2, Some(3))
        .attribute(Attribute::new("s", Datatype::Char).var_sized())
        .build()
        .unwrap();
    Array::create(&ctx, &uri, schema).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    let offsets = [0u64, 1, 3];
    let mut writer = array.writer(WriteMode::DenseOrdered, &["s"]).await.unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::var(&offsets, b"abbccc")],
            coords: None,
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    let sub = typed_data_to_bytes(&[0i64, 2]);
    let mut reader = array.reader(&sub, &["s"]).await.unwrap();
    let mut buffers = vec![ReadBuffer::var_with_capacity(16, 1 << 16)];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    assert_eq!(buffers[0].offsets, vec![0, 1, 3]);
    assert_eq!(buffers[0].data, b"abbccc");
    assert_eq!(filled.sizes[0], 6 + 3 * 8);
}

#[tokio::test]
async fn test_codec_parity_and_disk_sizes() {
    let dir = TempDir::new().unwrap();
    let ctx = ctx();
    let values: Vec<i32> = (0..4096).map(|i| i % 7).collect();
    let data = typed_data_to_bytes(&values);

    let mut disk_sizes = Vec::new();
    for (name, codec) in [("plain", None), ("packed", Some((Compressor::Zstd, 3)))] {
        let uri = dir.path().join(name).to_str().unwrap().to_string();
        let mut attr = Attribute::new("v", Datatype::Int32);
        if let Some((codec, level)) = codec {
            attr = attr.with_compressor(codec, level);
        }
        let schema = ArraySchema::builder(ArrayType::Dense)
            .dimension("i", 0i64, 4095, Some(1024))
            .attribute(attr)
            .build()
            .unwrap();
        Array::create(&ctx, &uri, schema).await.unwrap();
        let array = Array::open(&ctx, &uri).await.unwrap();
        let mut writer = array.writer(WriteMode::DenseOrdered, &["v"]).await.unwrap();
        writer
            .submit(&WriteBuffers {
                attrs: vec![AttributeData::fixed(&data)],
                coords: None,
            })
            .await
            .unwrap();
        writer.finalize().await.unwrap();

        let array = Array::open(&ctx, &uri).await.unwrap();
        let sub = typed_data_to_bytes(&[0i64, 4095]);
        let mut reader = array.reader(&sub, &["v"]).await.unwrap();
        let mut buffers = vec![ReadBuffer::with_capacity(data.len())];
        let filled = reader.next(&mut buffers).await.unwrap();
        assert!(filled.complete);
        assert_eq!(buffers[0].data, data, "readback differs for {name}");

        let fragment = &array.fragments()[0];
        let file = std::path::Path::new(&fragment.uri).join("v.tdb");
        disk_sizes.push(std::fs::metadata(file).unwrap().len());
    }
    assert!(
        disk_sizes[1] < disk_sizes[0],
        "zstd file ({}) not smaller than uncompressed ({})",
        disk_sizes[1],
        disk_sizes[0]
    );
}

#[tokio::test]
async fn test_image_panel_read() {
    // 300x300 image of 100x100 constant panels in a 3x3 palette, one
    // attribute per color component.
    let palette: [(i32, i32, i32); 9] = [
        (0, 0, 0),
        (201, 23, 30),
        (234, 85, 6),
        (233, 82, 149),
        (255, 255, 255),
        (255, 234, 0),
        (101, 49, 142),
        (12, 2, 196),
        (0, 85, 46),
    ];
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("panels").to_str().unwrap().to_string();
    let ctx = ctx();
    let schema = ArraySchema::builder(ArrayType::Dense)
        .dimension("y", 0i64, 299, Some(100))
        .dimension("x", 0i64, 299, Some(100))
        .attribute(Attribute::new("R", Datatype::Int32).with_compressor(Compressor::Rle, 0))
        .attribute(Attribute::new("G", Datatype::Int32).with_compressor(Compressor::Rle, 0))
        .attribute(Attribute::new("B", Datatype::Int32).with_compressor(Compressor::Rle, 0))
        .build()
        .unwrap();
    Array::create(&ctx, &uri, schema).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    // Global order feeds one constant panel per tile.
    let mut writer = array
        .writer(WriteMode::DenseOrdered, &["R", "G", "B"])
        .await
        .unwrap();
    for (r, g, b) in palette {
        let rs = typed_data_to_bytes(&vec![r; 100 * 100]);
        let gs = typed_data_to_bytes(&vec![g; 100 * 100]);
        let bs = typed_data_to_bytes(&vec![b; 100 * 100]);
        writer
            .submit(&WriteBuffers {
                attrs: vec![
                    AttributeData::fixed(&rs),
                    AttributeData::fixed(&gs),
                    AttributeData::fixed(&bs),
                ],
                coords: None,
            })
            .await
            .unwrap();
    }
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    let sub = typed_data_to_bytes(&[0i64, 299, 0, 299]);
    let mut reader = array.reader(&sub, &["R", "G", "B"]).await.unwrap();
    let mut buffers = vec![
        ReadBuffer::with_capacity(300 * 300 * 4),
        ReadBuffer::with_capacity(300 * 300 * 4),
        ReadBuffer::with_capacity(300 * 300 * 4),
    ];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);

    let r: Vec<i32> = bytes_to_typed_data(&buffers[0].data).unwrap();
    let g: Vec<i32> = bytes_to_typed_data(&buffers[1].data).unwrap();
    let b: Vec<i32> = bytes_to_typed_data(&buffers[2].data).unwrap();
    assert_eq!(r.len(), 300 * 300);
    for y in 0..300usize {
        for x in 0..300usize {
            let panel = (y / 100) * 3 + x / 100;
            let at = y * 300 + x;
            assert_eq!(
                (r[at], g[at], b[at]),
                palette[panel],
                "pixel ({y},{x}) disagrees with panel {panel}"
            );
        }
    }
}

#[tokio::test]
async fn test_multi_attribute_reads_zip_consistently() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("zip").to_str().unwrap().to_string();
    let ctx = ctx();
    let schema = ArraySchema::builder(ArrayType::Dense)
        .dimension("i", 0i64, 7, Some(4))
        .attribute(Attribute::new("a", Datatype::Int32))
        .attribute(Attribute::new("b", Datatype::Int64))
        .build()
        .unwrap();
    Array::create(&ctx, &uri, schema).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    let a: Vec<i32> = (0..8).collect();
    let b: Vec<i64> = (0..8).map(|i| i * 100).collect();
    let (a_bytes, b_bytes) = (typed_data_to_bytes(&a), typed_data_to_bytes(&b));
    let mut writer = array.writer(WriteMode::DenseOrdered, &["a", "b"]).await.unwrap();
    writer
        .submit(&WriteBuffers {
            attrs: vec![AttributeData::fixed(&a_bytes), AttributeData::fixed(&b_bytes)],
            coords: None,
        })
        .await
        .unwrap();
    writer.finalize().await.unwrap();

    let array = Array::open(&ctx, &uri).await.unwrap();
    let sub = typed_data_to_bytes(&[2i64, 6]);

    // Joint read.
    let mut reader = array.reader(&sub, &["a", "b"]).await.unwrap();
    let mut buffers = vec![ReadBuffer::with_capacity(1024), ReadBuffer::with_capacity(1024)];
    assert!(reader.next(&mut buffers).await.unwrap().complete);
    let joint_a = buffers[0].data.clone();
    let joint_b = buffers[1].data.clone();

    // Per-attribute reads zip to the same result.
    for (name, expected) in [("a", &joint_a), ("b", &joint_b)] {
        let mut reader = array.reader(&sub, &[name]).await.unwrap();
        let mut buffers = vec![ReadBuffer::with_capacity(1024)];
        assert!(reader.next(&mut buffers).await.unwrap().complete);
        assert_eq!(&buffers[0].data, expected);
    }
}

#[tokio::test]
async fn test_streaming_reads_with_small_buffers() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("grid").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_4x4()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();
    write_4x4(&array).await;

    let array = Array::open(&ctx, &uri).await.unwrap();
    let sub = typed_data_to_bytes(&[0i64, 3, 0, 3]);
    let mut reader = array.reader(&sub, &["v"]).await.unwrap();
    // Room for three cells per call.
    let mut buffers = vec![ReadBuffer::with_capacity(12)];
    let mut collected: Vec<i32> = Vec::new();
    let mut rounds = 0;
    loop {
        let filled = reader.next(&mut buffers).await.unwrap();
        collected.extend(bytes_to_typed_data::<i32>(&buffers[0].data).unwrap());
        rounds += 1;
        if filled.complete {
            break;
        }
        assert!(rounds < 32, "reader does not make progress");
    }
    assert_eq!(collected, (0..16).collect::<Vec<i32>>());
    assert!(rounds >= 6);
}

#[tokio::test]
async fn test_read_edge_cases() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("grid").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_4x4()).await.unwrap();
    let array = Array::open(&ctx, &uri).await.unwrap();

    // Zero fragments: empty stream, no error.
    let sub = typed_data_to_bytes(&[0i64, 3, 0, 3]);
    let mut reader = array.reader(&sub, &["v"]).await.unwrap();
    let mut buffers = vec![ReadBuffer::with_capacity(1024)];
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    assert_eq!(filled.sizes, vec![0]);

    write_4x4(&array).await;
    let array = Array::open(&ctx, &uri).await.unwrap();

    // Inverted bounds select nothing.
    let empty = typed_data_to_bytes(&[3i64, 1, 0, 3]);
    let mut reader = array.reader(&empty, &["v"]).await.unwrap();
    let filled = reader.next(&mut buffers).await.unwrap();
    assert!(filled.complete);
    assert_eq!(filled.sizes, vec![0]);

    // Out-of-domain subarrays are invalid.
    let outside = typed_data_to_bytes(&[10i64, 20, 0, 3]);
    assert!(matches!(
        array.reader(&outside, &["v"]).await,
        Err(StorageError::InvalidArgument(_))
    ));

    // Unknown attributes are invalid.
    assert!(matches!(
        array.reader(&sub, &["missing"]).await,
        Err(StorageError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_create_conflicts_and_delete() {
    let dir = TempDir::new().unwrap();
    let uri = dir.path().join("grid").to_str().unwrap().to_string();
    let ctx = ctx();
    Array::create(&ctx, &uri, schema_4x4()).await.unwrap();
    assert!(matches!(
        Array::create(&ctx, &uri, schema_4x4()).await,
        Err(StorageError::SchemaConflict(_))
    ));

    Array::delete(&ctx, &uri).await.unwrap();
    assert!(matches!(
        Array::open(&ctx, &uri).await,
        Err(StorageError::InvalidArgument(_))
    ));
}
