//! Compression codecs and the on-disk tile frame
//!
//! Every tile is stored as one frame:
//! `[compressed_len u64][uncompressed_len u64][codec_id u8][payload]`.
//! The codec set is closed and versioned with the array format; adding a
//! codec bumps the format version.

use std::io::Read;

use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression as GzLevel;

use crate::error::{Result, StorageError};

/// Byte overhead of the tile frame header.
pub const FRAME_HEADER_SIZE: usize = 8 + 8 + 1;

/// Compression codecs supported by the tile format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compressor {
    /// Payload stored verbatim
    None = 0,
    /// Gzip (deflate), levels 1-9
    Gzip = 1,
    /// Zstandard, levels 1-22
    Zstd = 2,
    /// LZ4 block format
    Lz4 = 3,
    /// Byte-shuffle by element width around an inner codec
    Blosc = 4,
    /// Run-length encoding over whole cell values
    Rle = 5,
}

impl Compressor {
    /// Decode from the serialized byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compressor::None),
            1 => Some(Compressor::Gzip),
            2 => Some(Compressor::Zstd),
            3 => Some(Compressor::Lz4),
            4 => Some(Compressor::Blosc),
            5 => Some(Compressor::Rle),
            _ => None,
        }
    }
}

/// A codec choice with its level, as carried per attribute by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressorSpec {
    pub codec: Compressor,
    pub level: i32,
}

impl CompressorSpec {
    pub fn none() -> Self {
        Self {
            codec: Compressor::None,
            level: 0,
        }
    }

    pub fn new(codec: Compressor, level: i32) -> Self {
        Self { codec, level }
    }
}

impl Default for CompressorSpec {
    fn default() -> Self {
        Self::none()
    }
}

/// Trait for compression/decompression of one tile payload.
pub trait Codec: Send + Sync {
    /// Compress `data` at `level` (codec-specific range, clamped).
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>>;

    /// Decompress `data`; `uncompressed_len` is the exact output size.
    fn decompress(&self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>>;

    fn id(&self) -> Compressor;
}

/// No compression.
#[derive(Debug, Default)]
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _uncompressed_len: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn id(&self) -> Compressor {
        Compressor::None
    }
}

/// Gzip compression.
#[derive(Debug, Default)]
pub struct GzipCodec;

impl Codec for GzipCodec {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        let level = if (1..=9).contains(&level) { level } else { 6 };
        let mut encoder = GzEncoder::new(data, GzLevel::new(level as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| StorageError::Corruption(format!("gzip compression failed: {e}")))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::with_capacity(uncompressed_len);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| StorageError::Corruption(format!("gzip decompression failed: {e}")))?;
        Ok(decompressed)
    }

    fn id(&self) -> Compressor {
        Compressor::Gzip
    }
}

/// Zstandard compression.
#[derive(Debug, Default)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        let level = if (1..=22).contains(&level) { level } else { 3 };
        zstd::encode_all(data, level)
            .map_err(|e| StorageError::Corruption(format!("zstd compression failed: {e}")))
    }

    fn decompress(&self, data: &[u8], _uncompressed_len: usize) -> Result<Vec<u8>> {
        zstd::decode_all(data)
            .map_err(|e| StorageError::Corruption(format!("zstd decompression failed: {e}")))
    }

    fn id(&self) -> Compressor {
        Compressor::Zstd
    }
}

/// LZ4 block compression; the level is ignored.
#[derive(Debug, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8], _uncompressed_len: usize) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| StorageError::Corruption(format!("lz4 decompression failed: {e}")))
    }

    fn id(&self) -> Compressor {
        Compressor::Lz4
    }
}

/// Blosc-style filter: byte shuffle by element width, then an inner codec.
/// The payload carries the inner codec id in its first byte.
#[derive(Debug)]
pub struct BloscCodec {
    value_size: usize,
}

impl BloscCodec {
    pub fn new(value_size: usize) -> Self {
        Self {
            value_size: value_size.max(1),
        }
    }

    fn shuffle(&self, data: &[u8]) -> Vec<u8> {
        let n = data.len() / self.value_size;
        let mut out = vec![0u8; data.len()];
        for i in 0..n {
            for b in 0..self.value_size {
                out[b * n + i] = data[i * self.value_size + b];
            }
        }
        // Trailing bytes of a partial value pass through unshuffled.
        let tail = n * self.value_size;
        out[tail..].copy_from_slice(&data[tail..]);
        out
    }

    fn unshuffle(&self, data: &[u8]) -> Vec<u8> {
        let n = data.len() / self.value_size;
        let mut out = vec![0u8; data.len()];
        for i in 0..n {
            for b in 0..self.value_size {
                out[i * self.value_size + b] = data[b * n + i];
            }
        }
        let tail = n * self.value_size;
        out[tail..].copy_from_slice(&data[tail..]);
        out
    }

    fn inner(&self, level: i32) -> (Compressor, Box<dyn Codec>) {
        if level >= 9 {
            (Compressor::Zstd, Box::new(ZstdCodec))
        } else {
            (Compressor::Lz4, Box::new(Lz4Codec))
        }
    }
}

impl Codec for BloscCodec {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        let shuffled = self.shuffle(data);
        let (inner_id, inner) = self.inner(level);
        let mut out = Vec::with_capacity(shuffled.len() / 2 + 1);
        out.push(inner_id as u8);
        out.extend_from_slice(&inner.compress(&shuffled, level)?);
        Ok(out)
    }

    fn decompress(&self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let (&inner_id, body) = data
            .split_first()
            .ok_or_else(|| StorageError::Corruption("empty blosc payload".to_string()))?;
        let inner: Box<dyn Codec> = match Compressor::from_u8(inner_id) {
            Some(Compressor::Lz4) => Box::new(Lz4Codec),
            Some(Compressor::Zstd) => Box::new(ZstdCodec),
            _ => {
                return Err(StorageError::Corruption(format!(
                    "unknown blosc inner codec id {inner_id}"
                )))
            }
        };
        let shuffled = inner.decompress(body, uncompressed_len)?;
        Ok(self.unshuffle(&shuffled))
    }

    fn id(&self) -> Compressor {
        Compressor::Blosc
    }
}

/// Run-length encoding over whole cell values: `[run_len u32][value bytes]`.
#[derive(Debug)]
pub struct RleCodec {
    value_size: usize,
}

impl RleCodec {
    pub fn new(value_size: usize) -> Self {
        Self {
            value_size: value_size.max(1),
        }
    }
}

impl Codec for RleCodec {
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>> {
        if data.len() % self.value_size != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "rle input of {} bytes is not a multiple of the {}-byte value size",
                data.len(),
                self.value_size
            )));
        }

        let mut compressed = Vec::new();
        let mut values = data.chunks_exact(self.value_size);
        let mut current: Option<(&[u8], u32)> = None;

        for value in values.by_ref() {
            match current {
                Some((run, count)) if run == value && count < u32::MAX => {
                    current = Some((run, count + 1));
                }
                Some((run, count)) => {
                    compressed.extend_from_slice(&count.to_le_bytes());
                    compressed.extend_from_slice(run);
                    current = Some((value, 1));
                }
                None => current = Some((value, 1)),
            }
        }
        if let Some((run, count)) = current {
            compressed.extend_from_slice(&count.to_le_bytes());
            compressed.extend_from_slice(run);
        }

        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let record = 4 + self.value_size;
        if data.len() % record != 0 {
            return Err(StorageError::Corruption(format!(
                "rle payload of {} bytes is not a multiple of the {}-byte run record",
                data.len(),
                record
            )));
        }

        let mut decompressed = Vec::with_capacity(uncompressed_len);
        for chunk in data.chunks_exact(record) {
            let count = u32::from_le_bytes(chunk[..4].try_into().unwrap()) as usize;
            let value = &chunk[4..];
            for _ in 0..count {
                decompressed.extend_from_slice(value);
            }
        }

        if decompressed.len() != uncompressed_len {
            return Err(StorageError::Corruption(format!(
                "rle expanded to {} bytes, frame declared {}",
                decompressed.len(),
                uncompressed_len
            )));
        }
        Ok(decompressed)
    }

    fn id(&self) -> Compressor {
        Compressor::Rle
    }
}

/// Get a codec for a compressor and the value size of the stream it will see.
pub fn get_codec(compressor: Compressor, value_size: usize) -> Box<dyn Codec> {
    match compressor {
        Compressor::None => Box::new(NoneCodec),
        Compressor::Gzip => Box::new(GzipCodec),
        Compressor::Zstd => Box::new(ZstdCodec),
        Compressor::Lz4 => Box::new(Lz4Codec),
        Compressor::Blosc => Box::new(BloscCodec::new(value_size)),
        Compressor::Rle => Box::new(RleCodec::new(value_size)),
    }
}

/// Compress `payload` and wrap it in a tile frame.
pub fn encode_frame(spec: CompressorSpec, value_size: usize, payload: &[u8]) -> Result<Vec<u8>> {
    let codec = get_codec(spec.codec, value_size);
    let body = codec.compress(payload, spec.level)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.push(spec.codec as u8);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Unwrap one tile frame and decompress its payload.
pub fn decode_frame(frame: &[u8], value_size: usize) -> Result<Vec<u8>> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(StorageError::Corruption(format!(
            "tile frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let compressed_len = u64::from_le_bytes(frame[..8].try_into().unwrap()) as usize;
    let uncompressed_len = u64::from_le_bytes(frame[8..16].try_into().unwrap()) as usize;
    let codec_id = frame[16];
    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() != compressed_len {
        return Err(StorageError::Corruption(format!(
            "tile frame declares {} compressed bytes but carries {}",
            compressed_len,
            body.len()
        )));
    }

    let compressor = Compressor::from_u8(codec_id)
        .ok_or_else(|| StorageError::Corruption(format!("unknown codec id {codec_id}")))?;
    let codec = get_codec(compressor, value_size);
    let payload = codec.decompress(body, uncompressed_len)?;
    if payload.len() != uncompressed_len {
        return Err(StorageError::Corruption(format!(
            "tile decompressed to {} bytes, frame declared {}",
            payload.len(),
            uncompressed_len
        )));
    }
    debug_assert_eq!(
        frame.len(),
        FRAME_HEADER_SIZE + compressed_len,
        "tile frame length inconsistent with header"
    );
    Ok(payload)
}

/// Total on-disk size of the frame starting at `header`, from its header
/// bytes alone.
pub fn frame_size(header: &[u8]) -> Result<usize> {
    if header.len() < 8 {
        return Err(StorageError::Corruption(
            "tile frame header truncated".to_string(),
        ));
    }
    let compressed_len = u64::from_le_bytes(header[..8].try_into().unwrap()) as usize;
    Ok(FRAME_HEADER_SIZE + compressed_len)
}
