//! Utility functions

use std::mem;

use crate::error::{Result, StorageError};

/// Convert raw little-endian bytes to typed data.
pub fn bytes_to_typed_data<T: Copy>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % mem::size_of::<T>() != 0 {
        return Err(StorageError::InvalidArgument(
            "byte length not aligned with data type size".to_string(),
        ));
    }

    let count = bytes.len() / mem::size_of::<T>();
    let mut data = Vec::with_capacity(count);

    unsafe {
        let ptr = bytes.as_ptr() as *const T;
        for i in 0..count {
            data.push(ptr.add(i).read_unaligned());
        }
    }

    Ok(data)
}

/// Convert typed data to raw bytes.
pub fn typed_data_to_bytes<T: Copy>(data: &[T]) -> Vec<u8> {
    let byte_len = mem::size_of_val(data);
    let mut bytes = Vec::with_capacity(byte_len);

    unsafe {
        let ptr = data.as_ptr() as *const u8;
        for i in 0..byte_len {
            bytes.push(*ptr.add(i));
        }
    }

    bytes
}

/// Format byte size in human-readable form.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Append-only writer for the little-endian binary records used by the
/// schema and book-keeping files.
#[derive(Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// u32 byte count followed by the bytes.
    pub fn write_len_prefixed(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.write_bytes(v);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a little-endian binary record; short reads report corruption.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(StorageError::Corruption(format!(
                "record truncated at offset {} (wanted {} more bytes of {})",
                self.pos,
                n,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let n = self.read_u32()? as usize;
        self.take(n)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_conversion() {
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let bytes = typed_data_to_bytes(&data);
        assert_eq!(bytes.len(), data.len() * 4);

        let recovered: Vec<f32> = bytes_to_typed_data(&bytes).unwrap();
        assert_eq!(data, recovered);
    }

    #[test]
    fn test_bytes_conversion_unaligned() {
        let mut bytes = typed_data_to_bytes(&[7i64, -3i64]);
        bytes.insert(0, 0xff);
        let recovered: Vec<i64> = bytes_to_typed_data(&bytes[1..]).unwrap();
        assert_eq!(recovered, vec![7, -3]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_record_round_trip() {
        let mut w = RecordWriter::new();
        w.write_u32(0xDEADBEEF);
        w.write_u8(7);
        w.write_u64(1 << 40);
        w.write_i32(-9);
        w.write_len_prefixed(b"attr_name");
        let bytes = w.into_bytes();

        let mut r = RecordReader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_i32().unwrap(), -9);
        assert_eq!(r.read_len_prefixed().unwrap(), b"attr_name");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_record_truncation_is_corruption() {
        let mut r = RecordReader::new(&[1, 2]);
        assert!(matches!(
            r.read_u64(),
            Err(StorageError::Corruption(_))
        ));
    }
}
