//! Cell sorting for unordered writes
//!
//! Unordered submissions are re-sorted into the array's cell order before
//! tiling. Cells accumulate in memory up to a budget; past it, sorted runs
//! spill to anonymous temp files and the final stream is a k-way merge of
//! the spilled runs and the in-memory tail.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use log::debug;

use crate::error::{Result, StorageError};

/// One cell traveling through the sort: its sort key, raw coordinates, and
/// one value buffer per attribute.
#[derive(Debug, Clone)]
pub struct CellRecord {
    pub key: Vec<u64>,
    pub coords: Vec<u8>,
    pub values: Vec<Vec<u8>>,
}

impl CellRecord {
    fn heap_bytes(&self) -> usize {
        48 + self.key.len() * 8
            + self.coords.len()
            + self.values.iter().map(|v| v.len() + 24).sum::<usize>()
    }

    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(&(self.key.len() as u32).to_le_bytes())?;
        for &k in &self.key {
            out.write_all(&k.to_le_bytes())?;
        }
        out.write_all(&(self.coords.len() as u32).to_le_bytes())?;
        out.write_all(&self.coords)?;
        out.write_all(&(self.values.len() as u32).to_le_bytes())?;
        for value in &self.values {
            out.write_all(&(value.len() as u32).to_le_bytes())?;
            out.write_all(value)?;
        }
        Ok(())
    }

    fn read_from(input: &mut impl Read) -> std::io::Result<Option<Self>> {
        let mut len4 = [0u8; 4];
        match input.read(&mut len4)? {
            0 => return Ok(None),
            4 => {}
            n => input.read_exact(&mut len4[n..])?,
        }
        let key_len = u32::from_le_bytes(len4) as usize;
        let mut key = Vec::with_capacity(key_len);
        let mut word = [0u8; 8];
        for _ in 0..key_len {
            input.read_exact(&mut word)?;
            key.push(u64::from_le_bytes(word));
        }
        input.read_exact(&mut len4)?;
        let mut coords = vec![0u8; u32::from_le_bytes(len4) as usize];
        input.read_exact(&mut coords)?;
        input.read_exact(&mut len4)?;
        let value_count = u32::from_le_bytes(len4) as usize;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            input.read_exact(&mut len4)?;
            let mut value = vec![0u8; u32::from_le_bytes(len4) as usize];
            input.read_exact(&mut value)?;
            values.push(value);
        }
        Ok(Some(Self { key, coords, values }))
    }
}

/// Accumulates cells and hands back one stream sorted by key.
pub struct CellSorter {
    budget: usize,
    used: usize,
    records: Vec<CellRecord>,
    runs: Vec<BufReader<File>>,
}

impl CellSorter {
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
            used: 0,
            records: Vec::new(),
            runs: Vec::new(),
        }
    }

    pub fn push(&mut self, record: CellRecord) -> Result<()> {
        self.used += record.heap_bytes();
        self.records.push(record);
        if self.used > self.budget {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        self.records.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(
            "spilling sorted run of {} cells ({} bytes in memory)",
            self.records.len(),
            self.used
        );
        let file = tempfile::tempfile()
            .map_err(|e| StorageError::io("<sort spill>", e))?;
        let mut writer = BufWriter::new(file);
        for record in self.records.drain(..) {
            record
                .write_to(&mut writer)
                .map_err(|e| StorageError::io("<sort spill>", e))?;
        }
        let mut file = writer
            .into_inner()
            .map_err(|e| StorageError::io("<sort spill>", e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::io("<sort spill>", e))?;
        self.runs.push(BufReader::new(file));
        self.used = 0;
        Ok(())
    }

    /// Sort whatever is buffered and return the merged stream.
    pub fn finish(mut self) -> Result<CellStream> {
        self.records.sort_by(|a, b| a.key.cmp(&b.key));
        let mut sources: Vec<RunSource> = self
            .runs
            .into_iter()
            .map(RunSource::File)
            .collect();
        sources.push(RunSource::Memory(self.records.into_iter()));

        let mut heap = BinaryHeap::new();
        for (run, source) in sources.iter_mut().enumerate() {
            if let Some(record) = source.next()? {
                heap.push(HeapItem { record, run });
            }
        }
        Ok(CellStream { sources, heap })
    }
}

enum RunSource {
    Memory(std::vec::IntoIter<CellRecord>),
    File(BufReader<File>),
}

impl RunSource {
    fn next(&mut self) -> Result<Option<CellRecord>> {
        match self {
            RunSource::Memory(iter) => Ok(iter.next()),
            RunSource::File(reader) => {
                CellRecord::read_from(reader).map_err(|e| StorageError::io("<sort spill>", e))
            }
        }
    }
}

struct HeapItem {
    record: CellRecord,
    run: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.run == other.run
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for smallest-key-first.
        other
            .record
            .key
            .cmp(&self.record.key)
            .then_with(|| other.run.cmp(&self.run))
    }
}

/// Merged, key-ordered stream of cell records.
pub struct CellStream {
    sources: Vec<RunSource>,
    heap: BinaryHeap<HeapItem>,
}

impl CellStream {
    pub fn next(&mut self) -> Result<Option<CellRecord>> {
        let Some(item) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(record) = self.sources[item.run].next()? {
            self.heap.push(HeapItem {
                record,
                run: item.run,
            });
        }
        Ok(Some(item.record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: u64, payload: u8) -> CellRecord {
        CellRecord {
            key: vec![key],
            coords: vec![payload; 8],
            values: vec![vec![payload; 4], vec![payload; 3]],
        }
    }

    fn drain(mut stream: CellStream) -> Vec<CellRecord> {
        let mut out = Vec::new();
        while let Some(r) = stream.next().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_in_memory_sort() {
        let mut sorter = CellSorter::new(1 << 20);
        for key in [5u64, 1, 9, 3, 7] {
            sorter.push(record(key, key as u8)).unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        let keys: Vec<u64> = out.iter().map(|r| r.key[0]).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        assert_eq!(out[0].coords, vec![1u8; 8]);
        assert_eq!(out[0].values[1], vec![1u8; 3]);
    }

    #[test]
    fn test_spilled_merge() {
        // A budget small enough to force several spills.
        let mut sorter = CellSorter::new(400);
        let mut keys: Vec<u64> = (0..200).map(|i| (i * 37) % 200).collect();
        for &key in &keys {
            sorter.push(record(key, (key % 251) as u8)).unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        keys.sort_unstable();
        let sorted: Vec<u64> = out.iter().map(|r| r.key[0]).collect();
        assert_eq!(sorted, keys);
        // Payloads survive the spill round trip.
        for r in &out {
            assert_eq!(r.coords, vec![(r.key[0] % 251) as u8; 8]);
        }
    }

    #[test]
    fn test_multiword_keys_compare_lexicographically() {
        let mut sorter = CellSorter::new(1 << 20);
        for key in [vec![1u64, 9], vec![0, 50], vec![1, 2]] {
            sorter
                .push(CellRecord {
                    key,
                    coords: Vec::new(),
                    values: Vec::new(),
                })
                .unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        let keys: Vec<Vec<u64>> = out.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![vec![0, 50], vec![1, 2], vec![1, 9]]);
    }

    #[test]
    fn test_empty_sorter() {
        let sorter = CellSorter::new(64);
        let out = drain(sorter.finish().unwrap());
        assert!(out.is_empty());
    }
}
