//! Sorted-run reader.

use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use memmap2::Mmap;

use kyanite_core::error::{Error, Result};
use kyanite_core::types::Key;

use crate::run::{BloomFilter, RunMeta, BLOOM_BYTES, HEADER_SIZE, INDEX_ENTRY_SIZE};

/// An immutable sorted run opened for reading.
///
/// The header, bloom filter, and key index live in memory; the value
/// region is served from a memory map.
pub struct SortedRun {
    path: PathBuf,
    meta: RunMeta,
    bloom: BloomFilter,
    index: Vec<(Key, u32)>,
    mmap: Mmap,
    values_start: usize,
}

impl SortedRun {
    /// Open a run and validate its layout. Short or misaligned files
    /// are rejected as corruption.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| Error::Io {
                message: format!("failed to mmap run {}", path.display()),
                source: e,
            })?
        };

        let corrupt = |message: &str| Error::Corruption {
            path: path.display().to_string(),
            message: message.to_string(),
        };

        if mmap.len() < HEADER_SIZE + BLOOM_BYTES {
            return Err(corrupt("file shorter than header and bloom filter"));
        }

        let mut cursor = Cursor::new(&mmap[..HEADER_SIZE]);
        let timestamp = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u64::<LittleEndian>()?;
        let min_key = cursor.read_u64::<LittleEndian>()?;
        let max_key = cursor.read_u64::<LittleEndian>()?;
        let meta = RunMeta { timestamp, count, min_key, max_key };

        let n = count as usize;
        let values_start = HEADER_SIZE + BLOOM_BYTES + n * INDEX_ENTRY_SIZE;
        if mmap.len() < values_start {
            return Err(corrupt("file shorter than its key index"));
        }
        if n == 0 {
            return Err(corrupt("run contains no entries"));
        }

        let bloom = BloomFilter::from_bytes(
            mmap[HEADER_SIZE..HEADER_SIZE + BLOOM_BYTES].to_vec(),
        );

        let value_region = (mmap.len() - values_start) as u32;
        let mut index = Vec::with_capacity(n);
        let mut cursor = Cursor::new(&mmap[HEADER_SIZE + BLOOM_BYTES..values_start]);
        let mut prev_key = None;
        let mut prev_offset = 0u32;
        for _ in 0..n {
            let key = cursor.read_u64::<LittleEndian>()?;
            let offset = cursor.read_u32::<LittleEndian>()?;
            if let Some(prev) = prev_key {
                if key <= prev {
                    return Err(corrupt("index keys not strictly ascending"));
                }
                if offset < prev_offset {
                    return Err(corrupt("value offsets not monotonic"));
                }
            }
            if offset > value_region {
                return Err(corrupt("value offset past end of file"));
            }
            prev_key = Some(key);
            prev_offset = offset;
            index.push((key, offset));
        }

        Ok(Self { path, meta, bloom, index, mmap, values_start })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    pub fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn key_at(&self, i: usize) -> Key {
        self.index[i].0
    }

    pub fn offset_at(&self, i: usize) -> u32 {
        self.index[i].1
    }

    /// Value bytes for entry `i`, sliced from the memory map.
    pub fn value_at(&self, i: usize) -> &[u8] {
        let start = self.values_start + self.index[i].1 as usize;
        let end = if i + 1 < self.index.len() {
            self.values_start + self.index[i + 1].1 as usize
        } else {
            self.mmap.len()
        };
        &self.mmap[start..end]
    }

    /// Point lookup: bloom probe, then binary search over the index.
    pub fn lookup(&self, key: Key) -> Option<Bytes> {
        if !self.meta.covers(key) || !self.bloom.contains(key) {
            return None;
        }
        match self.index.binary_search_by_key(&key, |&(k, _)| k) {
            Ok(i) => Some(Bytes::copy_from_slice(self.value_at(i))),
            Err(_) => None,
        }
    }

    /// Index of the first entry with `key_at(i) >= key`; `len()` when
    /// every key is smaller.
    pub fn range_lowerbound(&self, key: Key) -> usize {
        self.index.partition_point(|&(k, _)| k < key)
    }

    /// Iterate all entries in key order.
    pub fn iter(&self) -> RunIter<'_> {
        RunIter { run: self, pos: 0 }
    }
}

/// Ordered iterator over a run's entries.
pub struct RunIter<'a> {
    run: &'a SortedRun,
    pos: usize,
}

impl<'a> Iterator for RunIter<'a> {
    type Item = (Key, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.run.len() {
            return None;
        }
        let item = (self.run.key_at(self.pos), self.run.value_at(self.pos));
        self.pos += 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunWriter;
    use tempfile::TempDir;

    fn write_sample(dir: &TempDir, n: u64) -> std::path::PathBuf {
        let path = dir.path().join("7.run");
        let mut writer = RunWriter::new(&path, 7);
        for k in 0..n {
            writer.add(k * 2, Bytes::from(format!("value-{}", k))).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, 100);

        let run = SortedRun::open(&path).unwrap();
        assert_eq!(run.timestamp(), 7);
        assert_eq!(run.len(), 100);
        assert_eq!(run.meta().min_key, 0);
        assert_eq!(run.meta().max_key, 198);

        assert_eq!(run.lookup(10).unwrap().as_ref(), b"value-5");
        assert!(run.lookup(11).is_none());
        assert!(run.lookup(500).is_none());
    }

    #[test]
    fn test_keys_strictly_ascending() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, 50);
        let run = SortedRun::open(&path).unwrap();
        for i in 0..run.len() - 1 {
            assert!(run.key_at(i) < run.key_at(i + 1));
        }
    }

    #[test]
    fn test_iter_yields_everything_in_order() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, 25);
        let run = SortedRun::open(&path).unwrap();

        let mut count = 0;
        let mut prev: Option<u64> = None;
        for (key, value) in run.iter() {
            if let Some(p) = prev {
                assert!(key > p);
            }
            assert_eq!(value, format!("value-{}", key / 2).as_bytes());
            prev = Some(key);
            count += 1;
        }
        assert_eq!(count, 25);
    }

    #[test]
    fn test_lowerbound() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, 10);
        let run = SortedRun::open(&path).unwrap();
        assert_eq!(run.range_lowerbound(0), 0);
        assert_eq!(run.range_lowerbound(3), 2);
        assert_eq!(run.range_lowerbound(4), 2);
        assert_eq!(run.range_lowerbound(19), 10);
    }

    #[test]
    fn test_writer_rejects_disorder() {
        let dir = TempDir::new().unwrap();
        let mut writer = RunWriter::new(dir.path().join("1.run"), 1);
        writer.add(5, Bytes::from("a")).unwrap();
        assert!(writer.add(5, Bytes::from("b")).is_err());
        assert!(writer.add(3, Bytes::from("c")).is_err());
    }

    #[test]
    fn test_writer_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let writer = RunWriter::new(dir.path().join("1.run"), 1);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.run");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        match SortedRun::open(&path) {
            Err(Error::Corruption { .. }) => {}
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }
}
