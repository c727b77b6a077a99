//! Sorted-run writer.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use tracing::debug;

use kyanite_core::error::{Error, Result};
use kyanite_core::types::Key;

use crate::memtable::ENTRY_OVERHEAD;
use crate::run::{encoded_size, BloomFilter, RunMeta};

/// Buffers strictly ascending entries and writes the complete run on
/// `finish`. The index precedes the value region in the file layout, so
/// entries stay in memory until the run is sealed.
pub struct RunWriter {
    path: PathBuf,
    timestamp: u64,
    entries: Vec<(Key, Bytes)>,
    payload: usize,
}

impl RunWriter {
    pub fn new(path: impl AsRef<Path>, timestamp: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timestamp,
            entries: Vec::new(),
            payload: 0,
        }
    }

    /// Append an entry. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: Key, value: Bytes) -> Result<()> {
        if let Some(&(last, _)) = self.entries.last() {
            if key <= last {
                return Err(Error::Run {
                    message: format!("out-of-order key {} after {}", key, last),
                });
            }
        }
        self.payload += ENTRY_OVERHEAD + value.len();
        self.entries.push((key, value));
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Encoded on-disk size if sealed now, header and bloom included.
    pub fn encoded_size(&self) -> usize {
        encoded_size(self.payload)
    }

    /// Write header, bloom, index, and values. Refuses to emit an
    /// empty run.
    pub fn finish(self) -> Result<RunMeta> {
        if self.entries.is_empty() {
            return Err(Error::Run {
                message: "refusing to write an empty run".to_string(),
            });
        }

        let min_key = self.entries.first().map(|&(k, _)| k).unwrap_or(0);
        let max_key = self.entries.last().map(|&(k, _)| k).unwrap_or(0);
        let meta = RunMeta {
            timestamp: self.timestamp,
            count: self.entries.len() as u64,
            min_key,
            max_key,
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);

        writer.write_u64::<LittleEndian>(meta.timestamp)?;
        writer.write_u64::<LittleEndian>(meta.count)?;
        writer.write_u64::<LittleEndian>(meta.min_key)?;
        writer.write_u64::<LittleEndian>(meta.max_key)?;

        let mut bloom = BloomFilter::new();
        for &(key, _) in &self.entries {
            bloom.insert(key);
        }
        writer.write_all(bloom.as_bytes())?;

        let mut offset = 0u32;
        for (key, value) in &self.entries {
            writer.write_u64::<LittleEndian>(*key)?;
            writer.write_u32::<LittleEndian>(offset)?;
            offset += value.len() as u32;
        }

        for (_, value) in &self.entries {
            writer.write_all(value)?;
        }
        writer.flush()?;

        debug!(
            path = %self.path.display(),
            entries = meta.count,
            timestamp = meta.timestamp,
            "wrote sorted run"
        );
        Ok(meta)
    }
}
