//! # Embedding Log
//!
//! Append-only persistence for per-key embedding vectors, tail-latest-
//! wins. Little-endian layout:
//!
//! ```text
//! u64 dimension | { u64 key, f32 * D } repeated
//! ```
//!
//! Multiple records for one key are history; recovery scans from the
//! tail and keeps the first record seen per key. A record whose vector
//! is the deleted-marker (every component `f32::MAX`) marks the key as
//! logically absent. The in-memory map is the source of truth between
//! flushes; persistence happens when the LSM freezes a memtable.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;
use tracing::{info, warn};

use kyanite_core::error::{Error, Result};
use kyanite_core::types::{is_tombstone, is_tombstone_vector, tombstone_vector, Key};

/// File name for the embedding log inside the data directory.
pub const EMBEDDINGS_FILE: &str = "embeddings.bin";

/// Append-only log of `(key, vector)` records with tail-latest-wins
/// recovery.
pub struct EmbeddingStore {
    path: PathBuf,
    dimension: Option<usize>,
    vectors: HashMap<Key, Vec<f32>>,
}

impl EmbeddingStore {
    /// Open the store under `dir`. A missing log file yields an empty
    /// store with the dimension unset. A malformed file contributes
    /// nothing: the in-memory state is cleared and a warning logged.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(EMBEDDINGS_FILE);
        let mut store = Self {
            path,
            dimension: None,
            vectors: HashMap::new(),
        };
        if store.path.is_file() {
            if let Err(e) = store.load() {
                warn!(path = %store.path.display(), error = %e, "discarding malformed embedding log");
                store.dimension = None;
                store.vectors.clear();
            }
        }
        Ok(store)
    }

    fn load(&mut self) -> Result<()> {
        let data = std::fs::read(&self.path)?;
        let corrupt = |message: &str| Error::Corruption {
            path: self.path.display().to_string(),
            message: message.to_string(),
        };

        if data.len() < 8 {
            return Err(corrupt("missing dimension header"));
        }
        let dim = LittleEndian::read_u64(&data[..8]) as usize;
        if dim == 0 {
            return Err(corrupt("zero dimension header"));
        }

        let block = 8 + dim * 4;
        let body = &data[8..];
        if body.len() % block != 0 {
            return Err(corrupt("record region not a multiple of the block size"));
        }

        // Tail to head: the first record seen per key is authoritative.
        let mut seen: HashSet<Key> = HashSet::new();
        for chunk in body.chunks_exact(block).rev() {
            let key = LittleEndian::read_u64(&chunk[..8]);
            if !seen.insert(key) {
                continue;
            }
            let mut vector = vec![0.0f32; dim];
            LittleEndian::read_f32_into(&chunk[8..], &mut vector);
            if !is_tombstone_vector(&vector) {
                self.vectors.insert(key, vector);
            }
        }

        self.dimension = Some(dim);
        info!(
            path = %self.path.display(),
            dimension = dim,
            keys = self.vectors.len(),
            "recovered embedding log"
        );
        Ok(())
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn get(&self, key: Key) -> Option<&Vec<f32>> {
        self.vectors.get(&key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.vectors.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Vec<f32>)> {
        self.vectors.iter()
    }

    /// Update the in-memory vector for `key`. The first non-sentinel
    /// vector fixes the dimension; later vectors must match it.
    pub fn upsert(&mut self, key: Key, vector: Vec<f32>) -> Result<()> {
        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        } else if !vector.is_empty() && !is_tombstone_vector(&vector) {
            self.dimension = Some(vector.len());
        }
        self.vectors.insert(key, vector);
        Ok(())
    }

    /// Drop the key from the in-memory map. Persistence of the
    /// deletion is deferred to the next flush.
    pub fn mark_deleted(&mut self, key: Key) {
        self.vectors.remove(&key);
    }

    /// Persist the vectors belonging to a frozen memtable: for each
    /// `(key, value)` entry, append the current in-memory vector, or
    /// the deleted-marker vector when the value is the LSM tombstone.
    /// Skipped entirely while the dimension is still unknown.
    pub fn append_flush_batch<'a>(
        &self,
        entries: impl Iterator<Item = (Key, &'a Bytes)>,
    ) -> Result<()> {
        let Some(dim) = self.dimension else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let new_file = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if new_file {
            writer.write_u64::<LittleEndian>(dim as u64)?;
        }

        let mut written = 0usize;
        for (key, value) in entries {
            let record: Option<&[f32]> = if is_tombstone(value) {
                None
            } else {
                self.vectors.get(&key).map(Vec::as_slice)
            };
            match record {
                Some(vector) if vector.len() == dim => {
                    writer.write_u64::<LittleEndian>(key)?;
                    for &component in vector {
                        writer.write_f32::<LittleEndian>(component)?;
                    }
                    written += 1;
                }
                Some(_) => {
                    warn!(key, "skipping vector with stale dimension during flush");
                }
                None if is_tombstone(value) => {
                    writer.write_u64::<LittleEndian>(key)?;
                    for &component in tombstone_vector(dim).iter() {
                        writer.write_f32::<LittleEndian>(component)?;
                    }
                    written += 1;
                }
                None => {}
            }
        }
        writer.flush()?;
        info!(records = written, "appended embedding records for flush");
        Ok(())
    }

    /// Clear the in-memory map and remove the log file.
    pub fn reset(&mut self) -> Result<()> {
        self.vectors.clear();
        if self.path.is_file() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
