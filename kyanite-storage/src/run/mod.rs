//! # Sorted Runs
//!
//! Immutable on-disk sorted files produced by memtable flushes and
//! compactions. Little-endian layout:
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────────┬─────────────┐
//! │ header (32)  │ bloom (10240) │ index (12 * n) │ values      │
//! ├──────────────┼───────────────┼────────────────┼─────────────┤
//! │ timestamp u64│ fixed-size    │ key u64        │ packed      │
//! │ count     u64│ bit array     │ offset u32     │ byte blobs  │
//! │ min key   u64│               │ (per entry)    │             │
//! │ max key   u64│               │                │             │
//! └──────────────┴───────────────┴────────────────┴─────────────┘
//! ```
//!
//! Value `i` spans `[offset_i, offset_{i+1})` in the value region, with
//! `offset_n` equal to the region length. Lookups probe the bloom
//! filter, binary-search the index, then slice the value region.

mod bloom;
mod reader;
mod writer;

pub use bloom::BloomFilter;
pub use reader::{RunIter, SortedRun};
pub use writer::RunWriter;

use kyanite_core::types::Key;

/// Fixed header size: four u64 fields.
pub const HEADER_SIZE: usize = 32;

/// Fixed bloom filter size in bytes.
pub const BLOOM_BYTES: usize = 10240;

/// Index entry size: u64 key plus u32 offset.
pub const INDEX_ENTRY_SIZE: usize = 12;

/// File extension for sorted runs.
pub const RUN_EXT: &str = "run";

/// Decoded fixed header of a sorted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMeta {
    /// Monotonic generation stamp; larger wins on key collisions.
    pub timestamp: u64,
    /// Number of entries.
    pub count: u64,
    pub min_key: Key,
    pub max_key: Key,
}

impl RunMeta {
    /// Whether `key` falls inside this run's key range.
    pub fn covers(&self, key: Key) -> bool {
        self.min_key <= key && key <= self.max_key
    }

    /// Whether this run's key range intersects `[k1, k2]`.
    pub fn overlaps(&self, k1: Key, k2: Key) -> bool {
        !(self.max_key < k1 || self.min_key > k2)
    }
}

/// Encoded size of a run whose entries carry `payload` bytes of keys,
/// offsets, and values (`payload` = sum of `12 + len(value)`).
pub fn encoded_size(payload: usize) -> usize {
    HEADER_SIZE + BLOOM_BYTES + payload
}
