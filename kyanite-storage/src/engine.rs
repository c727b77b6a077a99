//! # LSM Engine
//!
//! Coordinates memtable admission, flushes to level 0, and leveled
//! compaction.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  put ──> Memtable (skip list) ──> flush ──> level-0/<ts>.run│
//! │                                      │                      │
//! │                                      ▼                      │
//! │                              leveled compaction             │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  get ──> Memtable ──> level 0 (all overlapping, newest ts)  │
//! │                   ──> level 1.. (disjoint ranges)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Level 0 runs may overlap, so a lookup consults every candidate and
//! keeps the one with the largest timestamp. Levels 1 and deeper hold
//! pairwise-disjoint key ranges. The generation clock persists in run
//! headers and is recovered on open as the maximum loaded timestamp.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, warn};

use kyanite_core::config::StorageConfig;
use kyanite_core::error::Result;
use kyanite_core::types::{is_tombstone, Entry, Key, TOMBSTONE};

use crate::memtable::Memtable;
use crate::run::{RunWriter, SortedRun, BLOOM_BYTES, HEADER_SIZE, RUN_EXT};

/// Log-structured merge engine over one data directory.
pub struct LsmEngine {
    pub(crate) dir: PathBuf,
    pub(crate) config: StorageConfig,
    pub(crate) memtable: Memtable,
    pub(crate) levels: Vec<Vec<SortedRun>>,
    /// Monotonic generation counter, bumped per flush and per
    /// compaction output.
    pub(crate) clock: u64,
}

impl LsmEngine {
    /// Open an engine, loading every run header per level directory.
    /// Corrupt run files are skipped with a warning; only files
    /// enumerated inside `level-N/` directories are trusted.
    pub fn open(dir: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut levels: Vec<Vec<SortedRun>> = Vec::new();
        let mut clock = 0u64;
        for level in 0.. {
            let level_dir = dir.join(format!("level-{}", level));
            if !level_dir.is_dir() {
                break;
            }
            let mut runs = Vec::new();
            for entry in std::fs::read_dir(&level_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RUN_EXT) {
                    continue;
                }
                match SortedRun::open(&path) {
                    Ok(run) => {
                        clock = clock.max(run.timestamp());
                        runs.push(run);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable run");
                    }
                }
            }
            levels.push(runs);
        }

        info!(
            dir = %dir.display(),
            levels = levels.len(),
            runs = levels.iter().map(Vec::len).sum::<usize>(),
            clock,
            "opened LSM engine"
        );

        Ok(Self {
            dir,
            config,
            memtable: Memtable::new(),
            levels,
            clock,
        })
    }

    pub fn memtable(&self) -> &Memtable {
        &self.memtable
    }

    /// Every key currently present in any sorted run, level by level.
    /// Shadowed duplicates are not filtered here.
    pub fn run_keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.levels
            .iter()
            .flatten()
            .flat_map(|run| (0..run.len()).map(move |i| run.key_at(i)))
    }

    /// Whether inserting `value_len` bytes under `key` would push the
    /// encoded memtable past the run budget.
    pub fn would_overflow(&self, key: Key, value_len: usize) -> bool {
        let current = self.memtable.size_bytes();
        let predicted = match self.memtable.get(key) {
            Some(old) => current - old.len() + value_len,
            None => current + 12 + value_len,
        };
        predicted + HEADER_SIZE + BLOOM_BYTES > self.config.run_budget as usize
    }

    /// Insert directly into the memtable without checking the budget.
    /// Callers pairing this with [`would_overflow`](Self::would_overflow)
    /// and [`flush`](Self::flush) own the admission decision.
    pub fn insert(&mut self, key: Key, value: Bytes) {
        self.memtable.insert(key, value);
    }

    /// Insert with admission control: flush first when the memtable
    /// would overflow the run budget.
    pub fn put(&mut self, key: Key, value: Bytes) -> Result<()> {
        if self.would_overflow(key, value.len()) && !self.memtable.is_empty() {
            self.flush()?;
        }
        self.insert(key, value);
        Ok(())
    }

    /// Record a deletion by writing the tombstone value.
    pub fn del(&mut self, key: Key) -> Result<()> {
        self.put(key, Bytes::from_static(TOMBSTONE))
    }

    /// Freeze the memtable into a level-0 run, then compact if any
    /// level overflowed. A no-op on an empty memtable. The memtable is
    /// only reset after the run is fully written and registered.
    pub fn flush(&mut self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }

        let timestamp = self.next_timestamp();
        let level_dir = self.level_dir(0);
        std::fs::create_dir_all(&level_dir)?;
        let path = level_dir.join(format!("{}.{}", timestamp, RUN_EXT));

        let mut writer = RunWriter::new(&path, timestamp);
        for (key, value) in self.memtable.iter() {
            writer.add(key, value.clone())?;
        }
        let entries = writer.entry_count();
        writer.finish()?;

        let run = SortedRun::open(&path)?;
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(run);
        self.memtable.reset();

        info!(timestamp, entries, "flushed memtable to level 0");
        self.compact()
    }

    /// Point lookup: memtable first, then levels in order. Within a
    /// level every range-containing run is consulted and the newest
    /// timestamp wins; the first level that yields a record settles the
    /// answer. Tombstones read as absent.
    pub fn get(&self, key: Key) -> Option<Bytes> {
        if let Some(value) = self.memtable.get(key) {
            if is_tombstone(value) {
                return None;
            }
            return Some(value.clone());
        }

        for level_runs in &self.levels {
            let mut best: Option<(u64, Bytes)> = None;
            for run in level_runs {
                if !run.meta().covers(key) {
                    continue;
                }
                if let Some(value) = run.lookup(key) {
                    let newer = best
                        .as_ref()
                        .map(|&(ts, _)| run.timestamp() > ts)
                        .unwrap_or(true);
                    if newer {
                        best = Some((run.timestamp(), value));
                    }
                }
            }
            if let Some((_, value)) = best {
                if is_tombstone(&value) {
                    return None;
                }
                return Some(value);
            }
        }
        None
    }

    /// Ordered range scan over `[k1, k2]`: a k-way merge of the
    /// memtable and every intersecting run, emitting each key once from
    /// its newest record and suppressing tombstones.
    pub fn scan(&self, k1: Key, k2: Key) -> Vec<Entry> {
        let mut out = Vec::new();
        if k1 > k2 {
            return out;
        }

        let mem = self.memtable.scan(k1, k2);
        let mut runs: Vec<(&SortedRun, usize, usize)> = Vec::new();
        for run in self.levels.iter().flatten() {
            if !run.meta().overlaps(k1, k2) {
                continue;
            }
            let lo = run.range_lowerbound(k1);
            let mut hi = run.range_lowerbound(k2);
            if hi < run.len() && run.key_at(hi) == k2 {
                hi += 1;
            }
            if lo < hi {
                runs.push((run, lo, hi));
            }
        }

        let mut heap: BinaryHeap<MergePos> = BinaryHeap::new();
        if !mem.is_empty() {
            // The memtable always holds the newest record for its keys.
            heap.push(MergePos { key: mem[0].0, timestamp: u64::MAX, source: 0, pos: 0 });
        }
        for (i, &(run, lo, _)) in runs.iter().enumerate() {
            heap.push(MergePos {
                key: run.key_at(lo),
                timestamp: run.timestamp(),
                source: i + 1,
                pos: lo,
            });
        }

        let mut last_key: Option<Key> = None;
        while let Some(top) = heap.pop() {
            if last_key != Some(top.key) {
                last_key = Some(top.key);
                let value = if top.source == 0 {
                    mem[top.pos].1.clone()
                } else {
                    Bytes::copy_from_slice(runs[top.source - 1].0.value_at(top.pos))
                };
                if !is_tombstone(&value) {
                    out.push(Entry::new(top.key, value));
                }
            }

            let next_pos = top.pos + 1;
            if top.source == 0 {
                if next_pos < mem.len() {
                    heap.push(MergePos {
                        key: mem[next_pos].0,
                        timestamp: u64::MAX,
                        source: 0,
                        pos: next_pos,
                    });
                }
            } else {
                let (run, _, hi) = runs[top.source - 1];
                if next_pos < hi {
                    heap.push(MergePos {
                        key: run.key_at(next_pos),
                        timestamp: run.timestamp(),
                        source: top.source,
                        pos: next_pos,
                    });
                }
            }
        }
        out
    }

    /// Drop the memtable and every level directory.
    pub fn reset(&mut self) -> Result<()> {
        self.memtable.reset();
        for level in 0..self.levels.len() {
            let level_dir = self.level_dir(level);
            if level_dir.is_dir() {
                std::fs::remove_dir_all(&level_dir)?;
            }
        }
        self.levels.clear();
        info!("reset LSM engine state");
        Ok(())
    }

    pub(crate) fn level_dir(&self, level: usize) -> PathBuf {
        self.dir.join(format!("level-{}", level))
    }

    pub(crate) fn next_timestamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Merge cursor for the scan heap. Ordered so the `BinaryHeap` pops the
/// smallest key first, newest timestamp winning ties.
struct MergePos {
    key: Key,
    timestamp: u64,
    source: usize,
    pos: usize,
}

impl PartialEq for MergePos {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.timestamp == other.timestamp
    }
}

impl Eq for MergePos {}

impl PartialOrd for MergePos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergePos {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then(self.timestamp.cmp(&other.timestamp))
    }
}
