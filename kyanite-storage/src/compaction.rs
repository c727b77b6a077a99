//! # Leveled Compaction
//!
//! Level 0 holds up to `level0_limit` possibly-overlapping runs; level
//! `L >= 1` holds up to `2^(L+1)` runs with pairwise-disjoint key
//! ranges. When a level overflows, its victims are merged with every
//! overlapping run one level down and rewritten as fresh runs sized to
//! the run budget.
//!
//! - Level 0 overflow merges **all** level-0 runs (they overlap freely)
//!   plus the intersecting level-1 runs.
//! - Level `L >= 1` overflow selects the oldest `count - cap` runs by
//!   timestamp plus the intersecting runs from `L + 1`.
//!
//! Tombstones are dropped only when the output level is the deepest
//! populated level; above that they keep shadowing older records.
//! Input files are deleted only after every output is written and
//! registered, so a failed compaction leaves the previous on-disk
//! state intact.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, info};

use kyanite_core::error::Result;
use kyanite_core::types::{is_tombstone, Key};

use crate::engine::LsmEngine;
use crate::memtable::ENTRY_OVERHEAD;
use crate::run::{encoded_size, RunWriter, SortedRun, RUN_EXT};

impl LsmEngine {
    /// Merge overflowing levels until every level fits its capacity.
    pub(crate) fn compact(&mut self) -> Result<()> {
        while let Some(level) = self.overflowing_level() {
            self.compact_level(level)?;
        }
        Ok(())
    }

    fn overflowing_level(&self) -> Option<usize> {
        self.levels
            .iter()
            .enumerate()
            .find(|(level, runs)| runs.len() > self.config.level_capacity(*level))
            .map(|(level, _)| level)
    }

    fn compact_level(&mut self, level: usize) -> Result<()> {
        let cap = self.config.level_capacity(level);

        // Victims in the overflowing level: everything at level 0, the
        // oldest count - cap runs elsewhere.
        let upper: Vec<usize> = if level == 0 {
            (0..self.levels[0].len()).collect()
        } else {
            let mut by_age: Vec<(u64, usize)> = self.levels[level]
                .iter()
                .enumerate()
                .map(|(i, run)| (run.timestamp(), i))
                .collect();
            by_age.sort_unstable();
            by_age
                .into_iter()
                .take(self.levels[level].len() - cap)
                .map(|(_, i)| i)
                .collect()
        };

        let min_key = upper
            .iter()
            .map(|&i| self.levels[level][i].meta().min_key)
            .min()
            .unwrap_or(Key::MAX);
        let max_key = upper
            .iter()
            .map(|&i| self.levels[level][i].meta().max_key)
            .max()
            .unwrap_or(0);

        let lower: Vec<usize> = match self.levels.get(level + 1) {
            Some(runs) => runs
                .iter()
                .enumerate()
                .filter(|(_, run)| run.meta().overlaps(min_key, max_key))
                .map(|(i, _)| i)
                .collect(),
            None => Vec::new(),
        };

        // A tombstone that reaches the deepest populated level has
        // nothing left to shadow.
        let output_is_bottom = self
            .levels
            .get(level + 2..)
            .map(|deeper| deeper.iter().all(Vec::is_empty))
            .unwrap_or(true);

        let inputs: Vec<&SortedRun> = upper
            .iter()
            .map(|&i| &self.levels[level][i])
            .chain(lower.iter().map(|&i| &self.levels[level + 1][i]))
            .collect();
        let input_paths: Vec<PathBuf> =
            inputs.iter().map(|run| run.path().to_path_buf()).collect();

        info!(
            level,
            upper = upper.len(),
            lower = lower.len(),
            output_is_bottom,
            "compacting level"
        );

        let merged = merge_latest_wins(&inputs, output_is_bottom);
        drop(inputs);

        // Write outputs before touching any input: new timestamps, new
        // files, registered into the level index on success.
        let mut new_runs = Vec::new();
        if !merged.is_empty() {
            let out_dir = self.level_dir(level + 1);
            std::fs::create_dir_all(&out_dir)?;

            let mut pending: Option<RunWriter> = None;
            let mut payload = 0usize;
            for (key, value) in merged {
                let entry_bytes = ENTRY_OVERHEAD + value.len();
                if let Some(open) = pending.take() {
                    if encoded_size(payload + entry_bytes) > self.config.run_budget as usize {
                        open.finish()?;
                        payload = 0;
                    } else {
                        pending = Some(open);
                    }
                }
                if pending.is_none() {
                    let timestamp = self.next_timestamp();
                    let path = out_dir.join(format!("{}.{}", timestamp, RUN_EXT));
                    new_runs.push(path.clone());
                    pending = Some(RunWriter::new(path, timestamp));
                }
                if let Some(writer) = pending.as_mut() {
                    writer.add(key, value)?;
                }
                payload += entry_bytes;
            }
            if let Some(writer) = pending {
                writer.finish()?;
            }
        }

        while self.levels.len() <= level + 1 {
            self.levels.push(Vec::new());
        }
        for path in &new_runs {
            let run = SortedRun::open(path)?;
            self.levels[level + 1].push(run);
        }

        // Outputs are durable and indexed; now retire the inputs.
        self.levels[level].retain(|run| !input_paths.contains(&run.path().to_path_buf()));
        if self.levels.len() > level + 1 {
            self.levels[level + 1]
                .retain(|run| !input_paths.contains(&run.path().to_path_buf()));
        }
        for path in &input_paths {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "failed to remove compacted run");
            }
        }

        info!(level, outputs = new_runs.len(), "compaction finished");
        Ok(())
    }
}

/// K-way merge across runs keeping only the newest record per key.
/// Tombstones survive unless the output sits at the bottom level.
fn merge_latest_wins(inputs: &[&SortedRun], drop_tombstones: bool) -> Vec<(Key, Bytes)> {
    let mut heap: BinaryHeap<MergeCursor> = BinaryHeap::new();
    for (source, run) in inputs.iter().enumerate() {
        if !run.is_empty() {
            heap.push(MergeCursor {
                key: run.key_at(0),
                timestamp: run.timestamp(),
                source,
                pos: 0,
            });
        }
    }

    let mut merged = Vec::new();
    let mut last_key: Option<Key> = None;
    while let Some(top) = heap.pop() {
        if last_key != Some(top.key) {
            last_key = Some(top.key);
            let value = Bytes::copy_from_slice(inputs[top.source].value_at(top.pos));
            if !(drop_tombstones && is_tombstone(&value)) {
                merged.push((top.key, value));
            }
        }
        let next_pos = top.pos + 1;
        if next_pos < inputs[top.source].len() {
            heap.push(MergeCursor {
                key: inputs[top.source].key_at(next_pos),
                timestamp: top.timestamp,
                source: top.source,
                pos: next_pos,
            });
        }
    }
    merged
}

/// Ordered so the `BinaryHeap` pops the smallest key first, with the
/// newest timestamp winning ties.
struct MergeCursor {
    key: Key,
    timestamp: u64,
    source: usize,
    pos: usize,
}

impl PartialEq for MergeCursor {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.timestamp == other.timestamp
    }
}

impl Eq for MergeCursor {}

impl PartialOrd for MergeCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then(self.timestamp.cmp(&other.timestamp))
    }
}
