//! # Hybrid Store
//!
//! The facade binding the three subsystems into one contract:
//!
//! ```text
//! put(k, v) ──> embed ──> LSM memtable ──> embedding map ──> HNSW
//! del(k)    ──> LSM tombstone ──> mark HNSW deleted ──> queue vector
//! knn       ──> exact cosine scan over every visible embedding
//! knn_hnsw  ──> greedy layered search ──> filter ──> materialize
//! ```
//!
//! On flush the frozen memtable drives the embedding log: every frozen
//! key gets its current vector appended, tombstoned keys the
//! deleted-marker vector. Dropping the store flushes a non-empty
//! memtable, logging rather than propagating failures.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{error, info, warn};

use kyanite_core::config::Config;
use kyanite_core::error::{Error, Result};
use kyanite_core::types::{
    is_tombstone, is_tombstone_vector, tombstone_vector, Key, SENTINEL_KEY, TOMBSTONE,
};
use kyanite_index::distance::cosine_similarity;
use kyanite_index::{snapshot, HnswIndex};
use kyanite_storage::{EmbeddingStore, LsmEngine};

use crate::embedder::Embedder;

/// Hybrid key-value store: LSM tree for values, embedding log plus
/// HNSW graph for vector search.
pub struct HybridStore {
    engine: LsmEngine,
    embeddings: EmbeddingStore,
    index: HnswIndex,
    embedder: Box<dyn Embedder>,
    /// Root of the last snapshot touched; cleaned up by `reset`.
    snapshot_root: Option<PathBuf>,
}

impl HybridStore {
    /// Open the store under `dir`. When `snapshot_path` points at a
    /// saved graph it is loaded; otherwise, or when loading yields
    /// nothing, the graph is rebuilt from the recovered embedding map.
    pub fn open(
        dir: impl AsRef<Path>,
        config: Config,
        embedder: Box<dyn Embedder>,
        snapshot_path: Option<&Path>,
    ) -> Result<Self> {
        let engine = LsmEngine::open(dir.as_ref(), config.storage)?;
        let embeddings = EmbeddingStore::open(dir.as_ref())?;
        let mut index = HnswIndex::new(config.index);

        if let Some(root) = snapshot_path {
            if let Err(e) = snapshot::load(&mut index, root, |key| {
                embeddings.get(key).cloned()
            }) {
                warn!(root = %root.display(), error = %e, "discarding unusable HNSW snapshot");
            }
        }

        if index.is_empty() && !embeddings.is_empty() {
            info!(
                vectors = embeddings.len(),
                "rebuilding HNSW graph from embedding log"
            );
            for (&key, vector) in embeddings.iter() {
                if !vector.is_empty() {
                    index.insert(key, vector.clone());
                }
            }
        }

        Ok(Self {
            engine,
            embeddings,
            index,
            embedder,
            snapshot_root: snapshot_path.map(Path::to_path_buf),
        })
    }

    /// Insert or update a record, computing its embedding from the
    /// value text.
    pub fn put(&mut self, key: Key, value: &str) -> Result<()> {
        let bytes = Bytes::copy_from_slice(value.as_bytes());
        let tomb = is_tombstone(&bytes);

        let vector = if !value.is_empty() && !tomb {
            let vector = self.embedder.embed(value);
            if vector.is_empty() {
                match self.embeddings.dimension() {
                    Some(dim) => {
                        warn!(key, "embedding failed, storing zero vector");
                        vec![0.0; dim]
                    }
                    // Dimension still unknown: write the LSM record and
                    // skip the vector path.
                    None => Vec::new(),
                }
            } else {
                if let Some(dim) = self.embeddings.dimension() {
                    if vector.len() != dim {
                        return Err(Error::DimensionMismatch {
                            expected: dim,
                            actual: vector.len(),
                        });
                    }
                }
                vector
            }
        } else if tomb {
            match self.embeddings.dimension() {
                Some(dim) => tombstone_vector(dim),
                None => Vec::new(),
            }
        } else {
            // Explicit empty value with a known dimension reads as a
            // zero vector.
            match self.embeddings.dimension() {
                Some(dim) => vec![0.0; dim],
                None => Vec::new(),
            }
        };

        self.put_record(key, bytes, vector)
    }

    /// Identical to [`put`](Self::put), with the embedding supplied by
    /// the caller.
    pub fn put_precomputed(&mut self, key: Key, value: &str, embedding: Vec<f32>) -> Result<()> {
        if !embedding.is_empty() {
            if let Some(dim) = self.embeddings.dimension() {
                if embedding.len() != dim {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        actual: embedding.len(),
                    });
                }
            }
        } else {
            warn!(key, "put_precomputed called with an empty embedding");
        }
        self.put_record(key, Bytes::copy_from_slice(value.as_bytes()), embedding)
    }

    fn put_record(&mut self, key: Key, value: Bytes, vector: Vec<f32>) -> Result<()> {
        // A replaced live vector is queued for the deleted-vector
        // sidecar unless it is the sentinel or already queued.
        if let Some(old) = self.embeddings.get(key) {
            if !old.is_empty() && !is_tombstone_vector(old) {
                let old = old.clone();
                self.index.record_deleted_vector(old);
            }
        }

        let tomb = is_tombstone(&value);
        let vector_is_real =
            !vector.is_empty() && !is_tombstone_vector(&vector);

        if tomb {
            self.embeddings.mark_deleted(key);
        } else if !vector.is_empty() {
            self.embeddings.upsert(key, vector.clone())?;
        }

        self.maybe_flush(key, value.len())?;
        self.engine.insert(key, value);

        if vector_is_real {
            self.index.insert(key, vector);
        } else if self.index.label_of(key).is_some() {
            self.index.mark_deleted(key);
        }
        Ok(())
    }

    /// Value for `key`, empty when missing or tombstoned.
    pub fn get(&self, key: Key) -> String {
        match self.engine.get(key) {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => String::new(),
        }
    }

    /// Delete a record. Returns false when the key is not visible.
    pub fn del(&mut self, key: Key) -> Result<bool> {
        if self.engine.get(key).is_none() {
            return Ok(false);
        }

        self.index.mark_deleted(key);
        self.embeddings.mark_deleted(key);

        self.maybe_flush(key, TOMBSTONE.len())?;
        self.engine.insert(key, Bytes::from_static(TOMBSTONE));
        Ok(true)
    }

    /// Ordered key-value pairs in `[k1, k2]`.
    pub fn scan(&self, k1: Key, k2: Key) -> Vec<(Key, String)> {
        self.engine
            .scan(k1, k2)
            .into_iter()
            .map(|e| (e.key, String::from_utf8_lossy(&e.value).into_owned()))
            .collect()
    }

    /// Exact top-k by cosine similarity over every visible embedding.
    pub fn knn(&self, query: &str, k: usize) -> Vec<(Key, String)> {
        let vector = self.embedder.embed(query);
        if vector.is_empty() {
            warn!("embedding failed for knn query");
            return Vec::new();
        }
        self.knn_vec(&vector, k)
    }

    /// Exact top-k for a caller-supplied query vector, descending
    /// similarity with the key as tie-breaker. Only keys whose current
    /// LSM value is non-empty are returned.
    pub fn knn_vec(&self, query: &[f32], k: usize) -> Vec<(Key, String)> {
        if query.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut processed: HashSet<Key> = HashSet::new();
        let mut ranked: Vec<(Key, f32)> = Vec::new();

        for (key, value) in self.engine.memtable().iter() {
            processed.insert(key);
            if is_tombstone(value) {
                continue;
            }
            if let Some(vector) = self.embeddings.get(key) {
                ranked.push((key, cosine_similarity(query, vector)));
            }
        }
        for key in self.engine.run_keys() {
            if !processed.insert(key) {
                continue;
            }
            if let Some(vector) = self.embeddings.get(key) {
                ranked.push((key, cosine_similarity(query, vector)));
            }
        }

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let mut out = Vec::new();
        for (key, _) in ranked {
            if out.len() >= k {
                break;
            }
            let value = self.get(key);
            if !value.is_empty() {
                out.push((key, value));
            }
        }
        out
    }

    /// Approximate top-k via the HNSW graph. Short string-query result
    /// lists are padded with the query text under the sentinel key so
    /// callers always receive `k` items.
    pub fn knn_hnsw(&self, query: &str, k: usize) -> Vec<(Key, String)> {
        let vector = self.embedder.embed(query);
        if vector.is_empty() {
            warn!("embedding failed for knn_hnsw query, returning diagnostic results");
            let mut out = vec![(SENTINEL_KEY, query.to_string())];
            for (&key, _) in self.embeddings.iter() {
                if out.len() >= k {
                    break;
                }
                let value = self.get(key);
                if !value.is_empty() {
                    out.push((key, value));
                }
            }
            return out;
        }
        self.knn_hnsw_impl(&vector, k, Some(query))
    }

    /// Approximate top-k for a caller-supplied query vector. No
    /// padding is applied.
    pub fn knn_hnsw_vec(&self, query: &[f32], k: usize) -> Vec<(Key, String)> {
        self.knn_hnsw_impl(query, k, None)
    }

    fn knn_hnsw_impl(
        &self,
        query: &[f32],
        k: usize,
        query_text: Option<&str>,
    ) -> Vec<(Key, String)> {
        if k == 0 {
            return Vec::new();
        }

        let mut out: Vec<(Key, String)> = Vec::new();
        for (_, key) in self.index.search(query, k) {
            if out.len() >= k {
                break;
            }
            let value = self.get(key);
            if !value.is_empty() {
                out.push((key, value));
            }
        }

        // Filtering can leave the list short; backfill from the exact
        // baseline before padding.
        if out.len() < k {
            for (key, value) in self.knn_vec(query, k * 2) {
                if out.len() >= k {
                    break;
                }
                if out.iter().all(|&(existing, _)| existing != key) {
                    out.push((key, value));
                }
            }
        }

        if let Some(text) = query_text {
            while out.len() < k {
                out.push((SENTINEL_KEY, text.to_string()));
            }
        }
        out
    }

    /// Persist the HNSW graph under `root`. `serial` forces the
    /// single-worker path.
    pub fn save_snapshot(&mut self, root: impl AsRef<Path>, serial: bool) -> Result<()> {
        snapshot::save(&self.index, root.as_ref(), serial)?;
        self.snapshot_root = Some(root.as_ref().to_path_buf());
        Ok(())
    }

    /// Replace the in-memory graph with a saved snapshot. Node vectors
    /// are re-resolved from the embedding map.
    pub fn load_snapshot(&mut self, root: impl AsRef<Path>) -> Result<()> {
        let embeddings = &self.embeddings;
        snapshot::load(&mut self.index, root.as_ref(), |key| {
            embeddings.get(key).cloned()
        })?;
        self.snapshot_root = Some(root.as_ref().to_path_buf());
        Ok(())
    }

    /// Persist the frozen memtable's embedding records, then flush the
    /// memtable to a level-0 run.
    pub fn flush(&mut self) -> Result<()> {
        if self.engine.memtable().is_empty() {
            return Ok(());
        }
        self.embeddings
            .append_flush_batch(self.engine.memtable().iter())?;
        self.engine.flush()
    }

    /// Wipe everything: memtable, level directories, embedding log,
    /// graph, deleted-vector lists, and any snapshot artifacts.
    pub fn reset(&mut self) -> Result<()> {
        self.engine.reset()?;
        self.embeddings.reset()?;
        self.index.clear();

        if let Some(root) = self.snapshot_root.clone() {
            for file in [snapshot::DELETED_NODES_FILE, snapshot::GLOBAL_HEADER_FILE] {
                let path = root.join(file);
                if path.is_file() {
                    std::fs::remove_file(&path)?;
                }
            }
            let nodes = root.join(snapshot::NODES_DIR);
            if nodes.is_dir() {
                std::fs::remove_dir_all(&nodes)?;
            }
        }
        info!("reset hybrid store");
        Ok(())
    }

    /// Flush the memtable first when admitting `value_len` more bytes
    /// for `key` would overflow the run budget.
    fn maybe_flush(&mut self, key: Key, value_len: usize) -> Result<()> {
        if self.engine.would_overflow(key, value_len) && !self.engine.memtable().is_empty() {
            self.flush()?;
        }
        Ok(())
    }
}

impl Drop for HybridStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "failed to flush memtable during shutdown");
        }
    }
}
