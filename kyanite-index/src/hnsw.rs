//! # HNSW Proximity Graph
//!
//! Hierarchical Navigable Small World index over per-key embedding
//! vectors, supporting approximate nearest-neighbor search under
//! cosine distance.
//!
//! ```text
//! Level 2:        ep ───────────────── n7
//! Level 1:        ep ──── n3 ──── n7 ── n9
//! Level 0:  n1 ── ep ── n3 ── n5 ── n7 ── n9 ── n12
//! ```
//!
//! Nodes live in an arena indexed by label; labels are never reused.
//! Each node owns its vector and its per-level outgoing neighbor
//! lists; incoming edges are implied by the other nodes' lists. A
//! `deleted` node stays in the arena so the graph remains navigable,
//! but never appears in results.
//!
//! Deletions are remembered twice: the `deleted` flag filters live
//! nodes, and the deleted vector itself is queued in
//! `pending_deleted_vectors` for the snapshot sidecar, which filters
//! reloaded graphs at search time.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use tracing::debug;

use kyanite_core::config::HnswConfig;
use kyanite_core::types::Key;

use crate::distance::{cosine_distance, vectors_close, EPSILON_SEARCH, EPSILON_UPDATE};

/// Safety bound for the unclamped level sampler.
const MAX_SAMPLED_LEVEL: usize = 32;

/// One graph node. `connections[l]` holds the outgoing neighbor labels
/// at level `l`.
pub struct HnswNode {
    pub key: Key,
    pub max_level: usize,
    pub vector: Vec<f32>,
    pub connections: Vec<Vec<usize>>,
    pub deleted: bool,
}

/// Layered proximity graph with lazy deletion.
pub struct HnswIndex {
    pub(crate) config: HnswConfig,
    /// Arena of nodes; the index is the label.
    pub(crate) nodes: Vec<HnswNode>,
    pub(crate) key_to_label: HashMap<Key, usize>,
    pub(crate) entry_point: usize,
    /// `None` while the graph is empty.
    pub(crate) current_max_level: Option<usize>,
    /// Dimension fixed by the first inserted vector.
    pub(crate) dimension: Option<usize>,
    /// Vectors of deleted nodes awaiting the next snapshot.
    pub(crate) pending_deleted: Vec<Vec<f32>>,
    /// Deleted vectors recovered from a snapshot sidecar; consulted
    /// when filtering search results.
    pub(crate) persisted_deleted: Vec<Vec<f32>>,
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            key_to_label: HashMap::new(),
            entry_point: 0,
            current_max_level: None,
            dimension: None,
            pending_deleted: Vec::new(),
            persisted_deleted: Vec::new(),
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of non-deleted nodes.
    pub fn active_len(&self) -> usize {
        self.nodes.iter().filter(|n| !n.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.current_max_level.is_none()
    }

    pub fn label_of(&self, key: Key) -> Option<usize> {
        self.key_to_label.get(&key).copied()
    }

    pub fn node(&self, label: usize) -> Option<&HnswNode> {
        self.nodes.get(label)
    }

    pub fn pending_deleted(&self) -> &[Vec<f32>] {
        &self.pending_deleted
    }

    pub fn persisted_deleted(&self) -> &[Vec<f32>] {
        &self.persisted_deleted
    }

    /// Drop every node, mapping, and deleted-vector list.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.key_to_label.clear();
        self.entry_point = 0;
        self.current_max_level = None;
        self.pending_deleted.clear();
        self.persisted_deleted.clear();
    }

    /// Remember `vector` for the snapshot sidecar unless it already
    /// matches a queued or persisted deleted vector.
    pub fn record_deleted_vector(&mut self, vector: Vec<f32>) {
        if vector.is_empty() {
            return;
        }
        let known = self
            .persisted_deleted
            .iter()
            .chain(self.pending_deleted.iter())
            .any(|v| vectors_close(v, &vector, EPSILON_UPDATE));
        if !known {
            self.pending_deleted.push(vector);
        }
    }

    /// Whether `vector` matches any persisted deleted vector at the
    /// strict search tolerance.
    pub fn matches_persisted_deleted(&self, vector: &[f32]) -> bool {
        self.persisted_deleted
            .iter()
            .any(|v| vectors_close(v, vector, EPSILON_SEARCH))
    }

    /// Insert or rewrite the node for `key`.
    ///
    /// An existing label is reused in place: its connections are
    /// cleared at every level and the node gets a freshly sampled
    /// level. A new key allocates the next label. The degree of every
    /// touched node stays within `M_max` per level.
    pub fn insert(&mut self, key: Key, vector: Vec<f32>) {
        if self.dimension.is_none() {
            self.dimension = Some(vector.len());
        }

        let label = match self.key_to_label.get(&key) {
            Some(&existing) => {
                for level_list in self.nodes[existing].connections.iter_mut() {
                    level_list.clear();
                }
                existing
            }
            None => {
                self.nodes.push(HnswNode {
                    key,
                    max_level: 0,
                    vector: Vec::new(),
                    connections: Vec::new(),
                    deleted: true,
                });
                let label = self.nodes.len() - 1;
                self.key_to_label.insert(key, label);
                label
            }
        };

        let node_level = sample_level(self.config.m_l());
        {
            let node = &mut self.nodes[label];
            node.key = key;
            node.max_level = node_level;
            node.deleted = false;
            node.vector = vector.clone();
            node.connections = vec![Vec::new(); node_level + 1];
        }
        debug!(key, label, node_level, "hnsw insert");

        let Some(top_level) = self.current_max_level else {
            self.entry_point = label;
            self.current_max_level = Some(node_level);
            return;
        };

        let query = vector;

        // Descend with ef = 1 to find the entry for the node's levels.
        let mut entry = self.entry_point;
        for level in (node_level + 1..=top_level).rev() {
            if let Some(&(_, closest)) = self.search_layer(entry, &query, level, 1).first() {
                entry = closest;
            }
        }

        // Connect from the highest shared level down to the base.
        let m = self.config.m;
        let m_max = self.config.m_max;
        for level in (0..=node_level.min(top_level)).rev() {
            let candidates =
                self.search_layer(entry, &query, level, self.config.ef_construction);
            let neighbors: Vec<usize> = candidates
                .iter()
                .filter(|&&(_, l)| l != label)
                .take(m)
                .map(|&(_, l)| l)
                .collect();

            self.nodes[label].connections[level] = neighbors.clone();
            for &neighbor in &neighbors {
                if self.nodes[neighbor].deleted {
                    continue;
                }
                if self.nodes[neighbor].connections.len() <= level {
                    self.nodes[neighbor].connections.resize(level + 1, Vec::new());
                }
                if !self.nodes[neighbor].connections[level].contains(&label) {
                    self.nodes[neighbor].connections[level].push(label);
                    self.prune(neighbor, level, m_max);
                }
            }
            self.prune(label, level, m);

            if let Some(&(_, next_entry)) = candidates.get(m) {
                entry = next_entry;
            }
        }

        if node_level > top_level {
            self.current_max_level = Some(node_level);
            self.entry_point = label;
        }
    }

    /// Lazy deletion: flip the flag and queue the vector for the
    /// snapshot sidecar. Returns false when the key has no live node.
    pub fn mark_deleted(&mut self, key: Key) -> bool {
        let Some(&label) = self.key_to_label.get(&key) else {
            return false;
        };
        if self.nodes[label].deleted {
            return false;
        }
        self.nodes[label].deleted = true;
        let vector = self.nodes[label].vector.clone();
        self.record_deleted_vector(vector);
        debug!(key, label, "hnsw mark deleted");
        true
    }

    /// Approximate top-k by ascending cosine distance. Deleted nodes
    /// and nodes whose vector matches a persisted deleted vector are
    /// filtered out.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, Key)> {
        let Some(top_level) = self.current_max_level else {
            return Vec::new();
        };
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }

        let mut entry = self.entry_point;
        for level in (1..=top_level).rev() {
            if let Some(&(_, closest)) = self.search_layer(entry, query, level, 1).first() {
                entry = closest;
            }
        }

        // Widen the base-layer beam so filtering still leaves k hits.
        let ef = self.config.ef_construction.max(k * 10);
        let candidates = self.search_layer(entry, query, 0, ef);

        let mut results = Vec::with_capacity(k);
        for (dist, label) in candidates {
            if results.len() >= k {
                break;
            }
            let node = &self.nodes[label];
            if node.deleted {
                continue;
            }
            if self.matches_persisted_deleted(&node.vector) {
                continue;
            }
            results.push((dist, node.key));
        }
        results
    }

    /// Greedy search restricted to one level. Returns candidates in
    /// ascending distance order, at most `ef` of them.
    ///
    /// The entry point is validated first: a deleted entry, or one
    /// that does not reach `level`, falls back to label 0 and then to
    /// a scan for any live node at that level.
    fn search_layer(
        &self,
        entry: usize,
        query: &[f32],
        level: usize,
        ef: usize,
    ) -> Vec<(f32, usize)> {
        let Some(entry) = self.valid_entry(entry, level) else {
            return Vec::new();
        };

        let mut candidates: BinaryHeap<Reverse<DistLabel>> = BinaryHeap::new();
        let mut results: BinaryHeap<DistLabel> = BinaryHeap::new();
        let mut visited: HashSet<usize> = HashSet::new();

        let entry_dist = cosine_distance(query, &self.nodes[entry].vector);
        candidates.push(Reverse(DistLabel { dist: entry_dist, label: entry }));
        results.push(DistLabel { dist: entry_dist, label: entry });
        visited.insert(entry);

        while let Some(Reverse(current)) = candidates.pop() {
            let furthest = results.peek().map(|r| r.dist).unwrap_or(f32::MAX);
            if current.dist > furthest && results.len() >= ef {
                break;
            }

            let node = &self.nodes[current.label];
            if node.connections.len() <= level {
                continue;
            }
            for &neighbor in &node.connections[level] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(neighbor_node) = self.nodes.get(neighbor) else {
                    continue;
                };
                if neighbor_node.deleted {
                    continue;
                }
                let dist = cosine_distance(query, &neighbor_node.vector);
                let furthest = results.peek().map(|r| r.dist).unwrap_or(f32::MAX);
                if results.len() < ef || dist < furthest {
                    candidates.push(Reverse(DistLabel { dist, label: neighbor }));
                    results.push(DistLabel { dist, label: neighbor });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(f32, usize)> =
            results.into_iter().map(|r| (r.dist, r.label)).collect();
        out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        out
    }

    /// Resolve a usable entry point for `level`, or `None` when no
    /// live node reaches it.
    fn valid_entry(&self, entry: usize, level: usize) -> Option<usize> {
        let usable = |label: usize| {
            self.nodes
                .get(label)
                .map(|n| !n.deleted && n.max_level >= level)
                .unwrap_or(false)
        };
        if usable(entry) {
            return Some(entry);
        }
        if usable(0) {
            return Some(0);
        }
        (0..self.nodes.len()).find(|&label| usable(label))
    }

    /// Keep only the `max_connections` closest neighbors of `label` at
    /// `level`, measured from that node's own vector. Deleted
    /// neighbors are dropped in the process.
    fn prune(&mut self, label: usize, level: usize, max_connections: usize) {
        if self.nodes[label].connections.len() <= level
            || self.nodes[label].connections[level].len() <= max_connections
        {
            return;
        }

        let anchor = self.nodes[label].vector.clone();
        let mut ranked: Vec<(f32, usize)> = self.nodes[label].connections[level]
            .iter()
            .filter(|&&n| self.nodes.get(n).map(|node| !node.deleted).unwrap_or(false))
            .map(|&n| (cosine_distance(&anchor, &self.nodes[n].vector), n))
            .collect();
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        ranked.truncate(max_connections);

        self.nodes[label].connections[level] = ranked.into_iter().map(|(_, n)| n).collect();
    }
}

/// Randomized level: `floor(-ln(U) * m_L)` for `U` in `(0, 1]`, capped
/// at a safe bound.
fn sample_level(m_l: f64) -> usize {
    let mut rng = rand::thread_rng();
    let u: f64 = 1.0 - rng.gen::<f64>();
    let level = (-u.ln() * m_l).floor() as usize;
    level.min(MAX_SAMPLED_LEVEL)
}

/// Heap entry ordered by distance; ties resolved as equal.
#[derive(PartialEq)]
struct DistLabel {
    dist: f32,
    label: usize,
}

impl Eq for DistLabel {}

impl PartialOrd for DistLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.partial_cmp(&other.dist).unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> HnswIndex {
        HnswIndex::new(HnswConfig { dimension: 4, ..Default::default() })
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 4];
        v[i % 4] = 1.0;
        v
    }

    #[test]
    fn test_empty_search() {
        let idx = index();
        assert!(idx.search(&[1.0, 0.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_single_insert_and_search() {
        let mut idx = index();
        idx.insert(1, axis(0));
        let hits = idx.search(&axis(0), 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 1);
        assert!(hits[0].0.abs() < 1e-6);
    }

    #[test]
    fn test_nearest_of_several() {
        let mut idx = index();
        idx.insert(10, vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(20, vec![0.0, 1.0, 0.0, 0.0]);
        idx.insert(30, vec![0.0, 0.0, 1.0, 0.0]);
        idx.insert(40, vec![0.9, 0.1, 0.0, 0.0]);

        let hits = idx.search(&[1.0, 0.05, 0.0, 0.0], 2);
        assert_eq!(hits[0].1, 10);
        assert_eq!(hits[1].1, 40);
    }

    #[test]
    fn test_reinsert_reuses_label() {
        let mut idx = index();
        idx.insert(7, vec![1.0, 0.0, 0.0, 0.0]);
        let label = idx.label_of(7).unwrap();
        idx.insert(7, vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(idx.label_of(7).unwrap(), label);

        let hits = idx.search(&[0.0, 1.0, 0.0, 0.0], 1);
        assert_eq!(hits[0].1, 7);
        assert!(hits[0].0.abs() < 1e-6);
    }

    #[test]
    fn test_mark_deleted_filters_results() {
        let mut idx = index();
        for i in 0..8u64 {
            idx.insert(i, axis(i as usize));
        }
        assert!(idx.mark_deleted(3));
        assert!(!idx.mark_deleted(3));
        assert_eq!(idx.pending_deleted().len(), 1);

        let hits = idx.search(&axis(3), 8);
        assert!(hits.iter().all(|&(_, key)| key != 3));
    }

    #[test]
    fn test_degree_invariant() {
        let mut idx = index();
        let mut state = 0x12345678u64;
        for key in 0..200u64 {
            // xorshift keeps the vectors deterministic.
            let mut v = Vec::with_capacity(4);
            for _ in 0..4 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                v.push((state % 1000) as f32 / 1000.0 - 0.5);
            }
            idx.insert(key, v);
        }
        for key in (0..200u64).step_by(3) {
            idx.mark_deleted(key);
        }
        for node in &idx.nodes {
            for level_list in &node.connections {
                assert!(
                    level_list.len() <= idx.config.m_max,
                    "degree {} exceeds M_max {}",
                    level_list.len(),
                    idx.config.m_max
                );
            }
        }
    }

    #[test]
    fn test_entry_point_survives_deletion() {
        let mut idx = index();
        for i in 0..16u64 {
            idx.insert(i, axis(i as usize));
        }
        // Deleting the entry point must not break searches.
        let entry_key = idx.nodes[idx.entry_point].key;
        idx.mark_deleted(entry_key);
        let hits = idx.search(&axis(1), 4);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|&(_, key)| key != entry_key));
    }

    #[test]
    fn test_record_deleted_vector_dedup() {
        let mut idx = index();
        idx.record_deleted_vector(vec![1.0, 0.0, 0.0, 0.0]);
        idx.record_deleted_vector(vec![1.01, 0.0, 0.0, 0.0]);
        assert_eq!(idx.pending_deleted().len(), 1);
        idx.record_deleted_vector(vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(idx.pending_deleted().len(), 2);
    }
}
