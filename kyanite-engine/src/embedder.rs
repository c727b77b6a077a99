//! # Embedding Trait
//!
//! Seam for the external embedding model: a pure function from text to
//! a fixed-dimension vector. The store treats an empty vector as a
//! model failure and falls back accordingly, so implementations should
//! never panic.
//!
//! The first successful call fixes the store's dimension, so a model
//! must be deterministic about its output width.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maps text to an embedding vector. Returns an empty vector on
/// failure.
pub trait Embedder: Send {
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Advertised vector dimension.
    fn dimension(&self) -> usize;
}

/// Deterministic hashing embedder: every component is derived from a
/// hash of the text and the component index. No semantic meaning, but
/// stable across processes, which is what tests and benchmarks need.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        (0..self.dimension)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                i.hash(&mut hasher);
                (hasher.finish() % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(16);
        let a = embedder.embed("the quick brown fox");
        let b = embedder.embed("the quick brown fox");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_distinct_texts_differ() {
        let embedder = HashEmbedder::new(16);
        assert_ne!(embedder.embed("alpha"), embedder.embed("beta"));
    }
}
