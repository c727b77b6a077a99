//! # Configuration Management
//!
//! Handles all configuration for Kyanite components.

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub index: HnswConfig,
}

/// LSM storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Encoded size budget for one sorted run, header and bloom included
    pub run_budget: u32,
    /// Max files at level 0 before compaction triggers
    pub level0_limit: usize,
    /// Bloom filter size per run, in bytes
    pub bloom_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            run_budget: 2 * 1024 * 1024,
            level0_limit: 4,
            bloom_bytes: 10240,
        }
    }
}

impl StorageConfig {
    /// Max files a level may hold before compaction triggers.
    /// Level 0 is bounded by `level0_limit`; level L holds 2^(L+1).
    pub fn level_capacity(&self, level: usize) -> usize {
        if level == 0 {
            self.level0_limit
        } else {
            1 << (level + 1)
        }
    }
}

/// HNSW graph parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Target out-degree per node per level
    pub m: usize,
    /// Hard degree cap per node per level
    pub m_max: usize,
    /// Candidate list width during insertion
    pub ef_construction: usize,
    /// Expected embedding dimension; fixed by the first real vector
    pub dimension: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 10,
            m_max: 20,
            ef_construction: 100,
            dimension: 768,
        }
    }
}

impl HnswConfig {
    /// Level sampler scale: `1 / ln(M)`.
    pub fn m_l(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}
