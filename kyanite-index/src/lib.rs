//! # Kyanite Index
//!
//! In-memory HNSW proximity graph with on-disk snapshots.
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  kyanite-index                  │
//! ├─────────────────────────────────────────────────┤
//! │  • hnsw       - Layered proximity graph         │
//! │  • distance   - Cosine kernels and tolerances   │
//! │  • snapshot   - Node-per-directory persistence  │
//! │  • pool       - Worker pool for snapshot saves  │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod distance;
pub mod hnsw;
pub mod pool;
pub mod snapshot;

pub use distance::{cosine_distance, cosine_similarity, EPSILON_SEARCH, EPSILON_UPDATE};
pub use hnsw::{HnswIndex, HnswNode};
pub use pool::WorkerPool;
