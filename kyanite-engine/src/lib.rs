//! # Kyanite Engine
//!
//! The hybrid store: an LSM tree for durable byte-string values bound
//! to an embedding log and an HNSW proximity graph for approximate
//! nearest-neighbor search.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HybridStore                            │
//! │                                                             │
//! │   put/get/del/scan ────────> LsmEngine (kyanite-storage)    │
//! │   put/del ─────────────────> EmbeddingStore (append log)    │
//! │   put/del/knn_hnsw ────────> HnswIndex (kyanite-index)      │
//! │   save/load_snapshot ──────> snapshot (worker pool fan-out) │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod embedder;
pub mod store;

pub use embedder::{Embedder, HashEmbedder};
pub use store::HybridStore;
