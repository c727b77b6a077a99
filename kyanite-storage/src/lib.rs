//! # Kyanite Storage Engine
//!
//! LSM-tree storage for durable byte-string values plus the append-only
//! embedding log.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  Incoming Write ──> Memtable (skip list)                    │
//! │                          │                                  │
//! │                          ▼  budget exceeded                 │
//! │                  Flush to sorted run ──> level-0/<ts>.run   │
//! │                          │                                  │
//! │                          ▼                                  │
//! │                  Leveled compaction (level 1, 2, ...)       │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  Query ──> Check Memtable ──> Check runs (newest first)     │
//! │              │                    │                         │
//! │              ▼                    ▼                         │
//! │           Hot Data            Bloom Filters                 │
//! │           (Fast)              (Skip files)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod embedding_log;
pub mod engine;
pub mod memtable;
pub mod run;

mod compaction;

pub use embedding_log::{EmbeddingStore, EMBEDDINGS_FILE};
pub use engine::LsmEngine;
pub use memtable::Memtable;
pub use run::{RunMeta, RunWriter, SortedRun};
