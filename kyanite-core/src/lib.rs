//! # Kyanite Core
//!
//! Fundamental building blocks shared by every Kyanite crate:
//! - Record types and deletion sentinels
//! - Error types
//! - Configuration
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  kyanite-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • types      - Keys, entries, sentinels        │
//! │  • error      - Error handling                  │
//! │  • config     - Storage and index parameters    │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{Config, HnswConfig, StorageConfig};
pub use error::{Error, Result};
pub use types::{Entry, Key, SENTINEL_KEY, TOMBSTONE};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
