//! # Error Handling
//!
//! Error types shared by every Kyanite crate.
//!
//! ## Design Principles
//!
//! 1. **Actionable**: Every error should guide the user toward resolution
//! 2. **Contextual**: Errors include relevant context (file paths, values)
//! 3. **Recoverable**: Distinguish between fatal and recoverable errors

use thiserror::Error;

/// Result type alias for Kyanite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Kyanite
#[derive(Error, Debug)]
pub enum Error {
    // Storage Errors
    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("Corrupt file {path}: {message}")]
    Corruption { path: String, message: String },

    #[error("Sorted run error: {message}")]
    Run { message: String },

    #[error("Memtable error: {message}")]
    Memtable { message: String },

    #[error("Compaction failed: {reason}")]
    Compaction { reason: String },

    // Embedding / Index Errors
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Node label {label} exceeds the u32 snapshot width")]
    LabelOverflow { label: usize },

    #[error("Vector index error: {message}")]
    VectorIndex { message: String },

    // Concurrency Errors
    #[error("Enqueue on stopped worker pool")]
    PoolStopped,
}

impl Error {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io { .. } => false,
            Error::Corruption { .. } => false,
            Error::LabelOverflow { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Io { .. } => "IO_ERROR",
            Error::Corruption { .. } => "CORRUPTION",
            Error::Run { .. } => "RUN_ERROR",
            Error::Memtable { .. } => "MEMTABLE_ERROR",
            Error::Compaction { .. } => "COMPACTION_ERROR",
            Error::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Error::LabelOverflow { .. } => "LABEL_OVERFLOW",
            Error::VectorIndex { .. } => "VECTOR_INDEX_ERROR",
            Error::PoolStopped => "POOL_STOPPED",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            Error::Io { message, source } => Error::Io {
                message: format!("{}: {}", f(), message),
                source,
            },
            other => other,
        })
    }
}
