//! # Distance Kernels
//!
//! Cosine similarity and the derived ranking distance used by both the
//! exact baseline and the HNSW graph.

/// Tolerance for matching a live vector against the deleted-vector
/// lists during updates. Lenient: vectors written and reread through
/// float I/O must still match.
pub const EPSILON_UPDATE: f32 = 1e-1;

/// Tolerance for filtering search results against persisted deleted
/// vectors. Strict.
pub const EPSILON_SEARCH: f32 = 1e-3;

/// Cosine similarity with f64 accumulation, clamped to `[-1, 1]`.
/// Returns 0 when the shapes differ or either norm is below `1e-10`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }

    if norm_a < 1e-10 || norm_b < 1e-10 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    similarity.clamp(-1.0, 1.0) as f32
}

/// Ranking distance: `1 - cosine_similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Per-component comparison within `epsilon`. Shape mismatch is never
/// a match.
pub fn vectors_close(a: &[f32], b: &[f32], epsilon: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(&x, &y)| (x - y).abs() <= epsilon)
}
