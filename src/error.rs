//! Error types surfaced across the collector's seams.
//!
//! Stale summaries and blocks invalidated mid-pass are not errors; the
//! relocators skip those blocks and move on. Only conditions the host has
//! to know about are represented here.

/// Errors returned by host callbacks and collector entry points.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// Allocation failed.
    #[error("out of memory")]
    NoMemory,
    /// A page read or write failed.
    #[error("page i/o error: {0}")]
    Io(String),
    /// The checkpoint writer failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
    /// The filesystem is shutting down or remounted read-only.
    #[error("filesystem is not active")]
    Inactive,
}

/// Shorthand result for host callbacks.
pub type GcResult<T> = Result<T, GcError>;
