//! Error types.

/// Errors returned by [`AtomicHashArray::create`](crate::AtomicHashArray::create).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArrayError {
    /// `max_load_factor` must lie in `(0, 1]`.
    #[error("max load factor must be in (0, 1], got {0}")]
    InvalidLoadFactor(f32),
    /// Neither `max_size` nor an explicit capacity asked for any cell.
    #[error("hash array capacity must be non-zero")]
    ZeroCapacity,
}

/// Errors returned by [`ConcurrentHashMap`](crate::ConcurrentHashMap) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Growing the segment would take it past its share of `max_size`.
    #[error("segment cannot grow past its maximum size of {max_size} entries")]
    CapacityExceeded {
        /// Per-segment limit that was hit.
        max_size: usize,
    },
    /// `at()` found no entry for the key.
    #[error("key not found")]
    NotFound,
}
