//! Errors that escape the entry set.
//!
//! Everything else (lost compare-and-swaps, stale observations, half-done
//! protocols found in a slot) is resolved internally by re-deriving state
//! from fresh reads and retrying.

/// The two conditions the entry set reports to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A caller passed a probe start index outside the table. A programming
    /// error, never a retryable condition.
    #[error("hash index {index} out of bounds for capacity {capacity}")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// The table capacity.
        capacity: usize,
    },

    /// The collision chain would have to grow past the table capacity.
    /// Unrecoverable for this table instance; the owner must replace the
    /// table.
    #[error("collision chain ({chain}) cannot grow past the table capacity ({capacity})")]
    CollisionOverflow {
        /// The chain bound at the time of the failure.
        chain: usize,
        /// The table capacity.
        capacity: usize,
    },
}
