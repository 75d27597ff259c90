//! Error types for allocator and backend operations.
//!
//! Explicit error enums with actionable context. [`KvError`] is the
//! boundary error of the [`crate::KvBackend`] trait; [`AllocatorError`]
//! is what the allocator surfaces to its callers, wrapping backend
//! failures as [`AllocatorError::Storage`].

use snafu::Snafu;

/// Errors surfaced by a [`crate::KvBackend`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum KvError {
    /// The key does not exist.
    #[snafu(display("key '{key}' not found"))]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// Create-only write hit an existing key.
    #[snafu(display("key '{key}' already exists"))]
    AlreadyExists {
        /// The conflicting key.
        key: String,
    },

    /// Compare-and-swap or compare-and-delete lost a race.
    #[snafu(display("compare-and-swap failed for key '{key}'"))]
    CasFailed {
        /// The contended key.
        key: String,
    },

    /// Transient failure (timeout, leader change); safe to retry.
    #[snafu(display("transient backend failure: {reason}"))]
    Transient {
        /// Description of the failure.
        reason: String,
    },

    /// Permanent failure; retrying will not help.
    #[snafu(display("fatal backend failure: {reason}"))]
    Fatal {
        /// Description of the failure.
        reason: String,
    },

    /// Operation exceeded its deadline.
    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Elapsed time in milliseconds.
        duration_ms: u64,
    },

    /// The lease backing a write no longer exists.
    #[snafu(display("lease {lease_id} expired or was revoked"))]
    LeaseExpired {
        /// The dead lease.
        lease_id: u64,
    },

    /// Lock acquisition failed or timed out.
    #[snafu(display("lock on '{key}' unavailable"))]
    LockUnavailable {
        /// The lock key.
        key: String,
    },
}

impl KvError {
    /// True for failures worth an internal retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Transient { .. } | KvError::Timeout { .. })
    }
}

/// Errors surfaced by [`crate::Allocator`] operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AllocatorError {
    /// Rejected configuration (degenerate range, missing prefix/suffix).
    #[snafu(display("invalid allocator configuration: {reason}"))]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// Every ID in `[min, max]` is believed to be in use.
    #[snafu(display("identity pool exhausted"))]
    PoolExhausted,

    /// Gave up claiming a candidate ID after repeated CAS conflicts.
    #[snafu(display("allocation failed after {attempts} attempts"))]
    AllocationContention {
        /// Number of candidate claims attempted.
        attempts: u32,
    },

    /// A key is already held locally under a different ID. This is a
    /// programming error in the caller or a corrupted store.
    #[snafu(display("key '{key}' already bound to ID {existing}, requested {requested}"))]
    KeyMismatch {
        /// Canonical key representation.
        key: String,
        /// ID currently recorded locally.
        existing: u64,
        /// ID the caller tried to bind.
        requested: u64,
    },

    /// Release of a key this process never allocated.
    #[snafu(display("key '{key}' is not held by this process"))]
    NotLocallyHeld {
        /// Canonical key representation.
        key: String,
    },

    /// The initial watch listing did not complete in time.
    #[snafu(display("cache bootstrap did not complete within {duration_ms}ms"))]
    BootstrapTimeout {
        /// Configured bootstrap timeout in milliseconds.
        duration_ms: u64,
    },

    /// A store entry under the allocator prefix could not be interpreted.
    #[snafu(display("corrupt entry at '{path}': {reason}"))]
    CorruptEntry {
        /// Store path of the bad entry.
        path: String,
        /// Why it could not be interpreted.
        reason: String,
    },

    /// Backend failure during an allocator operation.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying backend error.
        source: KvError,
    },
}
