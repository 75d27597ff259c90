//! Resource limits and retry tuning.
//!
//! All operational bounds live here so they are easy to audit. Callers can
//! override the per-allocator values through [`crate::AllocatorConfig`];
//! the channel capacities and retry caps are fixed.

use std::time::Duration;

/// Initial backoff between retries of a transient backend failure.
pub const RETRY_INITIAL_BACKOFF_MS: u64 = 10;

/// Upper bound on the exponential retry backoff.
pub const RETRY_MAX_BACKOFF_MS: u64 = 1_000;

/// Maximum internal retries for an idempotent backend read before the error
/// is surfaced to the caller.
pub const MAX_READ_RETRIES: u32 = 8;

/// Default bound on candidate-claim attempts during one allocation.
pub const DEFAULT_MAX_ALLOCATE_ATTEMPTS: u32 = 128;

/// Default interval between garbage-collection passes.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Default TTL of the node lease attached to slave markers.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// Default time to wait for the initial watch bootstrap listing.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the per-key distributed lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered events per watch subscription beyond the bootstrap replay.
pub const WATCH_CHANNEL_CAPACITY: usize = 1_024;

/// Buffered allocator events per subscriber.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Largest permitted ID range (`max - min + 1`). The free-ID pool is kept
/// in memory, so the range must stay bounded.
pub const MAX_ID_SPACE: u64 = 1 << 20;
