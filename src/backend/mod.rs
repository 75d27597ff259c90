//! Backend interface consumed by the allocator.
//!
//! The allocator is written against [`KvBackend`], a narrow view of a
//! strongly-consistent key-value store: atomic create-only writes,
//! compare-and-swap on revision, prefix listings, prefix watches with a
//! bootstrap sentinel, lease-bound keys, and a lease-based distributed
//! lock. Production drivers (etcd, consul) adapt their client to this
//! trait; [`memory::MemoryBackend`] implements it in memory for tests.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::KvError;

/// Handle of a backend lease.
///
/// Keys written with a lease are deleted by the backend when the lease is
/// revoked or its owner dies. The backend renews granted leases
/// automatically until [`KvBackend::revoke_lease`] is called.
pub type LeaseId = u64;

/// A key-value pair with its modification revision.
///
/// The revision increases on every change to the key and feeds
/// compare-and-swap/compare-and-delete for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// Full store path of the entry.
    pub key: String,
    /// Stored value.
    pub value: String,
    /// Revision of the most recent modification.
    pub mod_revision: u64,
}

/// Kind of a watch stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventKind {
    /// A key appeared (also used for the bootstrap replay of existing keys).
    Create,
    /// An existing key changed value.
    Modify,
    /// A key disappeared.
    Delete,
    /// The initial listing is complete; subsequent events are live.
    BootstrapDone,
}

/// One event on a prefix watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Event kind.
    pub kind: WatchEventKind,
    /// Affected key (empty for [`WatchEventKind::BootstrapDone`]).
    pub key: String,
    /// New value for create/modify, last value for delete.
    pub value: Option<String>,
}

/// Receiving side of a prefix watch.
///
/// The stream first replays every existing entry under the prefix as
/// [`WatchEventKind::Create`] events, then emits one
/// [`WatchEventKind::BootstrapDone`] sentinel, then live events. Within one
/// key, event order matches the backend's commit order. The stream ends
/// (returns `None`) when the watch connection is lost; the consumer is
/// expected to re-establish it.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// A held distributed lock.
///
/// Locks are lease-bound on the backend side, so a crashed holder cannot
/// block other nodes forever. Release explicitly with [`KvLock::unlock`];
/// dropping the guard without unlocking leaves release to lease expiry.
#[async_trait]
pub trait KvLock: Send {
    /// Release the lock.
    async fn unlock(self: Box<Self>) -> Result<(), KvError>;
}

/// Narrow interface to a strongly-consistent key-value store.
///
/// All methods must be safe to call concurrently. Mutating operations must
/// be atomic; `create_only` in particular must never overwrite an existing
/// key, because global ID uniqueness rests on it.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Read a single key. `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError>;

    /// List every entry whose key starts with `prefix`, in key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, KvError>;

    /// Atomically create `key` iff it does not exist.
    ///
    /// Returns `true` when this call created the key, `false` when the key
    /// already existed. With a lease, the key is deleted when the lease
    /// goes away.
    async fn create_only(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, KvError>;

    /// Atomically replace the value iff the key's modification revision
    /// still equals `expected_revision`. Returns `true` on swap.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        new_value: &str,
    ) -> Result<bool, KvError>;

    /// Atomically delete the key iff its modification revision still
    /// equals `expected_revision`. Returns `true` on delete.
    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool, KvError>;

    /// Delete a key. Returns [`KvError::NotFound`] if it does not exist.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Open a watch on `prefix`. See [`WatchStream`] for stream semantics.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, KvError>;

    /// Acquire the distributed lock stored at `key`, waiting until it is
    /// available.
    async fn lock(&self, key: &str) -> Result<Box<dyn KvLock>, KvError>;

    /// Grant a lease with the given TTL, auto-renewed until revoked.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError>;

    /// Revoke a lease, deleting every key attached to it. Revoking an
    /// unknown lease is a no-op.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError>;
}
