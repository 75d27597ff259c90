//! Cluster-wide security-identity allocator.
//!
//! Maps opaque, structured identity keys to small, dense, numeric identity
//! IDs that are cheap to carry in data-plane packets and lookup tables.
//! Allocations are consistent across every node in the cluster: two nodes
//! that independently request the same key observe the same ID, two
//! different keys never collide, and released IDs are reclaimed by a
//! garbage-collection pass once no node references them anymore.
//!
//! # Key Components
//!
//! - [`Allocator`] - the allocation state machine (allocate, release, GC)
//! - [`KvBackend`] - narrow async interface to a strongly-consistent KV
//!   store with compare-and-swap, leases, and prefix watches
//! - [`LocalKeys`] - per-process reference-count table
//! - [`IdPool`] - set of locally unused IDs in the configured range
//! - [`RemoteCache`] - watch-driven mirror of the global ID table
//!
//! The production KV driver (etcd, consul, ...) is supplied by the caller
//! as an implementation of [`KvBackend`]; [`MemoryBackend`] provides a
//! deterministic in-memory implementation for tests and simulation.
//!
//! # Example
//!
//! ```ignore
//! use clusterid::{Allocator, AllocatorConfig, MemoryBackend};
//!
//! let backend = MemoryBackend::new();
//! let allocator = Allocator::<String, _>::new(backend, AllocatorConfig {
//!     max: 65_535,
//!     prefix: "cluster/identities".into(),
//!     suffix: "node-1".into(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! let (id, is_new) = allocator.allocate(&"app=web;env=prod".to_string()).await?;
//! ```

pub mod allocator;
pub mod backend;
pub mod cache;
pub mod constants;
pub mod error;
pub mod key;
pub mod local_keys;
pub mod pool;

pub use allocator::Allocator;
pub use allocator::AllocatorConfig;
pub use allocator::AllocatorEvent;
pub use allocator::AllocatorEventKind;
pub use backend::KvBackend;
pub use backend::KvLock;
pub use backend::KvPair;
pub use backend::LeaseId;
pub use backend::WatchEvent;
pub use backend::WatchEventKind;
pub use backend::WatchStream;
pub use backend::memory::MemoryBackend;
pub use cache::RemoteCache;
pub use error::AllocatorError;
pub use error::KvError;
pub use key::IdentityId;
pub use key::IdentityKey;
pub use local_keys::LocalKeys;
pub use pool::IdPool;
