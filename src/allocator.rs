//! Cluster-wide identity allocation state machine.
//!
//! Converts identity keys into stable, cluster-unique numeric IDs on top
//! of a strongly-consistent KV store. The store layout per key is:
//!
//! ```text
//! <prefix>/id/<ID>                          = canonical(K)   (no lease)
//! <prefix>/value/<canonical(K)>/<suffix>    = <ID>           (node lease)
//! <prefix>/locks/<blake3-hex(canonical(K))> = lock token     (lock lease)
//! ```
//!
//! The master entry under `id/` is the authoritative ID-to-key binding;
//! it is created exactly once with an atomic create-only write and
//! carries no lease, so it survives node crashes. Each node holding a
//! live reference additionally keeps a lease-bound slave marker under
//! `value/`; when the node dies its markers expire, and a later GC pass
//! removes master entries that have no markers left.
//!
//! All multi-step sequences for one key serialize on a per-key
//! distributed lock across the cluster. Operations outside the critical
//! section are idempotent.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use snafu::ensure;
use snafu::ResultExt;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::KvBackend;
use crate::backend::KvLock;
use crate::backend::KvPair;
use crate::backend::LeaseId;
use crate::cache::RemoteCache;
use crate::constants::DEFAULT_BOOTSTRAP_TIMEOUT;
use crate::constants::DEFAULT_GC_INTERVAL;
use crate::constants::DEFAULT_LEASE_TTL;
use crate::constants::DEFAULT_LOCK_TIMEOUT;
use crate::constants::DEFAULT_MAX_ALLOCATE_ATTEMPTS;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::constants::MAX_ID_SPACE;
use crate::constants::MAX_READ_RETRIES;
use crate::constants::RETRY_INITIAL_BACKOFF_MS;
use crate::constants::RETRY_MAX_BACKOFF_MS;
use crate::error::AllocationContentionSnafu;
use crate::error::AllocatorError;
use crate::error::CorruptEntrySnafu;
use crate::error::InvalidConfigSnafu;
use crate::error::KvError;
use crate::error::PoolExhaustedSnafu;
use crate::error::StorageSnafu;
use crate::key::IdentityId;
use crate::key::IdentityKey;
use crate::local_keys::LocalKeys;
use crate::pool::IdPool;

/// Configuration for an [`Allocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Smallest allocatable ID (inclusive). Must be at least 1.
    pub min: u64,
    /// Largest allocatable ID (inclusive). Required.
    pub max: u64,
    /// KV namespace root, without a trailing slash.
    pub prefix: String,
    /// Unique per-node token used in slave-marker paths.
    pub suffix: String,
    /// Interval between garbage-collection passes.
    pub gc_interval: Duration,
    /// When false, every allocation takes the full global path. The
    /// reference-count table is still maintained so releases balance.
    pub use_local_cache: bool,
    /// Bound on candidate-claim attempts during one allocation.
    pub max_allocate_attempts: u32,
    /// TTL of the node lease attached to slave markers.
    pub lease_ttl: Duration,
    /// Time to wait for the initial watch listing at construction.
    pub bootstrap_timeout: Duration,
    /// Time to wait for the per-key distributed lock.
    pub lock_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 0, // required; the default is rejected at construction
            prefix: String::new(),
            suffix: String::new(),
            gc_interval: DEFAULT_GC_INTERVAL,
            use_local_cache: true,
            max_allocate_attempts: DEFAULT_MAX_ALLOCATE_ATTEMPTS,
            lease_ttl: DEFAULT_LEASE_TTL,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl AllocatorConfig {
    fn validate(&self) -> Result<(), AllocatorError> {
        ensure!(self.min >= 1, InvalidConfigSnafu { reason: "min must be at least 1" });
        ensure!(
            self.max >= self.min,
            InvalidConfigSnafu {
                reason: format!("min {} exceeds max {}", self.min, self.max),
            }
        );
        ensure!(
            self.max - self.min + 1 <= MAX_ID_SPACE,
            InvalidConfigSnafu {
                reason: format!("ID range larger than {MAX_ID_SPACE}"),
            }
        );
        ensure!(
            !self.prefix.is_empty() && !self.prefix.ends_with('/'),
            InvalidConfigSnafu {
                reason: "prefix must be non-empty without a trailing slash",
            }
        );
        ensure!(
            !self.suffix.is_empty() && !self.suffix.contains('/'),
            InvalidConfigSnafu {
                reason: "suffix must be non-empty and must not contain '/'",
            }
        );
        Ok(())
    }
}

/// Kind of a published allocator event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorEventKind {
    /// A new global ID-to-key binding appeared.
    Created,
    /// An existing ID was re-bound to a different key.
    Modified,
    /// A binding was removed (GC or administrative delete).
    Deleted,
}

/// Change to the global ID table, observed through the watch.
#[derive(Debug, Clone)]
pub struct AllocatorEvent<K> {
    /// What happened.
    pub kind: AllocatorEventKind,
    /// Affected ID.
    pub id: IdentityId,
    /// Bound key; `None` for deletions of entries never seen intact.
    pub key: Option<K>,
}

/// Cluster-wide identity allocator.
///
/// Thread-safe: any number of tasks may call [`Allocator::allocate`] and
/// [`Allocator::release`] concurrently. The watch loop and the GC ticker
/// run as background tasks owned by this instance and stop on
/// [`Allocator::shutdown`] or drop.
pub struct Allocator<K: IdentityKey, B: KvBackend + ?Sized> {
    backend: Arc<B>,
    config: AllocatorConfig,
    /// `<prefix>/id`
    id_prefix: String,
    /// `<prefix>/value`
    value_prefix: String,
    /// `<prefix>/locks`
    lock_prefix: String,
    local: LocalKeys<K>,
    pool: Arc<IdPool>,
    cache: Arc<RemoteCache<K>>,
    lease: LeaseId,
    events: broadcast::Sender<AllocatorEvent<K>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: IdentityKey, B: KvBackend + ?Sized + 'static> Allocator<K, B> {
    /// Create an allocator and wait for its cache to bootstrap.
    ///
    /// Grants the node lease, starts the watch and GC tasks, and blocks
    /// until the initial listing of the global ID table has been applied,
    /// so the first allocation decision sees the cluster state.
    ///
    /// # Errors
    ///
    /// [`AllocatorError::InvalidConfig`] for degenerate configurations,
    /// [`AllocatorError::BootstrapTimeout`] when the initial listing does
    /// not complete in time, [`AllocatorError::Storage`] when the lease
    /// cannot be granted.
    pub async fn new(backend: Arc<B>, config: AllocatorConfig) -> Result<Arc<Self>, AllocatorError> {
        config.validate()?;

        let lease = backend.grant_lease(config.lease_ttl).await.context(StorageSnafu)?;
        let pool = Arc::new(IdPool::new(config.min, config.max));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let id_prefix = format!("{}/id", config.prefix);
        let value_prefix = format!("{}/value", config.prefix);
        let lock_prefix = format!("{}/locks", config.prefix);
        let cache = Arc::new(RemoteCache::new(
            format!("{id_prefix}/"),
            pool.clone(),
            events.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watch_task = tokio::spawn(cache.clone().run(backend.clone(), shutdown_rx.clone()));

        let allocator = Arc::new(Self {
            backend,
            id_prefix,
            value_prefix,
            lock_prefix,
            local: LocalKeys::new(),
            pool,
            cache,
            lease,
            events,
            shutdown_tx,
            tasks: Mutex::new(vec![watch_task]),
            config,
        });

        let gc_task = tokio::spawn(gc_loop(
            Arc::downgrade(&allocator),
            allocator.config.gc_interval,
            shutdown_rx,
        ));
        allocator.push_task(gc_task);

        if let Err(error) = allocator.cache.wait_ready(allocator.config.bootstrap_timeout).await {
            allocator.shutdown().await;
            return Err(error);
        }

        info!(
            prefix = %allocator.config.prefix,
            min = allocator.config.min,
            max = allocator.config.max,
            suffix = %allocator.config.suffix,
            "identity allocator ready"
        );
        Ok(allocator)
    }

    /// Allocate an ID for `key`, reusing the cluster-wide binding when one
    /// exists.
    ///
    /// Returns the ID and whether this call created the global binding.
    /// `is_new = true` is observable only after the master entry has been
    /// durably created in the backend.
    pub async fn allocate(&self, key: &K) -> Result<(IdentityId, bool), AllocatorError> {
        let canonical = key.canonical();

        if self.config.use_local_cache {
            if let Some(id) = self.local.use_key(&canonical) {
                debug!(key = %canonical, %id, "allocation served from local cache");
                return Ok((id, false));
            }
        }

        let lock = self.acquire_lock(&canonical).await?;
        let result = self.allocate_locked(key, &canonical).await;
        self.unlock(lock, &canonical).await;
        result
    }

    /// Drop one local reference to `key`.
    ///
    /// When the last local reference goes away, the node's slave marker is
    /// removed from the store. The master entry stays; removing it is the
    /// garbage collector's job, so another node never observes a
    /// no-slaves/no-master torn state and re-creates the binding.
    pub async fn release(&self, key: &K) -> Result<(), AllocatorError> {
        let canonical = key.canonical();
        let (id, last) = self.local.release(&canonical)?;
        if !last {
            return Ok(());
        }

        let lock = self.acquire_lock(&canonical).await?;
        let result = self.delete_slave(&canonical).await;
        self.unlock(lock, &canonical).await;
        result?;

        debug!(key = %canonical, %id, "released last local reference");
        Ok(())
    }

    /// ID bound to `key`, consulting the cache first. Never allocates.
    pub async fn get(&self, key: &K) -> Result<Option<IdentityId>, AllocatorError> {
        let canonical = key.canonical();
        if let Some(id) = self.cache.get_by_key(&canonical) {
            return Ok(Some(id));
        }
        self.get_no_cache(key).await
    }

    /// ID bound to `key` by a direct store listing, bypassing the cache.
    pub async fn get_no_cache(&self, key: &K) -> Result<Option<IdentityId>, AllocatorError> {
        let canonical = key.canonical();
        let masters = self
            .list_with_retries(&format!("{}/", self.id_prefix))
            .await
            .context(StorageSnafu)?;
        for pair in masters {
            if pair.value == canonical {
                return Ok(crate::cache::id_from_master_path(
                    &format!("{}/", self.id_prefix),
                    &pair.key,
                ));
            }
        }
        Ok(None)
    }

    /// Key bound to `id` in the local view. Best-effort.
    pub fn get_by_id(&self, id: IdentityId) -> Option<K> {
        self.cache.get_by_id(id)
    }

    /// Subscribe to global ID table changes.
    pub fn subscribe(&self) -> broadcast::Receiver<AllocatorEvent<K>> {
        self.events.subscribe()
    }

    /// Run one garbage-collection pass over the mirrored master entries.
    ///
    /// For each entry with no remaining slave markers, the master is
    /// deleted under the per-key lock with a compare-and-delete on the
    /// observed revision; any concurrent change aborts the deletion.
    /// Returns the number of entries collected.
    pub async fn run_gc(&self) -> Result<usize, AllocatorError> {
        let mut collected = 0;
        for (id, key) in self.cache.snapshot() {
            let canonical = key.canonical();
            let lock = match self.acquire_lock(&canonical).await {
                Ok(lock) => lock,
                Err(error) => {
                    warn!(key = %canonical, %id, %error, "skipping gc, lock unavailable");
                    continue;
                }
            };
            let result = self.gc_master(id, &canonical).await;
            self.unlock(lock, &canonical).await;
            match result {
                Ok(true) => collected += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(key = %canonical, %id, %error, "gc pass failed for key");
                }
            }
        }
        Ok(collected)
    }

    /// Stop the watch and GC tasks, revoke the node lease (dropping every
    /// slave marker this node holds), and clear local state. Master
    /// entries are left untouched. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
        if let Err(error) = self.backend.revoke_lease(self.lease).await {
            warn!(%error, "failed to revoke node lease on shutdown");
        }
        self.local.clear();
        info!(prefix = %self.config.prefix, "identity allocator shut down");
    }

    /// Administrative: delete every master entry and slave marker under
    /// the allocator prefix. Intended for tests and cluster bootstrap.
    pub async fn delete_all_keys(&self) -> Result<(), AllocatorError> {
        for prefix in [format!("{}/", self.id_prefix), format!("{}/", self.value_prefix)] {
            let entries = self.backend.list_prefix(&prefix).await.context(StorageSnafu)?;
            for pair in entries {
                match self.backend.delete(&pair.key).await {
                    Ok(()) | Err(KvError::NotFound { .. }) => {}
                    Err(source) => return Err(AllocatorError::Storage { source }),
                }
            }
        }
        self.local.clear();
        Ok(())
    }

    /// Number of IDs this pool still believes to be free (diagnostics).
    pub fn available_ids(&self) -> usize {
        self.pool.available_len()
    }

    /// The node lease slave markers are attached to (diagnostics).
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Current local refcount for `key` (diagnostics).
    pub fn local_refcount(&self, key: &K) -> u64 {
        self.local.refcount(&key.canonical())
    }

    // -------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------

    /// Allocation critical section; runs under the per-key lock.
    async fn allocate_locked(
        &self,
        key: &K,
        canonical: &str,
    ) -> Result<(IdentityId, bool), AllocatorError> {
        // Inside the lock the cache is authoritative enough: no other
        // allocator can be acting on this key. A cold cache is confirmed
        // with a direct listing of the key's slave markers.
        let existing = match self.cache.get_by_key(canonical) {
            Some(id) => Some(id),
            None => self.lookup_slaves(canonical).await?,
        };
        if let Some(id) = existing {
            return self.adopt_existing(key, canonical, id).await;
        }

        let attempts = self.config.max_allocate_attempts;
        for attempt in 0..attempts {
            let Some(candidate) = self.pool.lease_available() else {
                return PoolExhaustedSnafu.fail();
            };

            // Re-verify against the mirror: the key may have surfaced
            // through the watch, and the candidate may have been claimed
            // remotely while the pool entry was stale.
            if let Some(id) = self.cache.get_by_key(canonical) {
                self.pool.release(candidate);
                return self.adopt_existing(key, canonical, id).await;
            }
            if self.cache.get_by_id(candidate).is_some() {
                self.pool.insert_reserved(candidate);
                continue;
            }

            match self
                .backend
                .create_only(&self.master_path(candidate), canonical, None)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %canonical, id = %candidate, attempt, "candidate lost create race");
                    self.pool.insert_reserved(candidate);
                    continue;
                }
                Err(source) => {
                    // Unknown whether the write landed; if it did, the
                    // watch re-reserves the candidate.
                    self.pool.release(candidate);
                    return Err(AllocatorError::Storage { source });
                }
            }

            // Master created. A failure past this point leaves a zombie
            // master with no slaves, which the GC removes.
            self.ensure_slave(canonical, candidate).await?;
            self.local.allocate(key, canonical, candidate)?;
            info!(key = %canonical, id = %candidate, "allocated new identity");
            return Ok((candidate, true));
        }

        AllocationContentionSnafu { attempts }.fail()
    }

    /// Branch for a key that already has a global ID: reference it locally
    /// and ensure our slave marker exists.
    async fn adopt_existing(
        &self,
        key: &K,
        canonical: &str,
        id: IdentityId,
    ) -> Result<(IdentityId, bool), AllocatorError> {
        self.local.allocate(key, canonical, id)?;
        if let Err(error) = self.ensure_slave(canonical, id).await {
            let _ = self.local.release(canonical);
            return Err(error);
        }
        debug!(key = %canonical, %id, "reusing existing global identity");
        Ok((id, false))
    }

    /// Create our slave marker under the node lease. A marker left by a
    /// prior incarnation of this node with the same binding counts as
    /// success.
    async fn ensure_slave(&self, canonical: &str, id: IdentityId) -> Result<(), AllocatorError> {
        let path = self.slave_path(canonical);
        let value = id.to_string();
        // Two attempts: a predecessor's marker can expire between the
        // create conflict and the re-read.
        for _ in 0..2 {
            let created = self
                .backend
                .create_only(&path, &value, Some(self.lease))
                .await
                .context(StorageSnafu)?;
            if created {
                return Ok(());
            }
            match self.backend.get(&path).await.context(StorageSnafu)? {
                Some(pair) if pair.value == value => return Ok(()),
                Some(pair) => {
                    return CorruptEntrySnafu {
                        path,
                        reason: format!("slave marker holds ID {}, expected {}", pair.value, value),
                    }
                    .fail();
                }
                None => continue,
            }
        }
        Err(AllocatorError::Storage {
            source: KvError::CasFailed { key: path },
        })
    }

    /// Resolve a key to its ID through its slave markers.
    async fn lookup_slaves(&self, canonical: &str) -> Result<Option<IdentityId>, AllocatorError> {
        let entries = self
            .list_with_retries(&self.slave_prefix(canonical))
            .await
            .context(StorageSnafu)?;
        let Some(first) = entries.first() else {
            return Ok(None);
        };
        match first.value.parse::<IdentityId>() {
            Ok(id) if id.value() > 0 => Ok(Some(id)),
            _ => CorruptEntrySnafu {
                path: first.key.clone(),
                reason: format!("slave marker value '{}' is not an ID", first.value),
            }
            .fail(),
        }
    }

    /// Remove this node's slave marker; a missing marker is fine (it may
    /// have expired with a previous lease).
    async fn delete_slave(&self, canonical: &str) -> Result<(), AllocatorError> {
        match self.backend.delete(&self.slave_path(canonical)).await {
            Ok(()) | Err(KvError::NotFound { .. }) => Ok(()),
            Err(source) => Err(AllocatorError::Storage { source }),
        }
    }

    /// Delete the master entry for `id` iff the key has no slave markers
    /// and the entry is unchanged since observed. Returns whether the
    /// entry was collected.
    async fn gc_master(&self, id: IdentityId, canonical: &str) -> Result<bool, AllocatorError> {
        let slaves = self
            .list_with_retries(&self.slave_prefix(canonical))
            .await
            .context(StorageSnafu)?;
        if !slaves.is_empty() {
            return Ok(false);
        }
        let path = self.master_path(id);
        let Some(master) = self.get_with_retries(&path).await.context(StorageSnafu)? else {
            return Ok(false);
        };
        if master.value != canonical {
            // Rebound since observed; not ours to collect.
            return Ok(false);
        }
        let deleted = self
            .backend
            .compare_and_delete(&path, master.mod_revision)
            .await
            .context(StorageSnafu)?;
        if deleted {
            debug!(key = %canonical, %id, "garbage collected orphaned master entry");
        }
        Ok(deleted)
    }

    async fn acquire_lock(&self, canonical: &str) -> Result<Box<dyn KvLock>, AllocatorError> {
        let path = self.lock_path(canonical);
        match tokio::time::timeout(self.config.lock_timeout, self.backend.lock(&path)).await {
            Ok(result) => result.context(StorageSnafu),
            Err(_) => Err(AllocatorError::Storage {
                source: KvError::LockUnavailable { key: path },
            }),
        }
    }

    async fn unlock(&self, lock: Box<dyn KvLock>, canonical: &str) {
        if let Err(error) = lock.unlock().await {
            warn!(key = %canonical, %error, "failed to release allocation lock");
        }
    }

    async fn list_with_retries(&self, prefix: &str) -> Result<Vec<KvPair>, KvError> {
        let mut backoff_ms = RETRY_INITIAL_BACKOFF_MS;
        let mut attempt = 0;
        loop {
            match self.backend.list_prefix(prefix).await {
                Err(error) if error.is_transient() && attempt < MAX_READ_RETRIES => {
                    attempt += 1;
                    debug!(prefix, %error, attempt, "transient listing failure, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(RETRY_MAX_BACKOFF_MS);
                }
                other => return other,
            }
        }
    }

    async fn get_with_retries(&self, key: &str) -> Result<Option<KvPair>, KvError> {
        let mut backoff_ms = RETRY_INITIAL_BACKOFF_MS;
        let mut attempt = 0;
        loop {
            match self.backend.get(key).await {
                Err(error) if error.is_transient() && attempt < MAX_READ_RETRIES => {
                    attempt += 1;
                    debug!(key, %error, attempt, "transient read failure, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(RETRY_MAX_BACKOFF_MS);
                }
                other => return other,
            }
        }
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    fn master_path(&self, id: IdentityId) -> String {
        format!("{}/{}", self.id_prefix, id)
    }

    fn slave_prefix(&self, canonical: &str) -> String {
        format!("{}/{}/", self.value_prefix, canonical)
    }

    fn slave_path(&self, canonical: &str) -> String {
        format!("{}/{}/{}", self.value_prefix, canonical, self.config.suffix)
    }

    fn lock_path(&self, canonical: &str) -> String {
        format!("{}/{}", self.lock_prefix, blake3::hash(canonical.as_bytes()).to_hex())
    }
}

impl<K: IdentityKey, B: KvBackend + ?Sized> Drop for Allocator<K, B> {
    fn drop(&mut self) {
        // Signal the background tasks; the lease is left to its TTL, the
        // same way a crashed node's markers are cleaned up.
        let _ = self.shutdown_tx.send(true);
    }
}

/// Periodic GC driver. Holds the allocator weakly so a dropped allocator
/// ends the loop.
async fn gc_loop<K: IdentityKey, B: KvBackend + ?Sized + 'static>(
    allocator: Weak<Allocator<K, B>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let Some(allocator) = allocator.upgrade() else {
                    return;
                };
                match allocator.run_gc().await {
                    Ok(collected) if collected > 0 => {
                        debug!(collected, "periodic gc pass complete");
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "periodic gc pass failed"),
                }
            }
        }
    }
}
