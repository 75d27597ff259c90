//! Watch-driven mirror of the global ID table.
//!
//! Maintains an eventually consistent in-memory copy of every master
//! entry under `<prefix>/id/`, fed by a backend prefix watch. The mirror
//! is an accelerator: allocation correctness rests on the create-only and
//! compare-and-swap paths, never on this cache being current.
//!
//! The watch task reconnects indefinitely with capped backoff. Every
//! (re)connect replays the full listing; entries that vanished while the
//! stream was down are pruned and their IDs released back to the pool, so
//! a disconnection never leaks IDs.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::allocator::AllocatorEvent;
use crate::allocator::AllocatorEventKind;
use crate::backend::KvBackend;
use crate::backend::WatchEvent;
use crate::backend::WatchEventKind;
use crate::constants::RETRY_INITIAL_BACKOFF_MS;
use crate::constants::RETRY_MAX_BACKOFF_MS;
use crate::error::AllocatorError;
use crate::key::IdentityId;
use crate::key::IdentityKey;
use crate::pool::IdPool;

/// Extract the numeric ID from a master-entry path.
///
/// `watch_prefix` is the watched prefix including its trailing slash.
/// Foreign paths (wrong prefix, nested segments, non-numeric or zero IDs)
/// yield `None` rather than an error; the store may carry unrelated keys.
pub(crate) fn id_from_master_path(watch_prefix: &str, path: &str) -> Option<IdentityId> {
    let rest = path.strip_prefix(watch_prefix)?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    let raw: u64 = rest.parse().ok()?;
    if raw == 0 {
        return None;
    }
    Some(IdentityId(raw))
}

#[derive(Default)]
struct CacheState<K> {
    by_id: HashMap<IdentityId, K>,
    by_key: HashMap<String, IdentityId>,
}

/// Eventually consistent mirror of `<prefix>/id/*`.
///
/// Readers take a short read lock; the watch task is the only writer.
pub struct RemoteCache<K> {
    /// Watched prefix, including the trailing slash.
    watch_prefix: String,
    state: RwLock<CacheState<K>>,
    pool: Arc<IdPool>,
    events: broadcast::Sender<AllocatorEvent<K>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<K: IdentityKey> RemoteCache<K> {
    pub(crate) fn new(
        watch_prefix: String,
        pool: Arc<IdPool>,
        events: broadcast::Sender<AllocatorEvent<K>>,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            watch_prefix,
            state: RwLock::new(CacheState {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
            }),
            pool,
            events,
            ready_tx,
            ready_rx,
        }
    }

    /// Key bound to `id`, if the mirror has seen it.
    pub fn get_by_id(&self, id: IdentityId) -> Option<K> {
        self.read().by_id.get(&id).cloned()
    }

    /// ID bound to the canonical key representation, if seen.
    pub fn get_by_key(&self, canonical: &str) -> Option<IdentityId> {
        self.read().by_key.get(canonical).copied()
    }

    /// Copy of the full mirror.
    pub fn snapshot(&self) -> Vec<(IdentityId, K)> {
        self.read()
            .by_id
            .iter()
            .map(|(id, key)| (*id, key.clone()))
            .collect()
    }

    /// Number of mirrored entries.
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// True when no entry is mirrored.
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Wait until the initial listing has been applied.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), AllocatorError> {
        let duration_ms = timeout.as_millis() as u64;
        let mut ready = self.ready_rx.clone();
        tokio::time::timeout(timeout, ready.wait_for(|synced| *synced))
            .await
            .map_err(|_| AllocatorError::BootstrapTimeout { duration_ms })?
            .map_err(|_| AllocatorError::BootstrapTimeout { duration_ms })?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState<K>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState<K>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch loop. Runs until the shutdown flag flips or its sender drops.
    pub(crate) async fn run<B: KvBackend + ?Sized>(
        self: Arc<Self>,
        backend: Arc<B>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff_ms = RETRY_INITIAL_BACKOFF_MS;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match backend.watch_prefix(&self.watch_prefix).await {
                Ok(mut stream) => {
                    backoff_ms = RETRY_INITIAL_BACKOFF_MS;
                    let mut seen: HashSet<IdentityId> = HashSet::new();
                    let mut bootstrapping = true;
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    return;
                                }
                            }
                            event = stream.recv() => match event {
                                Some(event) if event.kind == WatchEventKind::BootstrapDone => {
                                    self.finish_bootstrap(&seen);
                                    bootstrapping = false;
                                }
                                Some(event) => {
                                    self.apply_event(event, bootstrapping.then_some(&mut seen));
                                }
                                None => {
                                    warn!(
                                        prefix = %self.watch_prefix,
                                        "watch stream ended, reconnecting"
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        prefix = %self.watch_prefix,
                        error = %error,
                        "failed to open watch, retrying"
                    );
                }
            }

            // Jittered backoff; the rng is created here so no non-Send
            // value is held across the await.
            let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
            let delay = Duration::from_millis(backoff_ms + jitter);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
            backoff_ms = (backoff_ms * 2).min(RETRY_MAX_BACKOFF_MS);
        }
    }

    /// Apply one watch event to the mirror and the pool.
    fn apply_event(&self, event: WatchEvent, seen: Option<&mut HashSet<IdentityId>>) {
        let Some(id) = id_from_master_path(&self.watch_prefix, &event.key) else {
            debug!(path = %event.key, "ignoring foreign key under watch prefix");
            return;
        };

        match event.kind {
            WatchEventKind::Create | WatchEventKind::Modify => {
                let Some(value) = event.value else {
                    warn!(path = %event.key, "master entry event without value, skipping");
                    return;
                };
                let key = match K::parse(&value) {
                    Ok(key) => key,
                    Err(reason) => {
                        warn!(path = %event.key, %reason, "unparseable master entry, skipping");
                        return;
                    }
                };
                let canonical = key.canonical();
                let prior_canonical = {
                    let mut state = self.write();
                    let prior = state.by_id.insert(id, key.clone()).map(|old| old.canonical());
                    if let Some(old) = &prior {
                        if *old != canonical {
                            state.by_key.remove(old);
                        }
                    }
                    state.by_key.insert(canonical.clone(), id);
                    prior
                };
                self.pool.insert_reserved(id);
                if let Some(seen) = seen {
                    seen.insert(id);
                }
                // Reconnect replays re-deliver known entries; only real
                // changes are published.
                match prior_canonical {
                    None => {
                        let _ = self.events.send(AllocatorEvent {
                            kind: AllocatorEventKind::Created,
                            id,
                            key: Some(key),
                        });
                    }
                    Some(old) if old != canonical => {
                        let _ = self.events.send(AllocatorEvent {
                            kind: AllocatorEventKind::Modified,
                            id,
                            key: Some(key),
                        });
                    }
                    Some(_) => {}
                }
            }
            WatchEventKind::Delete => {
                let removed = {
                    let mut state = self.write();
                    let removed = state.by_id.remove(&id);
                    if let Some(key) = &removed {
                        state.by_key.remove(&key.canonical());
                    }
                    removed
                };
                if removed.is_some() {
                    self.pool.release(id);
                    let _ = self.events.send(AllocatorEvent {
                        kind: AllocatorEventKind::Deleted,
                        id,
                        key: removed,
                    });
                }
            }
            WatchEventKind::BootstrapDone => {}
        }
    }

    /// Reconcile after a bootstrap replay: entries the fresh listing did
    /// not contain were deleted while the watch was down.
    fn finish_bootstrap(&self, seen: &HashSet<IdentityId>) {
        let pruned: Vec<(IdentityId, K)> = {
            let mut state = self.write();
            let stale: Vec<IdentityId> = state
                .by_id
                .keys()
                .filter(|id| !seen.contains(id))
                .copied()
                .collect();
            stale
                .into_iter()
                .filter_map(|id| {
                    let key = state.by_id.remove(&id)?;
                    state.by_key.remove(&key.canonical());
                    Some((id, key))
                })
                .collect()
        };
        for (id, key) in pruned {
            self.pool.release(id);
            let _ = self.events.send(AllocatorEvent {
                kind: AllocatorEventKind::Deleted,
                id,
                key: Some(key),
            });
        }

        let entries = self.len();
        self.ready_tx.send_replace(true);
        info!(prefix = %self.watch_prefix, entries, "identity cache synchronized");
    }
}
