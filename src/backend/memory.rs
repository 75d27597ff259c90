//! In-memory implementation of [`KvBackend`] for testing.
//!
//! Deterministic, non-persistent, single-process. Mirrors the behavior a
//! production driver provides without network I/O: per-key modification
//! revisions, atomic create-only, prefix watches with a bootstrap
//! sentinel, leases whose revocation deletes the attached keys, and
//! per-key async locks.
//!
//! # Limitations
//!
//! - Leases have no wall-clock expiry; tests simulate a node death with
//!   [`MemoryBackend::expire_lease`].
//! - No persistence, no replication.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use tracing::warn;

use crate::backend::KvBackend;
use crate::backend::KvLock;
use crate::backend::KvPair;
use crate::backend::LeaseId;
use crate::backend::WatchEvent;
use crate::backend::WatchEventKind;
use crate::backend::WatchStream;
use crate::constants::WATCH_CHANNEL_CAPACITY;
use crate::error::KvError;

/// One stored entry.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

/// One registered watch subscription.
struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    leases: HashMap<LeaseId, HashSet<String>>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Deliver an event to every matching watcher, dropping closed ones.
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if !event.key.starts_with(&watcher.prefix) {
                return true;
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Closed(_)) => false,
                Err(TrySendError::Full(_)) => {
                    warn!(prefix = %watcher.prefix, "watch buffer full, dropping event");
                    true
                }
            }
        });
    }

    /// Remove an entry, detach it from its lease, and fire a delete event.
    fn remove_entry(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        if let Some(lease) = entry.lease {
            if let Some(keys) = self.leases.get_mut(&lease) {
                keys.remove(key);
            }
        }
        self.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            value: Some(entry.value.clone()),
        });
        Some(entry)
    }
}

/// In-memory deterministic [`KvBackend`].
///
/// # Example
///
/// ```ignore
/// let backend = MemoryBackend::new();
/// let created = backend.create_only("ns/id/1", "app=web", None).await?;
/// assert!(created);
/// ```
#[derive(Default)]
pub struct MemoryBackend {
    // Held only for short synchronous sections, never across an await.
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate the death of a lease owner: every key attached to the
    /// lease is deleted, exactly as a TTL expiry would.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut state = self.state();
        let keys: Vec<String> = state
            .leases
            .remove(&lease)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();
        for key in keys {
            state.remove_entry(&key);
        }
    }

    /// Drop every open watch stream, as a network partition would. The
    /// consumers observe end-of-stream and reconnect.
    pub fn disconnect_watchers(&self) {
        self.state().watchers.clear();
    }

    /// Number of entries currently stored under `prefix` (test helper).
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.state()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError> {
        let state = self.state();
        Ok(state.entries.get(key).map(|entry| KvPair {
            key: key.to_string(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, KvError> {
        let state = self.state();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KvPair {
                key: key.clone(),
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
            })
            .collect())
    }

    async fn create_only(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, KvError> {
        let mut state = self.state();
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        if let Some(lease_id) = lease {
            let known = state.leases.contains_key(&lease_id);
            if !known {
                return Err(KvError::LeaseExpired { lease_id });
            }
        }
        let mod_revision = state.next_revision();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                mod_revision,
                lease,
            },
        );
        if let Some(lease_id) = lease {
            if let Some(keys) = state.leases.get_mut(&lease_id) {
                keys.insert(key.to_string());
            }
        }
        state.notify(WatchEvent {
            kind: WatchEventKind::Create,
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        new_value: &str,
    ) -> Result<bool, KvError> {
        let mut state = self.state();
        let matches = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.mod_revision == expected_revision);
        if !matches {
            return Ok(false);
        }
        let mod_revision = state.next_revision();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.value = new_value.to_string();
            entry.mod_revision = mod_revision;
        }
        state.notify(WatchEvent {
            kind: WatchEventKind::Modify,
            key: key.to_string(),
            value: Some(new_value.to_string()),
        });
        Ok(true)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected_revision: u64,
    ) -> Result<bool, KvError> {
        let mut state = self.state();
        let matches = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.mod_revision == expected_revision);
        if !matches {
            return Ok(false);
        }
        state.remove_entry(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state();
        match state.remove_entry(key) {
            Some(_) => Ok(()),
            None => Err(KvError::NotFound { key: key.to_string() }),
        }
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, KvError> {
        let mut state = self.state();
        let snapshot: Vec<(String, String)> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();

        // Capacity covers the bootstrap replay plus live-event headroom,
        // so the try_sends below cannot fail.
        let (tx, rx) = mpsc::channel(snapshot.len() + WATCH_CHANNEL_CAPACITY);
        for (key, value) in snapshot {
            let _ = tx.try_send(WatchEvent {
                kind: WatchEventKind::Create,
                key,
                value: Some(value),
            });
        }
        let _ = tx.try_send(WatchEvent {
            kind: WatchEventKind::BootstrapDone,
            key: String::new(),
            value: None,
        });
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn KvLock>, KvError> {
        let mutex = {
            let mut state = self.state();
            state
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(Box::new(MemoryLock { _guard: guard }))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError> {
        let mut state = self.state();
        state.next_lease += 1;
        let lease_id = state.next_lease;
        state.leases.insert(lease_id, HashSet::new());
        debug!(lease_id, ttl_ms = ttl.as_millis() as u64, "lease granted");
        Ok(lease_id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError> {
        self.expire_lease(lease);
        Ok(())
    }
}

/// Held per-key lock; releasing drops the guard.
struct MemoryLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl KvLock for MemoryLock {
    async fn unlock(self: Box<Self>) -> Result<(), KvError> {
        Ok(())
    }
}
