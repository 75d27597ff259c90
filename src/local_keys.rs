//! Per-process reference-count table for allocated keys.
//!
//! Source of truth for "does *this* node still need this ID?". Consulted
//! first on every allocation; a hit short-circuits all KV interaction.
//! While a key's refcount is positive the node keeps a live slave marker
//! for it in the store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::AllocatorError;
use crate::key::IdentityId;
use crate::key::IdentityKey;

struct LocalKey<K> {
    key: K,
    id: IdentityId,
    refcnt: u64,
}

#[derive(Default)]
struct Inner<K> {
    by_canonical: HashMap<String, LocalKey<K>>,
    by_id: HashMap<IdentityId, String>,
}

/// Thread-safe map from key to `(ID, refcount)`.
///
/// The mutex is held only for short synchronous sections and never across
/// an await point.
pub struct LocalKeys<K> {
    inner: Mutex<Inner<K>>,
}

impl<K: IdentityKey> LocalKeys<K> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_canonical: HashMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    // Recover from poisoned locks: the maps hold no invariants a panicking
    // reader could have broken mid-operation.
    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// If the key is present, increment its refcount and return its ID.
    /// Never inserts.
    pub fn use_key(&self, canonical: &str) -> Option<IdentityId> {
        let mut inner = self.lock();
        let entry = inner.by_canonical.get_mut(canonical)?;
        entry.refcnt += 1;
        Some(entry.id)
    }

    /// Bind `key` to `id` with refcount 1, or increment the refcount when
    /// the same binding already exists.
    ///
    /// # Errors
    ///
    /// [`AllocatorError::KeyMismatch`] when the key is already bound to a
    /// different ID; that indicates a caller bug or a corrupted store.
    pub fn allocate(&self, key: &K, canonical: &str, id: IdentityId) -> Result<(), AllocatorError> {
        let mut inner = self.lock();
        if let Some(entry) = inner.by_canonical.get_mut(canonical) {
            if entry.id != id {
                return Err(AllocatorError::KeyMismatch {
                    key: canonical.to_string(),
                    existing: entry.id.value(),
                    requested: id.value(),
                });
            }
            entry.refcnt += 1;
            return Ok(());
        }
        inner.by_canonical.insert(
            canonical.to_string(),
            LocalKey {
                key: key.clone(),
                id,
                refcnt: 1,
            },
        );
        inner.by_id.insert(id, canonical.to_string());
        Ok(())
    }

    /// Decrement the key's refcount. Returns the bound ID and whether this
    /// was the last local reference (the entry is removed in that case).
    ///
    /// # Errors
    ///
    /// [`AllocatorError::NotLocallyHeld`] when the key has no entry.
    pub fn release(&self, canonical: &str) -> Result<(IdentityId, bool), AllocatorError> {
        let mut inner = self.lock();
        let entry = inner.by_canonical.get_mut(canonical).ok_or_else(|| {
            AllocatorError::NotLocallyHeld {
                key: canonical.to_string(),
            }
        })?;
        entry.refcnt -= 1;
        let id = entry.id;
        if entry.refcnt > 0 {
            return Ok((id, false));
        }
        inner.by_canonical.remove(canonical);
        inner.by_id.remove(&id);
        Ok((id, true))
    }

    /// ID bound to `canonical`, without touching the refcount.
    pub fn lookup_key(&self, canonical: &str) -> Option<IdentityId> {
        self.lock().by_canonical.get(canonical).map(|entry| entry.id)
    }

    /// Key bound to `id`, without touching the refcount.
    pub fn lookup_id(&self, id: IdentityId) -> Option<K> {
        let inner = self.lock();
        let canonical = inner.by_id.get(&id)?;
        inner.by_canonical.get(canonical).map(|entry| entry.key.clone())
    }

    /// Current refcount of `canonical`; 0 when absent.
    pub fn refcount(&self, canonical: &str) -> u64 {
        self.lock()
            .by_canonical
            .get(canonical)
            .map(|entry| entry.refcnt)
            .unwrap_or(0)
    }

    /// All held keys as `(key, id, refcount)` tuples.
    pub fn snapshot(&self) -> Vec<(K, IdentityId, u64)> {
        self.lock()
            .by_canonical
            .values()
            .map(|entry| (entry.key.clone(), entry.id, entry.refcnt))
            .collect()
    }

    /// True when no key is held.
    pub fn is_empty(&self) -> bool {
        self.lock().by_canonical.is_empty()
    }

    /// Drop every entry. Used on allocator shutdown.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.by_canonical.clear();
        inner.by_id.clear();
    }
}

impl<K: IdentityKey> Default for LocalKeys<K> {
    fn default() -> Self {
        Self::new()
    }
}
