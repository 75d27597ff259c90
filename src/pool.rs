//! Local pool of unused identity IDs.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::key::IdentityId;

/// Set of IDs in `[min, max]` believed to be globally free.
///
/// Best-effort only: the pool is kept current by the watch-driven cache,
/// and a leased candidate can still lose the create-only race on the
/// store. Global uniqueness rests on that race, not on this set.
pub struct IdPool {
    min: u64,
    max: u64,
    available: Mutex<BTreeSet<u64>>,
}

impl IdPool {
    /// Create a pool with every ID in `[min, max]` available. The caller
    /// validates the range.
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min,
            max,
            available: Mutex::new((min..=max).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.available.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove and return the smallest available ID, or `None` when the
    /// pool is empty. The removal is tentative; a failed claim hands the
    /// ID back via [`IdPool::release`] or [`IdPool::insert_reserved`].
    pub fn lease_available(&self) -> Option<IdentityId> {
        let mut available = self.lock();
        let id = *available.iter().next()?;
        available.remove(&id);
        Some(IdentityId(id))
    }

    /// Return an ID to the pool. IDs outside `[min, max]` are ignored;
    /// the store may carry entries from an allocator with a wider range.
    pub fn release(&self, id: IdentityId) {
        if id.value() < self.min || id.value() > self.max {
            return;
        }
        self.lock().insert(id.value());
    }

    /// Mark an ID as used remotely (observed through the watch).
    pub fn insert_reserved(&self, id: IdentityId) {
        self.lock().remove(&id.value());
    }

    /// Number of IDs currently available.
    pub fn available_len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn leases_ascend_from_min() {
        let pool = IdPool::new(1, 5);
        for expected in 1..=5 {
            assert_eq!(pool.lease_available(), Some(IdentityId(expected)));
        }
        assert_eq!(pool.lease_available(), None);
    }

    #[test]
    fn release_returns_id_to_pool() {
        let pool = IdPool::new(1, 2);
        pool.lease_available();
        pool.lease_available();
        assert_eq!(pool.lease_available(), None);

        pool.release(IdentityId(1));
        assert_eq!(pool.lease_available(), Some(IdentityId(1)));
    }

    #[test]
    fn release_out_of_range_is_ignored() {
        let pool = IdPool::new(10, 12);
        pool.release(IdentityId(1));
        pool.release(IdentityId(13));
        assert_eq!(pool.available_len(), 3);
    }

    #[test]
    fn insert_reserved_removes_candidate() {
        let pool = IdPool::new(1, 3);
        pool.insert_reserved(IdentityId(1));
        pool.insert_reserved(IdentityId(2));
        assert_eq!(pool.lease_available(), Some(IdentityId(3)));
        assert_eq!(pool.lease_available(), None);
    }

    #[test]
    fn insert_reserved_is_idempotent() {
        let pool = IdPool::new(1, 3);
        pool.insert_reserved(IdentityId(2));
        pool.insert_reserved(IdentityId(2));
        assert_eq!(pool.available_len(), 2);
    }

    proptest! {
        /// Leased IDs are unique and in range until the pool drains.
        #[test]
        fn leases_are_unique_and_in_range(min in 1u64..50, span in 0u64..50) {
            let max = min + span;
            let pool = IdPool::new(min, max);
            let mut seen = HashSet::new();
            while let Some(id) = pool.lease_available() {
                prop_assert!(id.value() >= min && id.value() <= max);
                prop_assert!(seen.insert(id));
            }
            prop_assert_eq!(seen.len() as u64, span + 1);
        }
    }
}
