//! End-to-end allocator behavior over a shared in-memory backend.
//!
//! Each test stands up one or more allocator instances ("nodes") against
//! the same [`MemoryBackend`], the way independent daemons would share an
//! etcd cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clusterid::Allocator;
use clusterid::AllocatorConfig;
use clusterid::AllocatorError;
use clusterid::IdentityId;
use clusterid::KvBackend;
use clusterid::MemoryBackend;

const PREFIX: &str = "cluster/identities";

fn config(max: u64, suffix: &str) -> AllocatorConfig {
    AllocatorConfig {
        max,
        prefix: PREFIX.to_string(),
        suffix: suffix.to_string(),
        ..Default::default()
    }
}

async fn node(
    backend: &Arc<MemoryBackend>,
    max: u64,
    suffix: &str,
) -> Arc<Allocator<String, MemoryBackend>> {
    Allocator::new(backend.clone(), config(max, suffix)).await.unwrap()
}

/// Poll until `cond` holds; the watch propagates state asynchronously.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn allocates_distinct_ids_until_range_is_exhausted() {
    let backend = MemoryBackend::new();
    let allocator = node(&backend, 5, "a").await;

    let mut seen = Vec::new();
    for i in 1..=5u64 {
        let key = format!("key-{i}");
        let (id, is_new) = allocator.allocate(&key).await.unwrap();
        assert!(is_new, "first allocation of {key} must create the binding");
        assert!(id.value() >= 1 && id.value() <= 5);
        assert!(!seen.contains(&id), "duplicate ID {id}");
        seen.push(id);
    }

    let result = allocator.allocate(&"key-6".to_string()).await;
    assert!(matches!(result, Err(AllocatorError::PoolExhausted)));

    allocator.shutdown().await;
}

#[tokio::test]
async fn concurrent_nodes_agree_on_one_id() {
    let backend = MemoryBackend::new();
    let node_a = node(&backend, 100, "a").await;
    let node_b = node(&backend, 100, "b").await;
    let key = "app=web;env=prod".to_string();

    let (result_a, result_b) = tokio::join!(node_a.allocate(&key), node_b.allocate(&key));
    let (id_a, new_a) = result_a.unwrap();
    let (id_b, new_b) = result_b.unwrap();

    assert_eq!(id_a, id_b, "both nodes must observe the same binding");
    assert!(new_a ^ new_b, "exactly one node creates the binding");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn refcounted_release_removes_slave_then_gc_removes_master() {
    let backend = MemoryBackend::new();
    let allocator = node(&backend, 16, "a").await;
    let key = "k".to_string();

    let (id, is_new) = allocator.allocate(&key).await.unwrap();
    assert!(is_new);
    let (again, is_new) = allocator.allocate(&key).await.unwrap();
    assert_eq!(id, again);
    assert!(!is_new);
    assert_eq!(allocator.local_refcount(&key), 2);

    let slave_path = format!("{PREFIX}/value/k/a");
    let master_path = format!("{PREFIX}/id/{id}");

    // First release keeps the slave marker alive.
    allocator.release(&key).await.unwrap();
    assert!(backend.get(&slave_path).await.unwrap().is_some());

    // Last release drops it; the master entry stays until GC.
    allocator.release(&key).await.unwrap();
    assert_eq!(allocator.local_refcount(&key), 0);
    assert!(backend.get(&slave_path).await.unwrap().is_none());
    assert!(backend.get(&master_path).await.unwrap().is_some());

    let collected = allocator.run_gc().await.unwrap();
    assert_eq!(collected, 1);
    assert!(backend.get(&master_path).await.unwrap().is_none());

    // The ID flows back into the pool through the watch.
    eventually("freed ID to return to the pool", || {
        allocator.available_ids() == 16
    })
    .await;

    let (reallocated, is_new) = allocator.allocate(&"other".to_string()).await.unwrap();
    assert!(is_new);
    assert!(reallocated.value() >= 1 && reallocated.value() <= 16);

    allocator.shutdown().await;
}

#[tokio::test]
async fn releasing_without_holding_fails() {
    let backend = MemoryBackend::new();
    let allocator = node(&backend, 4, "a").await;

    let result = allocator.release(&"never-allocated".to_string()).await;
    assert!(matches!(result, Err(AllocatorError::NotLocallyHeld { .. })));

    allocator.shutdown().await;
}

#[tokio::test]
async fn exhausted_pool_recovers_after_gc() {
    let backend = MemoryBackend::new();
    let node_a = node(&backend, 2, "a").await;

    let (id_x, _) = node_a.allocate(&"x".to_string()).await.unwrap();

    let node_b = node(&backend, 2, "b").await;
    let (id_y, _) = node_b.allocate(&"y".to_string()).await.unwrap();
    assert_ne!(id_x, id_y);

    // x is released but its master still occupies the ID until GC runs.
    node_a.release(&"x".to_string()).await.unwrap();
    let result = node_b.allocate(&"z".to_string()).await;
    assert!(matches!(result, Err(AllocatorError::PoolExhausted)));

    assert_eq!(node_a.run_gc().await.unwrap(), 1);
    eventually("node b to observe the freed ID", || node_b.available_ids() > 0).await;

    let (id_z, is_new) = node_b.allocate(&"z".to_string()).await.unwrap();
    assert!(is_new);
    assert_eq!(id_z, id_x, "only the GC'd ID can be free");
    assert_ne!(id_z, id_y, "must never hand out an ID still bound to another key");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn master_without_slave_is_adopted_after_crash() {
    let backend = MemoryBackend::new();

    // A node crashed after writing the master entry but before its slave
    // marker: the binding exists, nobody references it.
    backend.create_only(&format!("{PREFIX}/id/3"), "k", None).await.unwrap();

    let allocator = node(&backend, 8, "a").await;
    let (id, is_new) = allocator.allocate(&"k".to_string()).await.unwrap();
    assert_eq!(id, IdentityId(3));
    assert!(!is_new, "the pre-crash binding must be reused");

    // Our slave marker now protects the entry from GC.
    assert!(backend.get(&format!("{PREFIX}/value/k/a")).await.unwrap().is_some());
    assert_eq!(allocator.run_gc().await.unwrap(), 0);

    allocator.shutdown().await;
}

#[tokio::test]
async fn dead_node_lease_expiry_unblocks_gc() {
    let backend = MemoryBackend::new();
    let node_a = node(&backend, 4, "a").await;
    let (id, _) = node_a.allocate(&"k".to_string()).await.unwrap();
    let lease_a = node_a.lease();

    // Hard crash: no release, no shutdown. The lease eventually expires
    // and takes the node's slave markers with it.
    drop(node_a);
    backend.expire_lease(lease_a);
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/value/")), 0);

    let node_b = node(&backend, 4, "b").await;
    assert_eq!(node_b.run_gc().await.unwrap(), 1);
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/id/")), 0);

    // The ID is reusable for a different key.
    eventually("freed ID to reach node b's pool", || node_b.available_ids() == 4).await;
    let (reused, is_new) = node_b.allocate(&"other".to_string()).await.unwrap();
    assert!(is_new);
    assert_eq!(reused, id);

    node_b.shutdown().await;
}

#[tokio::test]
async fn watch_reconnection_converges_to_true_state() {
    let backend = MemoryBackend::new();
    let node_a = node(&backend, 4, "a").await;
    let node_b = node(&backend, 4, "b").await;

    let (id_k1, _) = node_a.allocate(&"k1".to_string()).await.unwrap();
    eventually("node b to mirror k1", || node_b.get_by_id(id_k1).is_some()).await;

    // Partition every watch stream, then mutate the store underneath.
    backend.disconnect_watchers();

    let (id_k2, is_new) = node_b.allocate(&"k2".to_string()).await.unwrap();
    assert!(is_new, "writes must keep working while the watch is down");

    node_a.release(&"k1".to_string()).await.unwrap();
    assert_eq!(node_b.run_gc().await.unwrap(), 1);

    // After reconnect both mirrors converge and the freed ID returns.
    eventually("node a to mirror k2", || {
        node_a.get_by_id(id_k2).as_deref() == Some("k2")
    })
    .await;
    eventually("node a to drop k1", || node_a.get_by_id(id_k1).is_none()).await;
    // Pool state after convergence: k1's ID back, k2's ID reserved.
    eventually("node a's pool to reconcile", || node_a.available_ids() == 3).await;

    let (id_k3, is_new) = node_a.allocate(&"k3".to_string()).await.unwrap();
    assert!(is_new);
    assert_eq!(id_k3, id_k1, "the ID freed during the partition is reused");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn two_nodes_share_bindings_and_gc_evicts_when_all_release() {
    let backend = MemoryBackend::new();
    let node_a = node(&backend, 64, "a").await;
    let keys: Vec<String> = (1..=8).map(|i| format!("key{i:04}")).collect();

    for key in &keys {
        let (_, is_new) = node_a.allocate(key).await.unwrap();
        assert!(is_new);
        assert_eq!(node_a.local_refcount(key), 1);
    }

    // A second node resolves every key to the same ID without creating
    // anything new.
    let node_b = node(&backend, 64, "b").await;
    for key in &keys {
        let expected = node_a.get(key).await.unwrap().unwrap();
        let (id, is_new) = node_b.allocate(key).await.unwrap();
        assert_eq!(id, expected);
        assert!(!is_new);
        assert_eq!(node_b.local_refcount(key), 1);
        node_b.release(key).await.unwrap();
    }

    // Masters survive while node a still holds references.
    assert_eq!(node_a.run_gc().await.unwrap(), 0);
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/id/")), keys.len());

    for key in &keys {
        node_a.release(key).await.unwrap();
    }
    assert_eq!(node_a.run_gc().await.unwrap(), keys.len());
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/id/")), 0);
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/value/")), 0);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn bypassing_the_local_fast_path_still_balances_refcounts() {
    let backend = MemoryBackend::new();
    let mut cfg = config(8, "a");
    cfg.use_local_cache = false;
    let allocator = Allocator::<String, _>::new(backend.clone(), cfg).await.unwrap();
    let key = "k".to_string();

    let (id, is_new) = allocator.allocate(&key).await.unwrap();
    assert!(is_new);
    let (again, is_new) = allocator.allocate(&key).await.unwrap();
    assert_eq!(id, again);
    assert!(!is_new);
    // The refcount table is still maintained for release bookkeeping.
    assert_eq!(allocator.local_refcount(&key), 2);

    allocator.release(&key).await.unwrap();
    allocator.release(&key).await.unwrap();
    assert!(backend.get(&format!("{PREFIX}/value/k/a")).await.unwrap().is_none());

    allocator.shutdown().await;
}

#[tokio::test]
async fn many_nodes_many_keys_agree_and_never_collide() {
    let backend = MemoryBackend::new();
    let nodes = [
        node(&backend, 256, "a").await,
        node(&backend, 256, "b").await,
        node(&backend, 256, "c").await,
    ];
    let keys: Vec<String> = (0..10).map(|i| format!("identity-{i}")).collect();

    let mut handles = Vec::new();
    for allocator in &nodes {
        for key in &keys {
            let allocator = allocator.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let (id, _) = allocator.allocate(&key).await.unwrap();
                (key, id)
            }));
        }
    }

    let mut bindings: HashMap<String, IdentityId> = HashMap::new();
    for handle in handles {
        let (key, id) = handle.await.unwrap();
        assert!(id.value() >= 1 && id.value() <= 256);
        match bindings.get(&key) {
            Some(existing) => assert_eq!(*existing, id, "nodes disagree on {key}"),
            None => {
                bindings.insert(key, id);
            }
        }
    }

    // Injectivity: distinct keys got distinct IDs.
    let mut ids: Vec<IdentityId> = bindings.values().copied().collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), keys.len());

    for allocator in nodes {
        allocator.shutdown().await;
    }
}

#[tokio::test]
async fn delete_all_keys_wipes_the_namespace() {
    let backend = MemoryBackend::new();
    let allocator = node(&backend, 8, "a").await;

    allocator.allocate(&"x".to_string()).await.unwrap();
    allocator.allocate(&"y".to_string()).await.unwrap();
    assert!(backend.count_prefix(&format!("{PREFIX}/")) > 0);

    allocator.delete_all_keys().await.unwrap();
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/id/")), 0);
    assert_eq!(backend.count_prefix(&format!("{PREFIX}/value/")), 0);
    assert_eq!(allocator.local_refcount(&"x".to_string()), 0);

    allocator.shutdown().await;
}

#[tokio::test]
async fn allocators_under_different_prefixes_are_independent() {
    let backend = MemoryBackend::new();
    let mut cfg_a = config(4, "a");
    cfg_a.prefix = "tenant-1/identities".to_string();
    let mut cfg_b = config(4, "a");
    cfg_b.prefix = "tenant-2/identities".to_string();

    let tenant_1 = Allocator::<String, _>::new(backend.clone(), cfg_a).await.unwrap();
    let tenant_2 = Allocator::<String, _>::new(backend.clone(), cfg_b).await.unwrap();

    let (id_1, new_1) = tenant_1.allocate(&"k".to_string()).await.unwrap();
    let (id_2, new_2) = tenant_2.allocate(&"k".to_string()).await.unwrap();

    // Same key, disjoint namespaces: both allocations are fresh.
    assert!(new_1 && new_2);
    assert_eq!(id_1, id_2);
    assert_eq!(backend.count_prefix("tenant-1/identities/id/"), 1);
    assert_eq!(backend.count_prefix("tenant-2/identities/id/"), 1);

    tenant_1.shutdown().await;
    tenant_2.shutdown().await;
}
