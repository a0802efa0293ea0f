//! Reference-counted segment cache
//!
//! Segment files fetched from a primary (or read back from local disk) are
//! cached node-wide under a soft byte capacity. Callers hold
//! [`CacheHandle`]s; an entry with outstanding handles is never evicted.
//! Once usage exceeds capacity, unreferenced entries are evicted in the
//! order chosen by an [`EvictionPolicy`] until usage is back under capacity
//! or nothing evictable remains.
//!
//! Reference counts only move between zero and non-zero while the
//! structural lock is held, which is what keeps eviction from racing an
//! acquire. Releases that leave other holders behind never take the lock.

use bytes::Bytes;
use parking_lot::Mutex;
use shardsync_common::config::{CacheConfig, EvictionPolicyKind};
use shardsync_common::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Resources that know how many bytes they hold
pub trait Weighted {
    fn weight(&self) -> u64;
}

impl Weighted for Bytes {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

impl Weighted for Vec<u8> {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

/// Bounds required of cache keys
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> CacheKey for T {}

/// Bounds required of cached values
pub trait CacheValue: Weighted + Send + Sync + 'static {}

impl<T: Weighted + Send + Sync + 'static> CacheValue for T {}

/// Point-in-time byte accounting.
///
/// `active_usage <= usage` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    /// Bytes held by all entries, referenced or not
    pub usage: u64,
    /// Bytes held by entries with outstanding handles
    pub active_usage: u64,
}

/// What an eviction policy gets to rank an entry on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub size: u64,
    /// Logical clock value of the last acquire
    pub last_access: u64,
}

/// Orders unreferenced entries for eviction
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// True if `candidate` should be evicted before `current`
    fn evict_before(&self, candidate: &EntryInfo, current: &EntryInfo) -> bool;
}

/// Least recently acquired first
#[derive(Debug, Clone, Copy, Default)]
pub struct Lru;

impl EvictionPolicy for Lru {
    fn evict_before(&self, candidate: &EntryInfo, current: &EntryInfo) -> bool {
        candidate.last_access < current.last_access
    }
}

/// Largest first, ties broken by recency
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirst;

impl EvictionPolicy for LargestFirst {
    fn evict_before(&self, candidate: &EntryInfo, current: &EntryInfo) -> bool {
        candidate.size > current.size
            || (candidate.size == current.size && candidate.last_access < current.last_access)
    }
}

/// Build the policy named in configuration
#[must_use]
pub fn eviction_policy(kind: EvictionPolicyKind) -> Arc<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Lru => Arc::new(Lru),
        EvictionPolicyKind::LargestFirst => Arc::new(LargestFirst),
    }
}

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Chosen by the capacity policy
    Evicted,
    /// Explicitly invalidated (released once the last handle dropped)
    Invalidated,
    /// The cache was closed
    Closed,
}

/// Called once for every entry whose resource is released
pub type RemovalListener<K, V> = Arc<dyn Fn(&K, &V, RemovalCause) + Send + Sync>;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Acquires served by an existing or in-flight entry
    pub hits: AtomicU64,
    /// Acquires that had to start a load
    pub misses: AtomicU64,
    /// Loads that failed or were abandoned
    pub load_failures: AtomicU64,
    /// Entries removed by the capacity policy
    pub evictions: AtomicU64,
    /// Entries removed by invalidation
    pub invalidations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.load_failures.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }
}

struct Entry<K, V> {
    key: K,
    value: V,
    size: u64,
    refs: AtomicU64,
    last_access: AtomicU64,
    /// Removed from the index while still referenced; its bytes stay
    /// accounted until the last handle is released
    retired: AtomicBool,
}

impl<K, V> Entry<K, V> {
    fn info(&self) -> EntryInfo {
        EntryInfo {
            size: self.size,
            last_access: self.last_access.load(Ordering::Relaxed),
        }
    }
}

type LoadOutcome<K, V> = Option<std::result::Result<Arc<Entry<K, V>>, String>>;

type Removed<K, V> = Vec<(Arc<Entry<K, V>>, RemovalCause)>;

struct LoadSlot<K, V> {
    id: u64,
    rx: watch::Receiver<LoadOutcome<K, V>>,
    /// Callers parked on this load. Each gets a reference counted on its
    /// behalf when the load completes.
    waiters: Arc<AtomicU64>,
}

enum Slot<K, V> {
    Ready(Arc<Entry<K, V>>),
    Loading(LoadSlot<K, V>),
}

struct Inner<K, V> {
    slots: HashMap<K, Slot<K, V>>,
    usage: u64,
    active_usage: u64,
    next_load_id: u64,
    closed: bool,
}

struct Shared<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: u64,
    policy: Arc<dyn EvictionPolicy>,
    /// Logical clock for recency ordering
    clock: AtomicU64,
    stats: CacheStats,
    listener: Option<RemovalListener<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Shared<K, V> {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take a reference on an indexed entry. Caller holds the lock.
    fn retain_locked(&self, inner: &mut Inner<K, V>, entry: &Entry<K, V>) {
        if entry.refs.fetch_add(1, Ordering::AcqRel) == 0 {
            inner.active_usage += entry.size;
        }
        entry.last_access.store(self.tick(), Ordering::Relaxed);
    }

    /// Drop a reference. Caller holds the lock.
    fn release_locked(&self, inner: &mut Inner<K, V>, entry: &Arc<Entry<K, V>>) -> Removed<K, V> {
        let prev = entry.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "released an entry with no references");

        let mut removed = Vec::new();
        if prev == 1 {
            inner.active_usage -= entry.size;
            if entry.retired.load(Ordering::Acquire) {
                inner.usage -= entry.size;
                removed.push((Arc::clone(entry), RemovalCause::Invalidated));
            } else if inner.usage > self.capacity {
                removed = self.evict_locked(inner);
            }
        }
        removed
    }

    /// Lock-free unless this might be the last reference
    fn release(&self, entry: &Arc<Entry<K, V>>) {
        let mut current = entry.refs.load(Ordering::Acquire);
        while current > 1 {
            match entry.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }

        let removed = {
            let mut inner = self.inner.lock();
            self.release_locked(&mut inner, entry)
        };
        self.notify_removed(removed);
    }

    /// Evict unreferenced entries until usage fits. Caller holds the lock.
    fn evict_locked(&self, inner: &mut Inner<K, V>) -> Removed<K, V> {
        let mut removed = Vec::new();

        while inner.usage > self.capacity {
            let victim = inner
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) if entry.refs.load(Ordering::Acquire) == 0 => {
                        Some((key, entry.info()))
                    }
                    _ => None,
                })
                .reduce(|best, candidate| {
                    if self.policy.evict_before(&candidate.1, &best.1) {
                        candidate
                    } else {
                        best
                    }
                })
                .map(|(key, _)| key.clone());

            let Some(key) = victim else {
                trace!(
                    usage = inner.usage,
                    capacity = self.capacity,
                    "cache over capacity with no evictable entries"
                );
                break;
            };

            if let Some(Slot::Ready(entry)) = inner.slots.remove(&key) {
                inner.usage -= entry.size;
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                removed.push((entry, RemovalCause::Evicted));
            }
        }

        removed
    }

    /// Unindex a slot. Referenced entries are retired rather than released.
    fn retire_locked(
        &self,
        inner: &mut Inner<K, V>,
        slot: Slot<K, V>,
        cause: RemovalCause,
    ) -> Option<(Arc<Entry<K, V>>, RemovalCause)> {
        match slot {
            Slot::Ready(entry) => {
                if entry.refs.load(Ordering::Acquire) == 0 {
                    inner.usage -= entry.size;
                    Some((entry, cause))
                } else {
                    entry.retired.store(true, Ordering::Release);
                    None
                }
            }
            // The load completes into a retired entry
            Slot::Loading(_) => None,
        }
    }

    fn notify_removed(&self, removed: Removed<K, V>) {
        for (entry, cause) in removed {
            debug!(key = ?entry.key, size = entry.size, ?cause, "cache entry released");
            if let Some(listener) = &self.listener {
                listener(&entry.key, &entry.value, cause);
            }
        }
    }
}

/// Capacity-bounded, reference-counted cache shared by every shard on a
/// node. Cloning is cheap and shares the same cache.
pub struct RefCountedCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for RefCountedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum Lookup<K, V> {
    Hit(Arc<Entry<K, V>>),
    Wait(watch::Receiver<LoadOutcome<K, V>>, Arc<AtomicU64>),
    Load(u64, watch::Sender<LoadOutcome<K, V>>, Arc<AtomicU64>),
}

impl<K: CacheKey, V: CacheValue> RefCountedCache<K, V> {
    /// Create a cache with the given soft capacity and eviction policy
    pub fn new(capacity: u64, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self::build(capacity, policy, None)
    }

    /// Create a cache that reports every released entry to `listener`
    pub fn with_removal_listener(
        capacity: u64,
        policy: Arc<dyn EvictionPolicy>,
        listener: RemovalListener<K, V>,
    ) -> Self {
        Self::build(capacity, policy, Some(listener))
    }

    /// Create a cache from node configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity_bytes, eviction_policy(config.eviction_policy))
    }

    fn build(
        capacity: u64,
        policy: Arc<dyn EvictionPolicy>,
        listener: Option<RemovalListener<K, V>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slots: HashMap::new(),
                    usage: 0,
                    active_usage: 0,
                    next_load_id: 0,
                    closed: false,
                }),
                capacity,
                policy,
                clock: AtomicU64::new(0),
                stats: CacheStats::default(),
                listener,
            }),
        }
    }

    /// Acquire a handle to the resource for `key`, running `loader` if the
    /// key is absent.
    ///
    /// At most one load per key is in flight; concurrent callers for the
    /// same key wait for it and share its result. A failed load is not
    /// retained, and every waiter observes the failure.
    pub async fn acquire<F, Fut>(&self, key: K, loader: F) -> Result<CacheHandle<K, V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let lookup = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(Error::CacheClosed);
            }

            let existing = match inner.slots.get(&key) {
                Some(Slot::Ready(entry)) => Some(Lookup::Hit(Arc::clone(entry))),
                Some(Slot::Loading(slot)) => {
                    slot.waiters.fetch_add(1, Ordering::AcqRel);
                    Some(Lookup::Wait(slot.rx.clone(), Arc::clone(&slot.waiters)))
                }
                None => None,
            };

            match existing {
                Some(Lookup::Hit(entry)) => {
                    self.shared.retain_locked(&mut inner, &entry);
                    Lookup::Hit(entry)
                }
                Some(other) => other,
                None => {
                    let id = inner.next_load_id;
                    inner.next_load_id += 1;
                    let (tx, rx) = watch::channel(None);
                    let waiters = Arc::new(AtomicU64::new(0));
                    inner.slots.insert(
                        key.clone(),
                        Slot::Loading(LoadSlot {
                            id,
                            rx,
                            waiters: Arc::clone(&waiters),
                        }),
                    );
                    Lookup::Load(id, tx, waiters)
                }
            }
        };

        match lookup {
            Lookup::Hit(entry) => {
                self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(CacheHandle {
                    shared: Arc::clone(&self.shared),
                    entry,
                })
            }
            Lookup::Wait(rx, waiters) => {
                self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.wait_for_load(key, rx, waiters).await
            }
            Lookup::Load(id, tx, waiters) => {
                self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
                let guard = LoadGuard {
                    shared: Arc::clone(&self.shared),
                    key,
                    id,
                    tx: Some(tx),
                    waiters,
                };
                let result = loader().await;
                guard.complete(result)
            }
        }
    }

    async fn wait_for_load(
        &self,
        key: K,
        rx: watch::Receiver<LoadOutcome<K, V>>,
        waiters: Arc<AtomicU64>,
    ) -> Result<CacheHandle<K, V>> {
        let mut guard = WaiterGuard {
            shared: Arc::clone(&self.shared),
            rx,
            waiters,
            consumed: false,
        };

        let outcome = match guard.rx.wait_for(Option::is_some).await {
            Ok(outcome) => Option::clone(&outcome),
            Err(_) => None,
        };
        guard.consumed = true;

        match outcome {
            Some(Ok(entry)) => Ok(CacheHandle {
                shared: Arc::clone(&self.shared),
                entry,
            }),
            Some(Err(reason)) => Err(Error::CacheLoad {
                key: format!("{key:?}"),
                reason,
            }),
            None => Err(Error::CacheLoad {
                key: format!("{key:?}"),
                reason: "loader went away".into(),
            }),
        }
    }

    /// Acquire a handle only if the entry is already loaded
    pub fn get(&self, key: &K) -> Option<CacheHandle<K, V>> {
        let mut inner = self.shared.inner.lock();
        let entry = match inner.slots.get(key) {
            Some(Slot::Ready(entry)) => Arc::clone(entry),
            _ => return None,
        };
        self.shared.retain_locked(&mut inner, &entry);
        self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheHandle {
            shared: Arc::clone(&self.shared),
            entry,
        })
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn release(handle: CacheHandle<K, V>) {
        drop(handle);
    }

    /// Remove `key` from the cache. The resource is released immediately if
    /// unreferenced, otherwise when its last handle is dropped. An in-flight
    /// load for the key completes for its waiters but is not indexed.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = {
            let mut inner = self.shared.inner.lock();
            let Some(slot) = inner.slots.remove(key) else {
                return false;
            };
            self.shared
                .stats
                .invalidations
                .fetch_add(1, Ordering::Relaxed);
            self.shared
                .retire_locked(&mut inner, slot, RemovalCause::Invalidated)
        };
        self.shared.notify_removed(removed.into_iter().collect());
        true
    }

    /// Remove every entry, with the same deferred release as [`invalidate`](Self::invalidate)
    pub fn invalidate_all(&self) {
        self.drain(RemovalCause::Invalidated, false);
    }

    /// Drain the cache and refuse further acquires (node shutdown)
    pub fn close(&self) {
        self.drain(RemovalCause::Closed, true);
    }

    fn drain(&self, cause: RemovalCause, close: bool) {
        let removed = {
            let mut inner = self.shared.inner.lock();
            if close {
                inner.closed = true;
            }
            let slots: Vec<Slot<K, V>> = inner.slots.drain().map(|(_, slot)| slot).collect();
            let mut removed = Vec::new();
            for slot in slots {
                if let Some(released) = self.shared.retire_locked(&mut inner, slot, cause) {
                    removed.push(released);
                }
            }
            removed
        };
        self.shared.notify_removed(removed);
    }

    /// Point-in-time usage snapshot
    pub fn usage(&self) -> CacheUsage {
        let inner = self.shared.inner.lock();
        CacheUsage {
            usage: inner.usage,
            active_usage: inner.active_usage,
        }
    }

    /// Configured soft capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Number of loaded, indexed entries
    pub fn len(&self) -> usize {
        self.shared
            .inner
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Check if no loaded entries are indexed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a loaded entry is indexed under `key`
    pub fn contains(&self, key: &K) -> bool {
        matches!(
            self.shared.inner.lock().slots.get(key),
            Some(Slot::Ready(_))
        )
    }

    /// Check if the cache has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.shared.stats
    }
}

/// Completes (or abandons) the single in-flight load for a key
struct LoadGuard<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
    key: K,
    id: u64,
    tx: Option<watch::Sender<LoadOutcome<K, V>>>,
    waiters: Arc<AtomicU64>,
}

impl<K: CacheKey, V: CacheValue> LoadGuard<K, V> {
    fn slot_is_ours(&self, inner: &Inner<K, V>) -> bool {
        matches!(inner.slots.get(&self.key), Some(Slot::Loading(slot)) if slot.id == self.id)
    }

    fn complete(mut self, result: Result<V>) -> Result<CacheHandle<K, V>> {
        let Some(tx) = self.tx.take() else {
            return Err(Error::internal("cache load completed twice"));
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                let reason = err.to_string();
                {
                    let mut inner = self.shared.inner.lock();
                    if self.slot_is_ours(&inner) {
                        inner.slots.remove(&self.key);
                    }
                    let _ = tx.send(Some(Err(reason.clone())));
                }
                self.shared
                    .stats
                    .load_failures
                    .fetch_add(1, Ordering::Relaxed);
                debug!(key = ?self.key, %reason, "cache load failed");
                return Err(Error::CacheLoad {
                    key: format!("{:?}", self.key),
                    reason,
                });
            }
        };

        let size = value.weight();
        let (entry, removed) = {
            let mut inner = self.shared.inner.lock();
            let waiters = self.waiters.load(Ordering::Acquire);
            let entry = Arc::new(Entry {
                key: self.key.clone(),
                value,
                size,
                refs: AtomicU64::new(1 + waiters),
                last_access: AtomicU64::new(self.shared.tick()),
                retired: AtomicBool::new(false),
            });

            inner.usage += size;
            inner.active_usage += size;

            if self.slot_is_ours(&inner) {
                inner
                    .slots
                    .insert(self.key.clone(), Slot::Ready(Arc::clone(&entry)));
            } else {
                // Invalidated while loading: hand it out, but never index it
                entry.retired.store(true, Ordering::Release);
            }

            let _ = tx.send(Some(Ok(Arc::clone(&entry))));
            let removed = self.shared.evict_locked(&mut inner);
            (entry, removed)
        };
        self.shared.notify_removed(removed);

        trace!(key = ?self.key, size, "cache entry loaded");
        Ok(CacheHandle {
            shared: Arc::clone(&self.shared),
            entry,
        })
    }
}

impl<K: CacheKey, V: CacheValue> Drop for LoadGuard<K, V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let mut inner = self.shared.inner.lock();
            if self.slot_is_ours(&inner) {
                inner.slots.remove(&self.key);
            }
            let _ = tx.send(Some(Err("loader abandoned".to_string())));
            self.shared
                .stats
                .load_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Returns a pre-counted reference if a waiting caller goes away
struct WaiterGuard<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
    rx: watch::Receiver<LoadOutcome<K, V>>,
    waiters: Arc<AtomicU64>,
    consumed: bool,
}

impl<K: CacheKey, V: CacheValue> Drop for WaiterGuard<K, V> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        let removed = {
            let mut inner = self.shared.inner.lock();
            let outcome = Option::clone(&self.rx.borrow());
            match outcome {
                Some(Ok(entry)) => self.shared.release_locked(&mut inner, &entry),
                Some(Err(_)) => Vec::new(),
                None => {
                    self.waiters.fetch_sub(1, Ordering::AcqRel);
                    Vec::new()
                }
            }
        };
        self.shared.notify_removed(removed);
    }
}

/// A counted reference to a cached resource. The entry cannot be evicted
/// while any handle to it exists.
pub struct CacheHandle<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
    entry: Arc<Entry<K, V>>,
}

impl<K: CacheKey, V: CacheValue> CacheHandle<K, V> {
    /// Key this handle was acquired under
    pub fn key(&self) -> &K {
        &self.entry.key
    }

    /// Size of the resource in bytes
    pub fn size(&self) -> u64 {
        self.entry.size
    }

    /// Current number of outstanding handles for this entry
    pub fn ref_count(&self) -> u64 {
        self.entry.refs.load(Ordering::Acquire)
    }
}

impl<K: CacheKey, V: CacheValue> Deref for CacheHandle<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.entry.value
    }
}

impl<K: CacheKey, V: CacheValue> Clone for CacheHandle<K, V> {
    fn clone(&self) -> Self {
        // Already non-zero, so no zero crossing and no lock
        self.entry.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<K: CacheKey, V: CacheValue> Drop for CacheHandle<K, V> {
    fn drop(&mut self) {
        self.shared.release(&self.entry);
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for CacheHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.entry.key)
            .field("size", &self.entry.size)
            .field("refs", &self.entry.refs.load(Ordering::Relaxed))
            .finish()
    }
}
