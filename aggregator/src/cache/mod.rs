//! Fixed-capacity aggregation cache shared by the check, quota and report
//! aggregators.
//!
//! # Architecture
//!
//! Two concurrent maps keyed by fingerprint:
//! - `entries`: the cached value plus its bookkeeping timestamps.
//! - `pending`: the [`Singleflight`] registry of in-flight transport calls.
//!
//! Both are `DashMap`s, so locking is per shard and callers working on
//! unrelated fingerprints never contend on a cache-wide lock. The one
//! exception is admission of a *new* key, which goes through a small mutex
//! so that the capacity check and the insert cannot interleave with another
//! admission.
//!
//! # Lock ordering
//!
//! `pending` shard → `entries` shard. Nothing takes a `pending` lock while
//! holding an `entries` guard.
//!
//! # Eviction
//!
//! When full, admitting a new key evicts the entry with the oldest refresh.
//! Entries with a call in flight are only chosen when nothing colder exists.
//! A capacity of zero disables the cache entirely.

pub mod singleflight;

pub use singleflight::{PendingTicket, Singleflight, Slot, Waiter};

use dashmap::DashMap;
use parking_lot::Mutex;
use shared::Result;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// When an entry stops being served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    /// Entries are never served stale; they leave only via eviction or drain.
    Never,
    /// Stale once this long has passed since the last successful refresh.
    AfterRefresh(Duration),
    /// Stale once this long has passed since the last access.
    AfterIdle(Duration),
}

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub refreshed_at: Instant,
    pub last_access: Instant,
    refresh_seq: u64,
}

impl<V> CacheEntry<V> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refreshed_at)
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}

/// Outcome of a lock-free lookup.
pub enum Probe<R, V> {
    /// A fresh entry served the call.
    Hit(R),
    /// Nothing usable is cached and nobody is fetching it.
    Miss,
    /// Another caller's transport call for this key is outstanding.
    InFlight(Waiter<V>),
}

/// Outcome of trying to become the caller responsible for a key.
pub enum Admission<'a, R, K, V>
where
    K: Hash + Eq + Clone,
{
    /// An entry became usable between the probe and the acquire.
    Hit(R),
    Leader(PendingTicket<'a, K, V>),
    Follower(Waiter<V>),
}

pub struct AggregationCache<K, V>
where
    K: Hash + Eq + Clone,
{
    name: &'static str,
    capacity: usize,
    expiry: Expiry,
    entries: DashMap<K, CacheEntry<V>>,
    pending: Singleflight<K, V>,
    admission: Mutex<()>,
    refresh_seq: AtomicU64,
}

impl<K, V> AggregationCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    pub fn new(name: &'static str, capacity: usize, expiry: Expiry) -> Self {
        Self {
            name,
            capacity,
            expiry,
            entries: DashMap::with_capacity(capacity),
            pending: Singleflight::new(),
            admission: Mutex::new(()),
            refresh_seq: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains(key)
    }

    pub fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.expiry {
            Expiry::Never => false,
            Expiry::AfterRefresh(limit) => entry.age(now) >= limit,
            Expiry::AfterIdle(limit) => entry.idle(now) >= limit,
        }
    }

    /// Look up `key` and let `serve` decide whether the fresh entry answers
    /// the call. `serve` returning `None` makes the entry count as a miss
    /// (used when a cached allowance is exhausted).
    pub fn probe<R>(
        &self,
        key: &K,
        now: Instant,
        serve: impl FnOnce(&mut CacheEntry<V>) -> Option<R>,
    ) -> Probe<R, V> {
        if !self.is_enabled() {
            return Probe::Miss;
        }
        if let Some(hit) = self.serve_fresh(key, now, serve) {
            return Probe::Hit(hit);
        }
        match self.pending.join(key) {
            Some(waiter) => Probe::InFlight(waiter),
            None => Probe::Miss,
        }
    }

    /// Become the caller responsible for `key`, or attach to whoever is.
    ///
    /// `serve` is consulted again while the key is locked: a leader commits
    /// its entry before releasing the key, so a caller that lost that race
    /// gets the fresh value instead of issuing a second call.
    pub fn begin_pending<R>(
        &self,
        key: &K,
        now: Instant,
        serve: impl FnOnce(&mut CacheEntry<V>) -> Option<R>,
    ) -> Admission<'_, R, K, V> {
        match self
            .pending
            .acquire_unless(key, || self.serve_fresh(key, now, serve))
        {
            Ok(Slot::Leader(ticket)) => Admission::Leader(ticket),
            Ok(Slot::Follower(waiter)) => Admission::Follower(waiter),
            Err(hit) => Admission::Hit(hit),
        }
    }

    /// Start a background refresh of `key`. `None` if a call is already
    /// outstanding for it; a flush never doubles up on a pending key.
    pub fn begin_refresh(&self, key: &K) -> Option<PendingTicket<'_, K, V>> {
        match self.pending.acquire(key) {
            Slot::Leader(ticket) => Some(ticket),
            Slot::Follower(_) => None,
        }
    }

    /// Finish the call behind `ticket`: on success store the value (replacing
    /// any previous one) and wake every waiter with the same outcome.
    pub fn commit(&self, ticket: PendingTicket<'_, K, V>, outcome: Result<V>, now: Instant) -> Result<V> {
        self.commit_with(ticket, outcome, now, |current, fresh| *current = fresh)
    }

    /// Like [`commit`](Self::commit), folding the fresh value into an existing
    /// entry with `merge`. Waiters receive the stored value.
    pub fn commit_with(
        &self,
        ticket: PendingTicket<'_, K, V>,
        outcome: Result<V>,
        now: Instant,
        merge: impl FnOnce(&mut V, V),
    ) -> Result<V> {
        let outcome = match outcome {
            Ok(value) if self.is_enabled() => {
                Ok(self.store(ticket.key().clone(), value, now, merge))
            }
            other => other,
        };
        ticket.complete(outcome.clone());
        outcome
    }

    /// Insert `value` under `key`, or fold it into the existing entry. Used by
    /// aggregation that never goes through a transport round trip. Returns
    /// the entry evicted to make room, if any.
    pub fn merge_or_insert(
        &self,
        key: K,
        value: V,
        now: Instant,
        merge: impl FnOnce(&mut V, V),
    ) -> Option<(K, V)> {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            merge(&mut entry.value, value);
            entry.last_access = now;
            return None;
        }
        let (evicted, ()) = self.admit(key, value, now, merge, false, |_| ());
        evicted
    }

    /// Run `f` on the entry for `key` if present.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut CacheEntry<V>) -> R) -> Option<R> {
        self.entries.get_mut(key).map(|mut entry| f(&mut entry))
    }

    pub fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Remove `key` only if `predicate` holds for its value.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, entry| predicate(&entry.value))
            .map(|(_, entry)| entry.value)
    }

    /// Remove and return every entry present when the drain started.
    pub fn drain(&self) -> Vec<(K, CacheEntry<V>)> {
        let keys: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Keys whose last refresh is at least `interval` old and that have no
    /// call in flight. Read-only snapshot.
    pub fn due_for_flush(&self, now: Instant, interval: Duration) -> Vec<K> {
        let due: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| entry.age(now) >= interval)
            .map(|entry| entry.key().clone())
            .collect();
        due.into_iter()
            .filter(|key| !self.pending.contains(key))
            .collect()
    }

    /// Keys that are logically present but no longer served.
    pub fn expired_keys(&self, now: Instant) -> Vec<K> {
        self.entries
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove every expired entry that has no call in flight. The expiry is
    /// re-tested under the shard lock, so an entry refreshed after the scan
    /// survives.
    pub fn remove_expired(&self, now: Instant) -> Vec<(K, V)> {
        self.expired_keys(now)
            .into_iter()
            .filter(|key| !self.pending.contains(key))
            .filter_map(|key| {
                self.entries
                    .remove_if(&key, |_, entry| self.is_expired(entry, now))
            })
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    /// Snapshot of one entry, for inspection.
    pub fn get(&self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn serve_fresh<R>(
        &self,
        key: &K,
        now: Instant,
        serve: impl FnOnce(&mut CacheEntry<V>) -> Option<R>,
    ) -> Option<R> {
        let mut entry = self.entries.get_mut(key)?;
        if self.is_expired(&entry, now) {
            return None;
        }
        let hit = serve(&mut entry)?;
        entry.last_access = now;
        Some(hit)
    }

    fn next_seq(&self) -> u64 {
        self.refresh_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn store(&self, key: K, value: V, now: Instant, merge: impl FnOnce(&mut V, V)) -> V {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            merge(&mut entry.value, value);
            entry.refreshed_at = now;
            entry.last_access = now;
            entry.refresh_seq = self.next_seq();
            return entry.value.clone();
        }
        let (evicted, stored) = self.admit(key, value, now, merge, true, V::clone);
        if let Some((evicted_key, _)) = evicted {
            debug!(cache = self.name, key = ?evicted_key, "evicted least recently refreshed entry");
        }
        stored
    }

    /// Insert a new key, evicting first if full. Serialized by the admission
    /// lock so `len <= capacity` holds across concurrent admissions.
    fn admit<R>(
        &self,
        key: K,
        value: V,
        now: Instant,
        merge: impl FnOnce(&mut V, V),
        refreshed: bool,
        inspect: impl FnOnce(&V) -> R,
    ) -> (Option<(K, V)>, R) {
        let _admission = self.admission.lock();

        // Another admission may have won while we waited for the lock.
        if let Some(mut entry) = self.entries.get_mut(&key) {
            merge(&mut entry.value, value);
            entry.last_access = now;
            if refreshed {
                entry.refreshed_at = now;
                entry.refresh_seq = self.next_seq();
            }
            return (None, inspect(&entry.value));
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_coldest()
        } else {
            None
        };

        let inspected = inspect(&value);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                refreshed_at: now,
                last_access: now,
                refresh_seq: self.next_seq(),
            },
        );
        (evicted, inspected)
    }

    fn evict_coldest(&self) -> Option<(K, V)> {
        let mut candidates: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|entry| (entry.refresh_seq, entry.key().clone()))
            .collect();
        candidates.sort_unstable_by_key(|(seq, _)| *seq);

        let victim = candidates
            .iter()
            .find(|(_, key)| !self.pending.contains(key))
            .or_else(|| candidates.first())
            .map(|(_, key)| key.clone())?;

        self.entries
            .remove(&victim)
            .map(|(key, entry)| (key, entry.value))
    }
}

impl<K, V> Debug for AggregationCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("expiry", &self.expiry)
            .field("entries", &self.entries.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Error;

    fn cache(capacity: usize) -> AggregationCache<&'static str, u32> {
        AggregationCache::new("test", capacity, Expiry::AfterRefresh(Duration::from_millis(100)))
    }

    fn fill(cache: &AggregationCache<&'static str, u32>, key: &'static str, value: u32) {
        let now = Instant::now();
        match cache.begin_pending(&key, now, |_| None::<u32>) {
            Admission::Leader(ticket) => {
                cache.commit(ticket, Ok(value), now).unwrap();
            }
            _ => panic!("expected to lead {key}"),
        }
    }

    fn hit(cache: &AggregationCache<&'static str, u32>, key: &'static str) -> Option<u32> {
        match cache.probe(&key, Instant::now(), |entry| Some(entry.value)) {
            Probe::Hit(value) => Some(value),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_miss_then_hit_after_commit() {
        let cache = cache(10);
        assert!(hit(&cache, "a").is_none());
        fill(&cache, "a", 1);
        assert_eq!(hit(&cache, "a"), Some(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss_but_still_occupies_a_slot() {
        let cache = cache(10);
        fill(&cache, "a", 1);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(hit(&cache, "a").is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.expired_keys(Instant::now()), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_probe_sees_in_flight_call() {
        let cache = cache(10);
        let now = Instant::now();
        let Admission::Leader(ticket) = cache.begin_pending(&"a", now, |_| None::<u32>) else {
            panic!("first caller must lead");
        };
        let Probe::InFlight(waiter) = cache.probe(&"a", now, |e| Some(e.value)) else {
            panic!("second caller must see the in-flight call");
        };
        assert!(matches!(
            cache.begin_pending(&"a", now, |_| None::<u32>),
            Admission::Follower(_)
        ));
        cache.commit(ticket, Ok(9), now).unwrap();
        assert_eq!(waiter.wait().await.unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_pending_serves_value_committed_after_probe() {
        let cache = cache(10);
        fill(&cache, "a", 3);
        match cache.begin_pending(&"a", Instant::now(), |e| Some(e.value)) {
            Admission::Hit(value) => assert_eq!(value, 3),
            _ => panic!("fresh entry must be served under the key lock"),
        }
        assert_eq!(cache.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_leaves_previous_value() {
        let cache = cache(10);
        fill(&cache, "a", 1);
        let ticket = cache.begin_refresh(&"a").unwrap();
        let result = cache.commit(ticket, Err(Error::transport("down")), Instant::now());
        assert!(result.is_err());
        assert_eq!(cache.get(&"a").unwrap().value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_refreshed() {
        let cache = cache(3);
        fill(&cache, "a", 1);
        fill(&cache, "b", 2);
        fill(&cache, "c", 3);

        // refreshing "a" makes "b" the coldest
        let ticket = cache.begin_refresh(&"a").unwrap();
        cache.commit(ticket, Ok(10), Instant::now()).unwrap();

        fill(&cache, "d", 4);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
        assert!(cache.contains(&"d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_skips_entry_being_refreshed() {
        let cache = cache(2);
        fill(&cache, "a", 1);
        fill(&cache, "b", 2);
        let _refreshing = cache.begin_refresh(&"a").unwrap();
        fill(&cache, "c", 3);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let cache: AggregationCache<u32, u32> =
                AggregationCache::new("bounded", 8, Expiry::Never);
            for i in 0..100u32 {
                cache.merge_or_insert(i, i, Instant::now(), |a, b| *a += b);
                assert!(cache.len() <= 8);
            }
            // the eight most recent keys survive
            for i in 92..100u32 {
                assert!(cache.contains(&i), "key {i} should have survived");
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cache_never_hits() {
        let cache = cache(0);
        let now = Instant::now();
        let Admission::Leader(ticket) = cache.begin_pending(&"a", now, |_| None::<u32>) else {
            panic!("disabled cache still hands out leadership");
        };
        assert_eq!(cache.commit(ticket, Ok(1), now).unwrap(), 1);
        assert!(cache.is_empty());
        assert!(hit(&cache, "a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_for_flush_skips_pending_and_young_entries() {
        let cache = cache(10);
        fill(&cache, "a", 1);
        fill(&cache, "b", 2);
        tokio::time::advance(Duration::from_millis(50)).await;
        fill(&cache, "c", 3);
        let _refreshing = cache.begin_refresh(&"b").unwrap();

        let mut due = cache.due_for_flush(Instant::now(), Duration::from_millis(50));
        due.sort();
        assert_eq!(due, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_or_insert_and_drain() {
        let cache: AggregationCache<&str, u32> =
            AggregationCache::new("report", 10, Expiry::Never);
        let now = Instant::now();
        cache.merge_or_insert("a", 1, now, |acc, v| *acc += v);
        cache.merge_or_insert("a", 2, now, |acc, v| *acc += v);
        cache.merge_or_insert("b", 5, now, |acc, v| *acc += v);

        let mut drained: Vec<(&str, u32)> = cache
            .drain()
            .into_iter()
            .map(|(k, e)| (k, e.value))
            .collect();
        drained.sort();
        assert_eq!(drained, vec![("a", 3), ("b", 5)]);
        assert!(cache.is_empty());
    }
}
