//! In-flight call registry: at most one outstanding transport call per key.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use shared::{Error, Result};
use std::hash::Hash;
use tokio::sync::watch;

type Outcome<V> = Option<Result<V>>;

/// Result of trying to register an in-flight call.
pub enum Slot<'a, K, V>
where
    K: Hash + Eq + Clone,
{
    /// We won the race and must make the call, then complete the ticket.
    Leader(PendingTicket<'a, K, V>),
    /// Another caller is already making it; wait for its result.
    Follower(Waiter<V>),
}

pub struct Singleflight<K, V>
where
    K: Hash + Eq + Clone,
{
    in_flight: DashMap<K, watch::Sender<Outcome<V>>>,
}

impl<K, V> Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Atomically join an existing call or register a new one.
    pub fn acquire(&self, key: &K) -> Slot<'_, K, V> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => Slot::Follower(Waiter {
                rx: entry.get().subscribe(),
            }),
            Entry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(None);
                entry.insert(tx);
                Slot::Leader(PendingTicket {
                    owner: self,
                    key: key.clone(),
                    completed: false,
                })
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but `check` runs while the key's
    /// shard is locked and can short-circuit before a new call is registered.
    pub fn acquire_unless<R>(
        &self,
        key: &K,
        check: impl FnOnce() -> Option<R>,
    ) -> std::result::Result<Slot<'_, K, V>, R> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(Slot::Follower(Waiter {
                rx: entry.get().subscribe(),
            })),
            Entry::Vacant(entry) => {
                if let Some(hit) = check() {
                    return Err(hit);
                }
                let (tx, _rx) = watch::channel(None);
                entry.insert(tx);
                Ok(Slot::Leader(PendingTicket {
                    owner: self,
                    key: key.clone(),
                    completed: false,
                }))
            }
        }
    }

    /// Attach to an in-flight call if there is one.
    pub fn join(&self, key: &K) -> Option<Waiter<V>> {
        self.in_flight.get(key).map(|tx| Waiter { rx: tx.subscribe() })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn finish(&self, key: &K, outcome: Outcome<V>) {
        if let Some((_, tx)) = self.in_flight.remove(key) {
            if outcome.is_some() {
                tx.send_replace(outcome);
            }
        }
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Handle held by the caller responsible for an in-flight call.
///
/// Dropping it without completing releases the key and wakes every waiter
/// with [`Error::Cancelled`], so a cancelled or panicking leader never
/// strands its followers.
pub struct PendingTicket<'a, K, V>
where
    K: Hash + Eq + Clone,
{
    owner: &'a Singleflight<K, V>,
    key: K,
    completed: bool,
}

impl<K, V> PendingTicket<'_, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the key and hand `outcome` to every waiter.
    pub fn complete(mut self, outcome: Result<V>) {
        self.owner.finish(&self.key, Some(outcome));
        self.completed = true;
    }

    /// Release the key without an outcome; waiters retry on their own.
    pub fn abandon(mut self) {
        self.owner.finish(&self.key, None);
        self.completed = true;
    }
}

impl<K, V> Drop for PendingTicket<'_, K, V>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.owner.in_flight.remove(&self.key);
        }
    }
}

/// Handle held by a caller waiting on someone else's in-flight call.
pub struct Waiter<V> {
    rx: watch::Receiver<Outcome<V>>,
}

impl<V: Clone> Waiter<V> {
    /// Wait for the leader's outcome. Holds no cache lock while waiting.
    pub async fn wait(mut self) -> Result<V> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| Err(Error::Internal("empty in-flight outcome".to_string()))),
            Err(_) => Err(Error::Cancelled(
                "in-flight call released without a result".to_string(),
            )),
        }
    }
}
