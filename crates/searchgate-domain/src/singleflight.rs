//! Singleflight coalescing for concurrent lookups of the same key.
//!
//! The first caller for a key becomes the leader and runs the operation;
//! callers arriving while it runs become followers and receive a clone of
//! the leader's outcome over a broadcast channel. The registry entry is
//! cleared before the outcome is broadcast, so a follower can only have
//! joined while the leader was still running and always sees the value.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::broadcast;

/// Result of trying to acquire a singleflight slot.
pub enum SingleflightSlot<V> {
    /// We won the race and should execute the operation.
    Leader(broadcast::Sender<V>),
    /// Another task is executing; wait for its result.
    Follower(broadcast::Receiver<V>),
}

/// Registry of in-flight operations keyed by `K`, each producing a `V`.
pub struct Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    in_flight: DashMap<K, broadcast::Sender<V>>,
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

    /// Atomically registers as leader for `key` or subscribes as follower.
    ///
    /// The check and the insert happen under the same shard lock, so two
    /// callers can never both become leader for one key.
    pub fn acquire(&self, key: K) -> SingleflightSlot<V> {
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => SingleflightSlot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                SingleflightSlot::Leader(tx)
            }
        }
    }

    /// Remove a completed in-flight entry.
    pub fn complete(&self, key: &K) {
        self.in_flight.remove(key);
    }

    /// Number of keys with an operation in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs `work` once per key across all concurrent callers.
    ///
    /// Returns the outcome and whether it was shared from another caller's
    /// execution. If the leader is dropped before finishing, its followers
    /// race again and one of them runs its own `work`.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let tx = loop {
            match self.acquire(key.clone()) {
                SingleflightSlot::Leader(tx) => break tx,
                SingleflightSlot::Follower(mut rx) => match rx.recv().await {
                    Ok(value) => return (value, true),
                    // Leader dropped without a result; race to take over.
                    Err(_) => continue,
                },
            }
        };

        let guard = SingleflightGuard::new(self, key);
        let value = work().await;
        guard.finish(&tx, value.clone());
        (value, false)
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

/// RAII guard that clears the registry entry when the leader goes away.
///
/// If the leader's future is dropped mid-flight the entry is removed and the
/// last sender with it, which wakes every follower with a closed channel.
pub struct SingleflightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    singleflight: &'a Singleflight<K, V>,
    key: K,
    completed: bool,
}

impl<'a, K, V> SingleflightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(singleflight: &'a Singleflight<K, V>, key: K) -> Self {
        Self {
            singleflight,
            key,
            completed: false,
        }
    }

    /// Clears the entry, then broadcasts `value` to every follower.
    pub fn finish(mut self, tx: &broadcast::Sender<V>, value: V) {
        self.singleflight.complete(&self.key);
        self.completed = true;
        // No receivers simply means nobody joined.
        let _ = tx.send(value);
    }
}

impl<K, V> Drop for SingleflightGuard<'_, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.singleflight.complete(&self.key);
        }
    }
}
