//! Per-key serialization of async operations.
//!
//! Operations sharing a key run one at a time, in the order `run` was called;
//! operations on different keys don't wait for each other. A key's entry
//! exists only while some operation holds or awaits it.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Resolves once every operation queued so far on a key has finished.
type Tail = Shared<BoxFuture<'static, ()>>;

struct QueueEntry {
    tail: Tail,
    holders: usize,
}

#[derive(Clone)]
pub struct KeyedMutexQueue<K> {
    entries: Arc<Mutex<HashMap<K, QueueEntry>>>,
}

impl<K> Default for KeyedMutexQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedMutexQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue `operation` behind every operation already queued on `key`.
    ///
    /// The place in line is taken by this call, not by the first poll of the
    /// returned future. The queue advances however the operation ends:
    /// success, error, panic, or the returned future being dropped.
    pub fn run<F, Fut, T>(&self, key: K, operation: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (previous, finished, release) = self.enqueue(key);
        async move {
            let _release = release;
            let _finished = finished;
            previous.await;
            operation().await
        }
    }

    /// Number of keys with an active or waiting operation.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn enqueue(&self, key: K) -> (Tail, oneshot::Sender<()>, Release<K>) {
        let (finished, finished_rx) = oneshot::channel::<()>();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| QueueEntry {
            tail: future::ready(()).boxed().shared(),
            holders: 0,
        });

        // The next operation waits for everything before us, then for us.
        // Dropping the sender (normally or not) counts as finished.
        let previous = entry.tail.clone();
        let before_us = previous.clone();
        entry.tail = async move {
            before_us.await;
            let _ = finished_rx.await;
        }
        .boxed()
        .shared();
        entry.holders += 1;
        drop(entries);

        let release = Release {
            entries: Arc::clone(&self.entries),
            key,
        };
        (previous, finished, release)
    }
}

/// Drops one hold on a key, removing the entry with the last one.
struct Release<K: Eq + Hash> {
    entries: Arc<Mutex<HashMap<K, QueueEntry>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for Release<K> {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(&self.key);
            }
        }
    }
}
