//! Deadline scheduler
//!
//! [`QueueRunner`] holds `(deadline, key)` pairs and hands each key to a
//! drain callback once its wall-clock deadline has passed. Re-enqueueing a
//! key replaces its pending deadline; superseded heap entries are discarded
//! lazily when they surface. Drivers: detached-session expiry and
//! retained-message TTLs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::trace;

/// Deadline-ordered queue of opaque keys
pub struct QueueRunner<K> {
    inner: Mutex<Inner<K>>,
    /// Wakes the run loop when an earlier deadline arrives
    notify: Notify,
}

struct Inner<K> {
    /// Authoritative deadline per key; heap entries not matching it are stale
    deadlines: AHashMap<K, SystemTime>,
    heap: BinaryHeap<Reverse<(SystemTime, K)>>,
}

impl<K> QueueRunner<K>
where
    K: Ord + Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                deadlines: AHashMap::new(),
                heap: BinaryHeap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Register a key to be drained no earlier than `deadline`.
    ///
    /// A key already pending is coalesced: the latest enqueued deadline wins.
    pub fn enqueue(&self, deadline: SystemTime, key: K) {
        let mut inner = self.inner.lock();
        inner.deadlines.insert(key.clone(), deadline);
        inner.heap.push(Reverse((deadline, key)));
        drop(inner);
        self.notify.notify_one();
    }

    /// Number of keys currently pending
    pub fn len(&self) -> usize {
        self.inner.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().deadlines.is_empty()
    }

    /// Drain loop: sleeps until the next deadline, then calls `drain` with
    /// each due key, serially. `drain` may re-enqueue. Terminates when the
    /// shutdown channel fires, after any in-flight drain call returns.
    pub async fn run<F>(&self, mut drain: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: FnMut(K),
    {
        loop {
            let mut due = Vec::new();
            let next_deadline = self.pop_due(&mut due);

            for key in due {
                drain(key);
            }

            let wait = next_deadline
                .map(|dl| dl.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO));

            tokio::select! {
                biased;

                result = shutdown.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            trace!("scheduler shutting down");
                            break;
                        }
                    }
                }
                _ = self.notify.notified() => {}
                _ = sleep_or_park(wait) => {}
            }
        }
    }

    /// Pop every due key under the lock; returns the earliest pending
    /// deadline that has not yet passed, if any.
    fn pop_due(&self, due: &mut Vec<K>) -> Option<SystemTime> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();

        loop {
            let head = match inner.heap.peek() {
                Some(Reverse((deadline, key))) => (*deadline, key.clone()),
                None => return None,
            };
            let (deadline, key) = head;

            if inner.deadlines.get(&key) != Some(&deadline) {
                // Superseded by a later enqueue (or already drained)
                inner.heap.pop();
                continue;
            }

            if deadline <= now {
                inner.heap.pop();
                inner.deadlines.remove(&key);
                due.push(key);
            } else {
                return Some(deadline);
            }
        }
    }
}

impl<K> Default for QueueRunner<K>
where
    K: Ord + Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `wait`, or forever when the queue is empty (a new enqueue wakes
/// the loop through `notify`).
async fn sleep_or_park(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
