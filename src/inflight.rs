//! Deduplicated per-endpoint initialisation
//!
//! Both registries cache the *in-flight* result keyed by endpoint, not just
//! the finished value: concurrent callers for the same endpoint await one
//! shared future and observe the same success or failure.

use crate::connection::managed::lock;
use crate::error::QueueResult;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub(crate) type Pending<T> = Shared<BoxFuture<'static, QueueResult<T>>>;

struct Entry<T: Clone> {
    attempt: u64,
    pending: Pending<T>,
}

type Entries<T> = Mutex<HashMap<String, Entry<T>>>;

/// Endpoint-keyed map of shared, possibly still running, initialisations
pub(crate) struct InflightMap<T: Clone> {
    entries: Arc<Entries<T>>,
    next_attempt: AtomicU64,
}

/// Handle that removes one specific entry, if it is still the current one
pub(crate) struct Eviction<T: Clone> {
    entries: Weak<Entries<T>>,
    endpoint: String,
    attempt: u64,
}

impl<T: Clone> Clone for Eviction<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            endpoint: self.endpoint.clone(),
            attempt: self.attempt,
        }
    }
}

impl<T: Clone> Eviction<T> {
    pub(crate) fn evict(&self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = lock(&entries);
        if entries
            .get(&self.endpoint)
            .is_some_and(|entry| entry.attempt == self.attempt)
        {
            entries.remove(&self.endpoint);
        }
    }
}

impl<T> InflightMap<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_attempt: AtomicU64::new(0),
        }
    }

    /// Return the cached initialisation for `endpoint`, or start a new one.
    ///
    /// A cached entry is replaced when it resolved to an error or to a value
    /// `is_defunct` rejects. A failed initialisation evicts itself so the
    /// next caller starts over, while callers already waiting on it still see
    /// the failure.
    pub(crate) fn get_or_start<F, Fut>(
        &self,
        endpoint: &str,
        is_defunct: impl Fn(&T) -> bool,
        start: F,
    ) -> Pending<T>
    where
        F: FnOnce(Eviction<T>) -> Fut,
        Fut: Future<Output = QueueResult<T>> + Send + 'static,
    {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(endpoint) {
            let defunct = match entry.pending.peek() {
                Some(Ok(value)) => is_defunct(value),
                Some(Err(_)) => true,
                None => false,
            };
            if !defunct {
                return entry.pending.clone();
            }
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let eviction = Eviction {
            entries: Arc::downgrade(&self.entries),
            endpoint: endpoint.to_string(),
            attempt,
        };
        let on_error = eviction.clone();
        let init = start(eviction);
        let pending = async move {
            let result = init.await;
            if result.is_err() {
                on_error.evict();
            }
            result
        }
        .boxed()
        .shared();

        entries.insert(
            endpoint.to_string(),
            Entry {
                attempt,
                pending: pending.clone(),
            },
        );
        pending
    }

    pub(crate) fn get(&self, endpoint: &str) -> Option<Pending<T>> {
        lock(&self.entries)
            .get(endpoint)
            .map(|entry| entry.pending.clone())
    }

    pub(crate) fn remove(&self, endpoint: &str) -> Option<Pending<T>> {
        lock(&self.entries)
            .remove(endpoint)
            .map(|entry| entry.pending)
    }

    pub(crate) fn contains(&self, endpoint: &str) -> bool {
        lock(&self.entries).contains_key(endpoint)
    }

    pub(crate) fn endpoints(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}
