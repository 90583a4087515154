//! Reference-counted resource sharing
//!
//! Many independent observers share one underlying watch on the same remote
//! object. The registry hands out [`WatchHandle`]s that alias a single
//! shared resource; the resource is built exactly once no matter how many
//! concurrent `get_or_create` calls race for the same key, and torn down
//! exactly once when the last handle is released.
//!
//! Counter mutation and map removal happen under one lock: a release that
//! observes the counter hitting zero re-checks, still under the lock, that
//! the map entry is the same resource before removing it, so a racing
//! acquire can neither resurrect a destroyed resource nor be handed a
//! handle to one.


use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::Result;

/// Teardown hook of a shared resource. Invoked exactly once, after the
/// resource has been removed from the registry. Must be idempotent and
/// non-blocking; remote cleanup is expected to be deferred internally.
pub trait Teardown: Send + Sync + 'static {
    fn teardown(&self);
}

enum Entry<T> {
    /// A factory call for this key is in flight; waiters park on the notify.
    Pending(Arc<Notify>),
    Ready { resource: Arc<T>, refs: usize },
}

struct RegistryInner<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
}

/// Keyed registry of shared, ref-counted resources.
pub struct SharedRegistry<K, T> {
    inner: Arc<RegistryInner<K, T>>,
}

impl<K, T> Clone for SharedRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> SharedRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Teardown,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Return a handle to the resource under `key`, building it via
    /// `factory` if no live resource exists. Concurrent calls for the same
    /// key invoke the factory exactly once; the losers wait and alias the
    /// winner's resource. A factory failure propagates to its caller and
    /// leaves nothing registered (waiters retry, which may invoke the
    /// factory again).
    pub async fn get_or_create<F, Fut>(&self, key: K, factory: F) -> Result<WatchHandle<K, T>>
    where
        F: FnOnce(K) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        // The factory is FnOnce; after the first attempt the loop can only
        // wait on someone else's pending build or alias a ready resource.
        let mut factory = Some(factory);
        loop {
            let waiter = {
                let mut entries = self.inner.entries.lock();
                match entries.get_mut(&key) {
                    Some(Entry::Ready { resource, refs }) => {
                        *refs += 1;
                        return Ok(WatchHandle::new(
                            key.clone(),
                            resource.clone(),
                            self.inner.clone(),
                        ));
                    }
                    Some(Entry::Pending(notify)) => notify.clone(),
                    None => {
                        let Some(factory) = factory.take() else {
                            // Only reachable if the winner's resource was
                            // already released again; treat as a fresh miss
                            // the caller retries.
                            continue;
                        };
                        entries.insert(key.clone(), Entry::Pending(Arc::new(Notify::new())));
                        drop(entries);
                        return self.build(key, factory).await;
                    }
                }
            };
            // Register interest before re-checking, so a wakeup between the
            // check and the await is not lost.
            let notified = waiter.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let still_pending = {
                let entries = self.inner.entries.lock();
                matches!(entries.get(&key), Some(Entry::Pending(_)))
            };
            if still_pending {
                notified.await;
            }
        }
    }

    async fn build<F, Fut>(&self, key: K, factory: F) -> Result<WatchHandle<K, T>>
    where
        F: FnOnce(K) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let built = factory(key.clone()).await;
        let mut entries = self.inner.entries.lock();
        let pending = entries.remove(&key);
        let result = match built {
            Ok(value) => {
                let resource = Arc::new(value);
                entries.insert(
                    key.clone(),
                    Entry::Ready {
                        resource: resource.clone(),
                        refs: 1,
                    },
                );
                Ok(WatchHandle::new(key, resource, self.inner.clone()))
            }
            Err(e) => Err(e),
        };
        drop(entries);
        if let Some(Entry::Pending(notify)) = pending {
            notify.notify_waiters();
        }
        result
    }

    /// Handle to an already live resource, or `None` if the key is not
    /// registered (a pending build does not count as live).
    pub fn try_get_existing(&self, key: &K) -> Option<WatchHandle<K, T>> {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(key) {
            Some(Entry::Ready { resource, refs }) => {
                *refs += 1;
                Some(WatchHandle::new(
                    key.clone(),
                    resource.clone(),
                    self.inner.clone(),
                ))
            }
            _ => None,
        }
    }

    /// Keys of all live (ready) resources.
    pub fn live_keys(&self) -> Vec<K> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter_map(|(key, entry)| {
                matches!(entry, Entry::Ready { .. }).then(|| key.clone())
            })
            .collect()
    }

    /// Number of live (ready) resources.
    pub fn live_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|e| matches!(e, Entry::Ready { .. }))
            .count()
    }

    /// Forcibly tear down every live resource regardless of its counter.
    /// Outstanding handles become inert: their release finds no entry and
    /// does nothing, so nothing is torn down twice.
    pub fn dispose_all(&self) {
        let drained: Vec<(K, Entry<T>)> = {
            let mut entries = self.inner.entries.lock();
            entries.drain().collect()
        };
        for (_, entry) in drained {
            match entry {
                Entry::Ready { resource, .. } => resource.teardown(),
                Entry::Pending(notify) => notify.notify_waiters(),
            }
        }
    }
}

impl<K, T> Default for SharedRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Teardown,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A counted reference to a shared resource. Owned by exactly one
/// subscriber; dropping it releases the reference, and releasing the last
/// one tears the resource down.
pub struct WatchHandle<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Teardown,
{
    key: K,
    resource: Arc<T>,
    registry: Arc<RegistryInner<K, T>>,
}

impl<K, T> WatchHandle<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Teardown,
{
    fn new(key: K, resource: Arc<T>, registry: Arc<RegistryInner<K, T>>) -> Self {
        Self {
            key,
            resource,
            registry,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether two handles alias the same underlying resource.
    pub fn aliases(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
    }
}

impl<K, T> Deref for WatchHandle<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Teardown,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<K, T> Drop for WatchHandle<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Teardown,
{
    fn drop(&mut self) {
        let retired = {
            let mut entries = self.registry.entries.lock();
            match entries.get_mut(&self.key) {
                Some(Entry::Ready { resource, refs })
                    if Arc::ptr_eq(resource, &self.resource) =>
                {
                    *refs -= 1;
                    if *refs == 0 {
                        entries.remove(&self.key);
                        true
                    } else {
                        false
                    }
                }
                // Entry already replaced or force-disposed; nothing to do.
                _ => false,
            }
        };
        if retired {
            debug!("last reference released, tearing down shared resource");
            self.resource.teardown();
        }
    }
}
