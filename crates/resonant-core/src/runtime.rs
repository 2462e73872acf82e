#![forbid(unsafe_code)]

//! The runtime: owned state shared by observation, watching, and caching.
//!
//! A [`Runtime`] holds every table the engine needs: the proxy table, the
//! watcher registry, the cycle guard for the broadcast in progress, the
//! instance cache, pending finalizers, and the reclaim queue. Nothing is a
//! process-wide singleton; two runtimes never see each other's watchers or
//! instances.
//!
//! `Runtime` is single-threaded (`Rc` inside) and cheap to clone.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet};
use tracing::{debug, trace};

use crate::cache::InstanceCache;
use crate::object::{ObjectId, ObjectKind, ReclaimQueue};
use crate::observe::ProxyTable;
use crate::registry::{ChangeEvent, WatcherRegistry};
use crate::value::PathDisplay;

/// Configuration for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Drain the reclaim queue at the start of every factory call.
    pub reclaim_on_provide: bool,
    /// Object kinds passed through `observe` unwrapped.
    pub unsafe_kinds: Vec<ObjectKind>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reclaim_on_provide: true,
            unsafe_kinds: ObjectKind::UNSAFE_TO_PROXY.to_vec(),
        }
    }
}

impl RuntimeConfig {
    /// Toggle draining the reclaim queue on every factory call.
    #[must_use]
    pub fn with_reclaim_on_provide(mut self, enabled: bool) -> Self {
        self.reclaim_on_provide = enabled;
        self
    }

    /// Replace the set of kinds that are never wrapped.
    #[must_use]
    pub fn with_unsafe_kinds(mut self, kinds: impl IntoIterator<Item = ObjectKind>) -> Self {
        self.unsafe_kinds = kinds.into_iter().collect();
        self
    }
}

/// Snapshot of the runtime's table sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Raw objects with live proxy state.
    pub proxies: usize,
    /// Raw objects with at least one watcher.
    pub watched_objects: usize,
    /// Watcher registrations, internal child watchers included.
    pub watchers: usize,
    /// Live canonical instances.
    pub cached_instances: usize,
    /// Nodes in the instance cache tries, class roots included.
    pub trie_nodes: usize,
    /// Registered finalization callbacks that have not fired.
    pub pending_finalizers: usize,
    /// Dropped objects waiting for [`Runtime::reclaim`].
    pub pending_reclaims: usize,
}

pub(crate) type Finalizer = Box<dyn FnOnce()>;

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) proxies: RefCell<ProxyTable>,
    pub(crate) watchers: RefCell<WatcherRegistry>,
    /// Objects already dispatched during the current top-level broadcast.
    triggering: RefCell<Option<AHashSet<ObjectId>>>,
    pub(crate) cache: RefCell<InstanceCache>,
    pub(crate) finalizers: RefCell<AHashMap<ObjectId, Finalizer>>,
    pub(crate) reclaim_queue: Rc<ReclaimQueue>,
}

impl RuntimeInner {
    /// Dispatches a fresh, independently guarded broadcast.
    pub(crate) fn broadcast(&self, target: ObjectId, event: &ChangeEvent) {
        let _scope = GuardScope::enter(&self.triggering);
        trace!(object = %target, path = %PathDisplay(&event.path), "broadcast");
        self.trigger(target, event);
    }

    /// Dispatches to `target`'s watchers unless `target` was already reached
    /// by the broadcast in progress.
    pub(crate) fn trigger(&self, target: ObjectId, event: &ChangeEvent) {
        if let Some(active) = self.triggering.borrow_mut().as_mut()
            && !active.insert(target)
        {
            trace!(object = %target, path = %PathDisplay(&event.path), "cycle guard suppressed dispatch");
            return;
        }
        let callbacks = self.watchers.borrow().snapshot(target);
        for callback in callbacks {
            callback(event);
        }
    }

    pub(crate) fn fire_finalizer(&self, target: ObjectId) -> bool {
        let finalizer = self.finalizers.borrow_mut().remove(&target);
        match finalizer {
            Some(finalizer) => {
                debug!(object = %target, "finalizer fired");
                finalizer();
                true
            }
            None => false,
        }
    }
}

/// Installs a fresh guard set and restores the previous one on drop, so a
/// broadcast started from inside a callback does not inherit its caller's set.
struct GuardScope<'a> {
    slot: &'a RefCell<Option<AHashSet<ObjectId>>>,
    previous: Option<AHashSet<ObjectId>>,
}

impl<'a> GuardScope<'a> {
    fn enter(slot: &'a RefCell<Option<AHashSet<ObjectId>>>) -> Self {
        let previous = slot.replace(Some(AHashSet::default()));
        Self { slot, previous }
    }
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        self.slot.replace(self.previous.take());
    }
}

/// Handle to a reactive runtime.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                proxies: RefCell::new(ProxyTable::default()),
                watchers: RefCell::new(WatcherRegistry::default()),
                triggering: RefCell::new(None),
                cache: RefCell::new(InstanceCache::default()),
                finalizers: RefCell::new(AHashMap::new()),
                reclaim_queue: Rc::new(RefCell::new(Vec::new())),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn from_inner(inner: Rc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn is_unsafe_kind(&self, kind: ObjectKind) -> bool {
        self.inner.config.unsafe_kinds.contains(&kind)
    }

    /// Processes every tracked object dropped since the last call.
    ///
    /// For each one: its proxy state and child watchers are released, its
    /// watchers are forgotten, its cache entry is pruned (with any ancestor
    /// trie nodes left empty), and its finalizer fires. Returns the number of
    /// objects processed.
    pub fn reclaim(&self) -> usize {
        let mut total = 0;
        loop {
            let batch = std::mem::take(&mut *self.inner.reclaim_queue.borrow_mut());
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            for id in batch {
                self.evict_reclaimed(id);
            }
        }
        if total > 0 {
            debug!(count = total, "reclaimed objects");
        }
        total
    }

    fn evict_reclaimed(&self, id: ObjectId) {
        let state = self.inner.proxies.borrow_mut().remove(id);
        if let Some(state) = state {
            self.release_proxy_state(&state);
        }
        let callbacks = self.inner.watchers.borrow_mut().forget(id);
        drop(callbacks);
        let evicted = self.inner.cache.borrow_mut().forget(id);
        if evicted.is_some() {
            debug!(object = %id, "evicted reclaimed instance");
        }
        drop(evicted);
        self.inner.fire_finalizer(id);
    }

    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        let watchers = self.inner.watchers.borrow();
        let cache = self.inner.cache.borrow();
        RuntimeStats {
            proxies: self.inner.proxies.borrow().len(),
            watched_objects: watchers.watched_objects(),
            watchers: watchers.watcher_count(),
            cached_instances: cache.live_instances(),
            trie_nodes: cache.node_count(),
            pending_finalizers: self.inner.finalizers.borrow().len(),
            pending_reclaims: self.inner.reclaim_queue.borrow().len(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}
