#![forbid(unsafe_code)]

//! Watcher registry: tagged change callbacks keyed by raw object identity.
//!
//! # Invariants
//!
//! 1. Callbacks on one object are dispatched in registration order.
//! 2. Removal is by [`WatcherTag`], so the same closure may be registered
//!    any number of times and each registration is removed independently.
//! 3. An object with no remaining callbacks has no entry.
//! 4. Dispatch works on a snapshot, so callbacks may add or remove watchers
//!    (including themselves) while being notified.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::trace;

use crate::object::{ObjectId, RawObject, WeakRaw};
use crate::runtime::RuntimeInner;
use crate::value::{Key, Path, PathDisplay, Value};

/// A committed mutation, as seen from the notified object.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Keys from the notified object down to the mutated property.
    pub path: Path,
    /// Raw value before the mutation.
    pub old: Value,
    /// Raw value after the mutation (`Undefined` for deletions).
    pub new: Value,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(key: Key, old: Value, new: Value) -> Self {
        Self {
            path: vec![key],
            old,
            new,
        }
    }

    /// The same change seen one level up, through property `key`.
    #[must_use]
    pub fn prefixed(&self, key: &Key) -> Self {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.push(key.clone());
        path.extend(self.path.iter().cloned());
        Self {
            path,
            old: self.old.clone(),
            new: self.new.clone(),
        }
    }

    /// The mutated property itself.
    #[must_use]
    pub fn leaf(&self) -> Option<&Key> {
        self.path.last()
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", PathDisplay(&self.path), self.old, self.new)
    }
}

pub(crate) type WatchFn = Rc<dyn Fn(&ChangeEvent)>;

/// Identity of one watcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherTag(u64);

struct WatcherSet {
    target: WeakRaw,
    callbacks: BTreeMap<WatcherTag, WatchFn>,
}

#[derive(Default)]
pub(crate) struct WatcherRegistry {
    sets: AHashMap<ObjectId, WatcherSet>,
    next_tag: u64,
}

impl WatcherRegistry {
    pub(crate) fn add(&mut self, target: &RawObject, callback: WatchFn) -> WatcherTag {
        self.next_tag += 1;
        let tag = WatcherTag(self.next_tag);
        self.sets
            .entry(target.id())
            .or_insert_with(|| WatcherSet {
                target: target.downgrade(),
                callbacks: BTreeMap::new(),
            })
            .callbacks
            .insert(tag, callback);
        trace!(object = %target.id(), tag = tag.0, "watcher added");
        tag
    }

    /// Removes one registration. The callback is handed back so the caller
    /// can drop it outside any borrow of the registry.
    pub(crate) fn remove(&mut self, target: ObjectId, tag: WatcherTag) -> Option<WatchFn> {
        let set = self.sets.get_mut(&target)?;
        let removed = set.callbacks.remove(&tag);
        if set.callbacks.is_empty() {
            self.sets.remove(&target);
        }
        if removed.is_some() {
            trace!(object = %target, tag = tag.0, "watcher removed");
        }
        removed
    }

    /// Callbacks registered on `target`, in registration order.
    pub(crate) fn snapshot(&self, target: ObjectId) -> Vec<WatchFn> {
        self.sets
            .get(&target)
            .filter(|set| set.target.is_live())
            .map(|set| set.callbacks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every registration on a reclaimed object.
    pub(crate) fn forget(&mut self, target: ObjectId) -> Vec<WatchFn> {
        self.sets
            .remove(&target)
            .map(|set| set.callbacks.into_values().collect())
            .unwrap_or_default()
    }

    pub(crate) fn watched_objects(&self) -> usize {
        self.sets.len()
    }

    pub(crate) fn watcher_count(&self) -> usize {
        self.sets.values().map(|set| set.callbacks.len()).sum()
    }
}

/// A watcher registration. Dropping it unregisters the callback.
///
/// Use [`detach`](Self::detach) to keep the callback registered for as long
/// as the target lives.
#[must_use = "dropping a Watch unregisters its callback"]
pub struct Watch {
    rt: Weak<RuntimeInner>,
    registration: Option<(ObjectId, WatcherTag)>,
}

impl Watch {
    pub(crate) fn new(rt: Weak<RuntimeInner>, target: ObjectId, tag: WatcherTag) -> Self {
        Self {
            rt,
            registration: Some((target, tag)),
        }
    }

    /// A handle for a target that cannot be watched (a primitive).
    pub(crate) fn inert() -> Self {
        Self {
            rt: Weak::new(),
            registration: None,
        }
    }

    /// Unregisters the callback. Unwatching twice is a no-op.
    pub fn unwatch(mut self) {
        self.release();
    }

    /// Leaves the callback registered and discards the handle.
    pub fn detach(mut self) {
        self.registration = None;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        match (self.registration, self.rt.upgrade()) {
            (Some((target, tag)), Some(rt)) => rt
                .watchers
                .borrow()
                .sets
                .get(&target)
                .is_some_and(|set| set.callbacks.contains_key(&tag)),
            _ => false,
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<ObjectId> {
        self.registration.map(|(target, _)| target)
    }

    fn release(&mut self) {
        if let Some((target, tag)) = self.registration.take()
            && let Some(rt) = self.rt.upgrade()
        {
            let removed = rt.watchers.borrow_mut().remove(target, tag);
            drop(removed);
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("target", &self.target())
            .field("active", &self.is_active())
            .finish()
    }
}
