#![forbid(unsafe_code)]

//! Canonical instance cache: one live instance per (class, arguments) key.
//!
//! [`Runtime::provide`] turns a [`Class`] into a [`Provider`], a factory
//! whose [`value`](Provider::value) returns the same observed instance for
//! argument lists that are pairwise identical. Arguments are keyed through a
//! trie (one level per position), so argument lists of different lengths
//! never collide and a prefix never aliases a longer list.
//!
//! # Invariants
//!
//! 1. A class constructor runs at most once per live key.
//! 2. Slots hold instances weakly. A dead slot is treated as absent and
//!    replaced on the next call, never leaked.
//! 3. Evicting an instance (by reclamation or [`Runtime::revoke`]) prunes
//!    its terminal node and every ancestor left with no children, and fires
//!    its finalizer at most once.
//! 4. A constructor that fails inserts nothing.
//!
//! # Argument identity
//!
//! Arguments are compared by strict identity after origin resolution, so a
//! wrapper and its raw object select the same instance. Numbers compare by
//! value with `-0 == 0`; every `NaN` selects the same slot.

use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet};
use tracing::{debug, warn};

use crate::error::{ReactiveError, Result};
use crate::object::{Class, ClassId, Method, ObjectId, RawObject, WeakRaw};
use crate::observe::{BoundMethod, Observed};
use crate::origin::Origin;
use crate::runtime::{Runtime, RuntimeInner};
use crate::value::{Key, Symbol, Value};

// ---------------------------------------------------------------------------
// Argument keys and the trie
// ---------------------------------------------------------------------------

/// Hashable identity of one factory argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ArgKey {
    Undefined,
    Null,
    Bool(bool),
    Number(u64),
    Str(Rc<str>),
    Symbol(Symbol),
    Object(ObjectId),
    Function(Method),
    Bound(BoundMethod),
    Class(ClassId),
}

impl ArgKey {
    pub(crate) fn from_value(value: &Value) -> Self {
        match value {
            Value::Undefined => Self::Undefined,
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(normalize(*n)),
            Value::Str(s) => Self::Str(Rc::clone(s)),
            Value::Symbol(sym) => Self::Symbol(sym.clone()),
            Value::Object(raw) => Self::Object(raw.id()),
            Value::Observed(observed) => Self::Object(observed.id()),
            Value::Function(method) => Self::Function(method.clone()),
            Value::Bound(bound) => Self::Bound(bound.clone()),
            Value::Class(class) => Self::Class(class.id()),
        }
    }
}

fn normalize(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

struct Slot {
    id: ObjectId,
    instance: WeakRaw,
}

#[derive(Default)]
struct TrieNode {
    children: AHashMap<ArgKey, TrieNode>,
    slot: Option<Slot>,
}

impl TrieNode {
    fn descend(&mut self, path: &[ArgKey]) -> &mut TrieNode {
        let mut node = self;
        for key in path {
            node = node.children.entry(key.clone()).or_default();
        }
        node
    }

    fn find(&self, path: &[ArgKey]) -> Option<&TrieNode> {
        let mut node = self;
        for key in path {
            node = node.children.get(key)?;
        }
        Some(node)
    }

    /// Clears the slot at `path` if it still belongs to `id`, pruning every
    /// node on the way back up that is left empty.
    fn remove_slot(&mut self, path: &[ArgKey], id: ObjectId) -> bool {
        let Some((first, rest)) = path.split_first() else {
            if self.slot.as_ref().is_some_and(|slot| slot.id == id) {
                self.slot = None;
                return true;
            }
            return false;
        };
        let Some(child) = self.children.get_mut(first) else {
            return false;
        };
        let removed = child.remove_slot(rest, id);
        if child.is_empty() {
            self.children.remove(first);
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.slot.is_none() && self.children.is_empty()
    }

    fn node_count(&self) -> usize {
        1 + self.children.values().map(TrieNode::node_count).sum::<usize>()
    }

    fn live_slots(&self) -> usize {
        let own = usize::from(self.slot.as_ref().is_some_and(|slot| slot.instance.is_live()));
        own + self.children.values().map(TrieNode::live_slots).sum::<usize>()
    }
}

/// What the cache knows about one key.
enum Cached {
    Live(RawObject),
    Dead(ObjectId),
}

/// Construction arguments of a cached instance, kept for revoke.
pub(crate) struct InstanceRecord {
    class: ClassId,
    args: Vec<ArgKey>,
}

#[derive(Default)]
pub(crate) struct InstanceCache {
    roots: AHashMap<ClassId, TrieNode>,
    records: AHashMap<ObjectId, InstanceRecord>,
    constructing: AHashSet<(ClassId, Vec<ArgKey>)>,
    providers: AHashMap<ClassId, Weak<ProviderInner>>,
}

impl InstanceCache {
    fn lookup(&self, class: ClassId, args: &[ArgKey]) -> Option<Cached> {
        let slot = self.roots.get(&class)?.find(args)?.slot.as_ref()?;
        Some(match slot.instance.upgrade() {
            Some(raw) => Cached::Live(raw),
            None => Cached::Dead(slot.id),
        })
    }

    /// Stores `instance` at the key, replacing any dead occupant.
    fn insert(&mut self, class: ClassId, args: Vec<ArgKey>, instance: &RawObject) {
        let node = self.roots.entry(class).or_default().descend(&args);
        let stale = node.slot.replace(Slot {
            id: instance.id(),
            instance: instance.downgrade(),
        });
        if let Some(stale) = stale {
            self.records.remove(&stale.id);
        }
        self.records
            .insert(instance.id(), InstanceRecord { class, args });
    }

    /// Drops the entry for `id`, if it is still the one cached at its key.
    pub(crate) fn forget(&mut self, id: ObjectId) -> Option<InstanceRecord> {
        let record = self.records.remove(&id)?;
        if let Some(root) = self.roots.get_mut(&record.class) {
            root.remove_slot(&record.args, id);
            if root.is_empty() {
                self.roots.remove(&record.class);
            }
        }
        Some(record)
    }

    fn begin_construction(&mut self, class: ClassId, args: &[ArgKey]) -> bool {
        self.constructing.insert((class, args.to_vec()))
    }

    fn end_construction(&mut self, class: ClassId, args: &[ArgKey]) {
        self.constructing.remove(&(class, args.to_vec()));
    }

    pub(crate) fn live_instances(&self) -> usize {
        self.roots.values().map(TrieNode::live_slots).sum()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.roots.values().map(TrieNode::node_count).sum()
    }
}

// ---------------------------------------------------------------------------
// Construction context
// ---------------------------------------------------------------------------

/// What a constructor body sees: the blank instance and its runtime.
///
/// Writes through `Init` are untracked; nobody can be watching an instance
/// that is still being built.
pub struct Init<'a> {
    this: &'a RawObject,
    rt: &'a Runtime,
}

impl Init<'_> {
    /// The raw instance under construction.
    #[must_use]
    pub fn this(&self) -> &RawObject {
        self.this
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        self.rt
    }

    #[must_use]
    pub fn get(&self, key: impl Into<Key>) -> Value {
        self.this.get(&key.into())
    }

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) {
        let displaced = self.this.set(key, value);
        drop(displaced);
    }

    /// The instance as its methods will see it.
    #[must_use]
    pub fn observed(&self) -> Option<Observed> {
        self.rt.observe_object(self.this)
    }

    /// Calls a method with the observed instance as receiver.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let this = self
            .observed()
            .ok_or_else(|| ReactiveError::not_callable(name))?;
        this.call(name, args)
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

pub(crate) struct ProviderInner {
    class: Class,
    rt: Runtime,
}

/// The canonical factory for one class in one runtime.
///
/// Cloning shares the factory; providing a class twice while a provider is
/// alive returns the same one.
#[derive(Clone)]
pub struct Provider(Rc<ProviderInner>);

impl Provider {
    #[must_use]
    pub fn class(&self) -> &Class {
        &self.0.class
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.0.rt
    }

    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// The canonical observed instance for `args`.
    ///
    /// Fails with [`ReactiveError::Unobservable`] for classes derived from an
    /// excluded kind; use [`value`](Self::value) for those.
    pub fn instance(&self, args: &[Value]) -> Result<Observed> {
        let class = &self.0.class;
        if self.0.rt.is_unsafe_kind(class.base_kind()) {
            return Err(ReactiveError::Unobservable {
                class: class.name().to_owned(),
            });
        }
        match self.value(args)? {
            Value::Observed(observed) => Ok(observed),
            _ => Err(ReactiveError::Unobservable {
                class: class.name().to_owned(),
            }),
        }
    }

    /// The canonical instance for `args`, observed unless its kind is excluded.
    pub fn value(&self, args: &[Value]) -> Result<Value> {
        let rt = &self.0.rt;
        let class = &self.0.class;
        if rt.config().reclaim_on_provide {
            rt.reclaim();
        }

        let key: Vec<ArgKey> = args.iter().map(ArgKey::from_value).collect();
        let cached = rt.inner.cache.borrow().lookup(class.id(), &key);
        match cached {
            Some(Cached::Live(raw)) => return Ok(rt.observe(&Value::Object(raw))),
            Some(Cached::Dead(stale)) => {
                debug!(class = class.name(), stale = %stale, "cached instance is gone, constructing anew");
            }
            None => {}
        }

        if !rt.inner.cache.borrow_mut().begin_construction(class.id(), &key) {
            warn!(class = class.name(), "constructor re-entered its own factory with the same key");
            return Err(ReactiveError::ReentrantConstruction {
                class: class.name().to_owned(),
            });
        }
        let built = self.construct(args);
        rt.inner.cache.borrow_mut().end_construction(class.id(), &key);
        let raw = built?;

        raw.attach_reclaim_hook(&rt.inner.reclaim_queue);
        rt.inner.cache.borrow_mut().insert(class.id(), key, &raw);
        debug!(class = class.name(), instance = %raw.id(), args = args.len(), "constructed canonical instance");
        Ok(rt.observe(&Value::Object(raw)))
    }

    fn construct(&self, args: &[Value]) -> Result<RawObject> {
        let class = &self.0.class;
        let raw = RawObject::instance(class);
        let init = Init {
            this: &raw,
            rt: &self.0.rt,
        };
        match class.initialize(&init, args) {
            Ok(()) => Ok(raw),
            Err(source) => {
                warn!(class = class.name(), error = %source, "constructor failed");
                Err(ReactiveError::Construct {
                    class: class.name().to_owned(),
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("class", &self.0.class.name())
            .finish()
    }
}

/// Things that can be turned into a canonical factory.
pub trait Provide {
    fn provide_in(&self, rt: &Runtime) -> Provider;
}

impl Provide for Class {
    fn provide_in(&self, rt: &Runtime) -> Provider {
        let existing = rt
            .inner
            .cache
            .borrow()
            .providers
            .get(&self.id())
            .and_then(Weak::upgrade);
        if let Some(inner) = existing {
            return Provider(inner);
        }
        let provider = Provider(Rc::new(ProviderInner {
            class: self.clone(),
            rt: rt.clone(),
        }));
        let mut cache = rt.inner.cache.borrow_mut();
        cache.providers.retain(|_, inner| inner.strong_count() > 0);
        cache.providers.insert(self.id(), Rc::downgrade(&provider.0));
        drop(cache);
        debug!(class = self.name(), "provider created");
        provider
    }
}

impl Provide for Provider {
    fn provide_in(&self, rt: &Runtime) -> Provider {
        if Runtime::ptr_eq(&self.0.rt, rt) {
            self.clone()
        } else {
            self.0.class.provide_in(rt)
        }
    }
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// One-shot eviction callback slot for an instance.
///
/// Every handle for the same origin addresses the same slot.
pub struct Finalization {
    rt: Weak<RuntimeInner>,
    target: ObjectId,
}

impl Finalization {
    #[must_use]
    pub fn target(&self) -> ObjectId {
        self.target
    }

    /// Sets the callback fired when the target is evicted, replacing any
    /// earlier one.
    pub fn register(&self, callback: impl FnOnce() + 'static) {
        if let Some(rt) = self.rt.upgrade() {
            let displaced = rt
                .finalizers
                .borrow_mut()
                .insert(self.target, Box::new(callback));
            drop(displaced);
        }
    }

    /// Removes the callback before it fires. Returns whether one was set.
    pub fn unregister(&self) -> bool {
        let Some(rt) = self.rt.upgrade() else {
            return false;
        };
        let removed = rt.finalizers.borrow_mut().remove(&self.target);
        removed.is_some()
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.rt
            .upgrade()
            .is_some_and(|rt| rt.finalizers.borrow().contains_key(&self.target))
    }
}

impl std::fmt::Debug for Finalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalization")
            .field("target", &self.target)
            .field("registered", &self.is_registered())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime entry points
// ---------------------------------------------------------------------------

impl Runtime {
    /// The canonical factory for `target` in this runtime.
    pub fn provide(&self, target: &impl Provide) -> Provider {
        target.provide_in(self)
    }

    /// Evicts a canonical instance now, firing its finalizer.
    ///
    /// The next factory call with the same arguments constructs afresh.
    /// Returns `false` for anything that is not a cached instance.
    pub fn revoke(&self, instance: &impl Origin) -> bool {
        let Some(raw) = instance.origin_object() else {
            return false;
        };
        let record = self.inner.cache.borrow_mut().forget(raw.id());
        let Some(record) = record else {
            return false;
        };
        debug!(instance = %raw.id(), args = record.args.len(), "revoked canonical instance");
        self.inner.fire_finalizer(raw.id());
        true
    }

    /// The finalization slot for `instance`, or `None` for a primitive.
    #[must_use]
    pub fn finalization_registry(&self, instance: &impl Origin) -> Option<Finalization> {
        let raw = instance.origin_object()?;
        raw.attach_reclaim_hook(&self.inner.reclaim_queue);
        Some(Finalization {
            rt: self.downgrade(),
            target: raw.id(),
        })
    }
}
