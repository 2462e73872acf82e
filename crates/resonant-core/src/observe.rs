#![forbid(unsafe_code)]

//! Observation engine: tracked wrappers over raw objects.
//!
//! [`Observed`] is the interception layer. Every read, write, and delete
//! through it goes through the rules below; the raw object underneath is
//! reachable with [`Observed::origin`] for untracked access.
//!
//! # Invariants
//!
//! 1. Wrapping is idempotent: observing a raw object, or a wrapper of it,
//!    always yields the same proxy state for as long as the raw object lives.
//! 2. A write whose new value has the same origin as the old one is a no-op:
//!    no notification and no child-watcher churn.
//! 3. Reading an object-valued property wraps the child and keeps exactly
//!    one child watcher per property, re-broadcasting the child's changes
//!    with the property key prepended to the path.
//! 4. Within one top-level broadcast, each raw object is dispatched at most
//!    once. Cyclic graphs therefore notify every watcher exactly once.
//! 5. Writes store origins, so the raw graph never contains wrappers put
//!    there by tracked writes.
//!
//! # Failure Modes
//!
//! - **Excluded kinds**: map-like, set-like, weak and promise-like objects are
//!   returned unwrapped and never notify.
//! - **Untracked writes**: mutating the raw object directly notifies nobody.
//!   A child swapped in behind the engine's back is re-watched on next read.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::{trace, warn};

use crate::error::{ReactiveError, Result};
use crate::object::{Class, Method, ObjectId, ObjectKind, RawObject, WeakRaw};
use crate::origin::{Origin, origin};
use crate::registry::{ChangeEvent, Watch, WatchFn, WatcherTag};
use crate::runtime::{Runtime, RuntimeInner};
use crate::value::{Key, Value};

// ---------------------------------------------------------------------------
// Proxy state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ChildWatch {
    child: ObjectId,
    tag: WatcherTag,
}

/// Per-raw-object interception state, shared by every wrapper handle.
pub(crate) struct ProxyState {
    id: ObjectId,
    child_watchers: RefCell<AHashMap<Key, ChildWatch>>,
    bound: RefCell<AHashMap<Key, BoundMethod>>,
}

impl ProxyState {
    fn new(id: ObjectId) -> Self {
        Self {
            id,
            child_watchers: RefCell::new(AHashMap::new()),
            bound: RefCell::new(AHashMap::new()),
        }
    }

    fn release_child(&self, rt: &RuntimeInner, key: &Key) {
        let watch = self.child_watchers.borrow_mut().remove(key);
        if let Some(watch) = watch {
            let callback = rt.watchers.borrow_mut().remove(watch.child, watch.tag);
            drop(callback);
        }
    }

    fn release_all(&self, rt: &RuntimeInner) {
        let watches: Vec<ChildWatch> = self
            .child_watchers
            .borrow_mut()
            .drain()
            .map(|(_, watch)| watch)
            .collect();
        for watch in watches {
            let callback = rt.watchers.borrow_mut().remove(watch.child, watch.tag);
            drop(callback);
        }
        let bound = std::mem::take(&mut *self.bound.borrow_mut());
        drop(bound);
    }
}

struct ProxyEntry {
    raw: WeakRaw,
    state: Rc<ProxyState>,
}

#[derive(Default)]
pub(crate) struct ProxyTable {
    entries: AHashMap<ObjectId, ProxyEntry>,
}

impl ProxyTable {
    fn lookup(&self, id: ObjectId) -> Option<Rc<ProxyState>> {
        self.entries
            .get(&id)
            .filter(|entry| entry.raw.is_live())
            .map(|entry| Rc::clone(&entry.state))
    }

    fn insert(&mut self, raw: &RawObject, state: Rc<ProxyState>) {
        self.entries.insert(
            raw.id(),
            ProxyEntry {
                raw: raw.downgrade(),
                state,
            },
        );
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<Rc<ProxyState>> {
        self.entries.remove(&id).map(|entry| entry.state)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Observed
// ---------------------------------------------------------------------------

/// A tracked wrapper over a raw object.
///
/// Cloning yields another handle to the **same** wrapper: clones compare
/// equal under [`Observed::ptr_eq`].
#[derive(Clone)]
pub struct Observed {
    raw: RawObject,
    state: Rc<ProxyState>,
    rt: Runtime,
}

/// Array methods whose arguments are retried with origins on a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Search {
    Includes,
    IndexOf,
    LastIndexOf,
}

impl Search {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "includes" => Some(Self::Includes),
            "indexOf" => Some(Self::IndexOf),
            "lastIndexOf" => Some(Self::LastIndexOf),
            _ => None,
        }
    }

    fn matches(self, element: &Value, needle: &Value) -> bool {
        match (self, element, needle) {
            // `includes` uses SameValueZero, which finds NaN.
            (Self::Includes, Value::Number(a), Value::Number(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            _ => element == needle,
        }
    }
}

impl Observed {
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.state.id
    }

    /// The raw object behind this wrapper.
    #[must_use]
    pub fn origin(&self) -> &RawObject {
        &self.raw
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.raw.kind()
    }

    #[must_use]
    pub fn class(&self) -> Option<&Class> {
        self.raw.class()
    }

    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.state, &b.state)
    }

    /// Tracked read.
    ///
    /// Functions come back bound to this wrapper (one cached binding per
    /// property); objects come back wrapped, with a child watcher installed
    /// on them for this property.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        if let Some(value) = self.protected(&key) {
            return value;
        }
        let value = match self.raw.get_own(&key) {
            Some(value) => value,
            None => match key.as_name().and_then(|name| self.raw.getter(name)) {
                Some(getter) => getter(self),
                None => self.raw.get(&key),
            },
        };
        self.wrap_read(&key, value)
    }

    /// Tracked write. Notifies watchers unless old and new share an origin.
    ///
    /// A value the object rejects (an invalid array length) fails without
    /// committing anything or notifying anyone.
    pub fn try_set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let new = origin(&value.into());
        let old = origin(&self.raw.get(&key));
        if old == new {
            return Ok(());
        }
        let displaced = self.raw.try_set(key.clone(), new.clone())?;
        self.reparent(&key, &new);
        self.rt
            .inner
            .broadcast(self.id(), &ChangeEvent::new(key, old, new));
        drop(displaced);
        Ok(())
    }

    /// [`try_set`](Self::try_set) that logs and discards a rejected write.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) {
        if let Err(err) = self.try_set(key, value) {
            warn!(object = %self.id(), error = %err, "write rejected");
        }
    }

    /// Tracked delete. Returns whether an own property was removed.
    ///
    /// Every delete the object permits notifies, with `undefined` as the new
    /// value, including deletes of missing keys and of keys that held
    /// `undefined`. Deleting an array's `"length"` is refused silently.
    pub fn delete(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        if !self.raw.is_deletable(&key) {
            return false;
        }
        let old = origin(&self.raw.get(&key));
        let removed = self.raw.delete(&key);
        self.reparent(&key, &Value::Undefined);
        self.rt
            .inner
            .broadcast(self.id(), &ChangeEvent::new(key, old, Value::Undefined));
        removed.is_some()
    }

    /// Reads `key` and calls it with this wrapper as receiver.
    pub fn call(&self, key: impl Into<Key>, args: &[Value]) -> Result<Value> {
        let key = key.into();
        match self.get(key.clone()) {
            Value::Bound(bound) => bound.call(args),
            Value::Function(method) => {
                method
                    .invoke(self, args)
                    .map_err(|source| ReactiveError::Method {
                        name: key.to_string(),
                        source,
                    })
            }
            _ => Err(ReactiveError::not_callable(&key)),
        }
    }

    /// `hasOwnProperty`, answered by the origin.
    #[must_use]
    pub fn has_own_property(&self, key: impl Into<Key>) -> bool {
        self.raw.has_own(&key.into())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.raw.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Appends to an array and returns the new length.
    ///
    /// The element is stored even when it is `undefined`. Watchers hear about
    /// the new index, or about `"length"` when the element itself is
    /// `undefined`. Fails on an array already at [`MAX_ARRAY_LENGTH`].
    ///
    /// [`MAX_ARRAY_LENGTH`]: crate::MAX_ARRAY_LENGTH
    pub fn try_push(&self, value: impl Into<Value>) -> Result<usize> {
        let length = self.len();
        let key = Key::Index(length);
        if !key.is_array_index() {
            return Err(ReactiveError::InvalidArrayLength {
                value: (length as f64 + 1.0).to_string(),
            });
        }
        let new = origin(&value.into());
        let displaced = self.raw.try_set(key.clone(), new.clone())?;
        self.reparent(&key, &new);
        let event = if new.is_undefined() {
            ChangeEvent::new(Key::from("length"), Value::from(length), Value::from(length + 1))
        } else {
            ChangeEvent::new(key, Value::Undefined, new)
        };
        self.rt.inner.broadcast(self.id(), &event);
        drop(displaced);
        Ok(self.len())
    }

    /// [`try_push`](Self::try_push) that logs a rejected push and returns the
    /// unchanged length.
    pub fn push(&self, value: impl Into<Value>) -> usize {
        self.try_push(value).unwrap_or_else(|err| {
            warn!(object = %self.id(), error = %err, "push rejected");
            self.len()
        })
    }

    #[must_use]
    pub fn includes(&self, needle: &Value) -> bool {
        self.search(Search::Includes, needle).is_some()
    }

    #[must_use]
    pub fn index_of(&self, needle: &Value) -> Option<usize> {
        self.search(Search::IndexOf, needle)
    }

    #[must_use]
    pub fn last_index_of(&self, needle: &Value) -> Option<usize> {
        self.search(Search::LastIndexOf, needle)
    }

    /// Registers `callback` for changes anywhere below this object.
    pub fn watch(&self, callback: impl Fn(&ChangeEvent) + 'static) -> Watch {
        self.rt.watch(self, callback)
    }

    /// Tries the needle as given first, then retries with origins on a miss.
    /// Holes are skipped, except that `includes(undefined)` finds one.
    fn search(&self, search: Search, needle: &Value) -> Option<usize> {
        let entries = self.raw.entries();
        let find = |needle: &Value, resolve: bool| {
            let hit = |entry: &&(usize, Value)| {
                if resolve {
                    search.matches(&origin(&entry.1), needle)
                } else {
                    search.matches(&entry.1, needle)
                }
            };
            let found = match search {
                Search::LastIndexOf => entries.iter().rev().find(hit),
                Search::Includes | Search::IndexOf => entries.iter().find(hit),
            };
            found.map(|(index, _)| *index)
        };
        find(needle, false)
            .or_else(|| find(&origin(needle), true))
            .or_else(|| match search {
                Search::Includes if needle.is_undefined() => self.raw.first_hole(),
                _ => None,
            })
    }

    /// Keys that bypass wrapping and tracking.
    fn protected(&self, key: &Key) -> Option<Value> {
        let name = key.as_name()?;
        match name {
            "constructor" | "__proto__" => Some(self.raw.get_own(key).unwrap_or_else(|| {
                self.raw
                    .class()
                    .cloned()
                    .map_or(Value::Null, Value::Class)
            })),
            "hasOwnProperty" => Some(Value::Function(Method::new(|this, args| {
                let found = args
                    .first()
                    .and_then(Key::from_value)
                    .is_some_and(|key| this.origin().has_own(&key));
                Ok(Value::Bool(found))
            }))),
            _ if self.raw.is_array() => Search::from_name(name).map(|search| {
                Value::Function(Method::new(move |this, args| {
                    let needle = args.first().cloned().unwrap_or_default();
                    Ok(match (search, this.search(search, &needle)) {
                        (Search::Includes, found) => Value::Bool(found.is_some()),
                        (_, Some(index)) => Value::from(index),
                        (_, None) => Value::from(-1),
                    })
                }))
            }),
            _ => None,
        }
    }

    fn wrap_read(&self, key: &Key, value: Value) -> Value {
        match value {
            Value::Function(method) => Value::Bound(self.bound_method(key, method)),
            Value::Object(_) | Value::Observed(_) => {
                let Some(child) = value.origin_object() else {
                    return value;
                };
                match self.rt.observe_object(&child) {
                    Some(observed) => {
                        self.ensure_child_watch(key, &child);
                        Value::Observed(observed)
                    }
                    None => Value::Object(child),
                }
            }
            other => other,
        }
    }

    fn bound_method(&self, key: &Key, method: Method) -> BoundMethod {
        if let Some(bound) = self
            .state
            .bound
            .borrow()
            .get(key)
            .filter(|bound| bound.method() == &method)
        {
            return bound.clone();
        }
        let bound = BoundMethod::new(key.to_string(), self.downgrade(), method);
        self.state
            .bound
            .borrow_mut()
            .insert(key.clone(), bound.clone());
        bound
    }

    /// Drops the child watcher and cached binding under `key`, then watches
    /// `new` if it is an object.
    fn reparent(&self, key: &Key, new: &Value) {
        self.state.release_child(&self.rt.inner, key);
        if let Value::Object(child) = new {
            self.install_child_watch(key, child);
        }
        let stale = self.state.bound.borrow_mut().remove(key);
        drop(stale);
    }

    fn ensure_child_watch(&self, key: &Key, child: &RawObject) {
        let current = self.state.child_watchers.borrow().get(key).copied();
        if current.is_some_and(|watch| watch.child == child.id()) {
            return;
        }
        self.state.release_child(&self.rt.inner, key);
        self.install_child_watch(key, child);
    }

    fn install_child_watch(&self, key: &Key, child: &RawObject) {
        if self.rt.is_unsafe_kind(child.kind()) {
            return;
        }
        let tag = self.rt.add_child_watcher(self.id(), key.clone(), child);
        self.state.child_watchers.borrow_mut().insert(
            key.clone(),
            ChildWatch {
                child: child.id(),
                tag,
            },
        );
    }

    fn downgrade(&self) -> WeakObserved {
        WeakObserved {
            raw: self.raw.downgrade(),
            state: Rc::downgrade(&self.state),
            rt: self.rt.downgrade(),
        }
    }
}

impl PartialEq for Observed {
    fn eq(&self, other: &Self) -> bool {
        Observed::ptr_eq(self, other)
    }
}

impl fmt::Debug for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observed")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("class", &self.class().map(Class::name))
            .finish()
    }
}

/// Non-owning handle to a wrapper, held by bound methods so that caching a
/// binding never keeps its receiver alive.
#[derive(Clone)]
struct WeakObserved {
    raw: WeakRaw,
    state: Weak<ProxyState>,
    rt: Weak<RuntimeInner>,
}

impl WeakObserved {
    fn upgrade(&self) -> Option<Observed> {
        Some(Observed {
            raw: self.raw.upgrade()?,
            state: self.state.upgrade()?,
            rt: Runtime::from_inner(self.rt.upgrade()?),
        })
    }
}

// ---------------------------------------------------------------------------
// Bound methods
// ---------------------------------------------------------------------------

struct BoundInner {
    name: Rc<str>,
    receiver: WeakObserved,
    method: Method,
}

/// A function read through a wrapper, bound to that wrapper as receiver.
///
/// Repeated reads of the same property return the same binding (equal by
/// identity) until the property is written or deleted.
#[derive(Clone)]
pub struct BoundMethod(Rc<BoundInner>);

impl BoundMethod {
    fn new(name: String, receiver: WeakObserved, method: Method) -> Self {
        Self(Rc::new(BoundInner {
            name: name.into(),
            receiver,
            method,
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The unbound function.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.0.method
    }

    /// The receiver, if it is still alive.
    #[must_use]
    pub fn receiver(&self) -> Option<Observed> {
        self.0.receiver.upgrade()
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        let this = self.receiver().ok_or(ReactiveError::Reclaimed)?;
        self.0
            .method
            .invoke(&this, args)
            .map_err(|source| ReactiveError::Method {
                name: self.0.name.to_string(),
                source,
            })
    }

    fn addr(&self) -> *const BoundInner {
        Rc::as_ptr(&self.0)
    }
}

impl PartialEq for BoundMethod {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BoundMethod {}

impl Hash for BoundMethod {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("name", &self.0.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime entry points
// ---------------------------------------------------------------------------

impl Runtime {
    /// Wraps object values; primitives and excluded kinds pass through.
    #[must_use]
    pub fn observe(&self, target: &Value) -> Value {
        match target.origin_object() {
            Some(raw) => match self.observe_object(&raw) {
                Some(observed) => Value::Observed(observed),
                None => Value::Object(raw),
            },
            None => target.clone(),
        }
    }

    /// The wrapper for `target`, or `None` for an excluded kind.
    #[must_use]
    pub fn observe_object(&self, target: &RawObject) -> Option<Observed> {
        if self.is_unsafe_kind(target.kind()) {
            trace!(object = %target.id(), kind = ?target.kind(), "excluded kind passed through");
            return None;
        }
        let existing = self.inner.proxies.borrow().lookup(target.id());
        let state = match existing {
            Some(state) => state,
            None => {
                let state = Rc::new(ProxyState::new(target.id()));
                self.inner
                    .proxies
                    .borrow_mut()
                    .insert(target, Rc::clone(&state));
                target.attach_reclaim_hook(&self.inner.reclaim_queue);
                trace!(object = %target.id(), "proxy created");
                state
            }
        };
        Some(Observed {
            raw: target.clone(),
            state,
            rt: self.clone(),
        })
    }

    /// Registers `callback` against the origin of `target`.
    ///
    /// Watching a primitive returns an inert handle.
    pub fn watch<T: Origin>(&self, target: &T, callback: impl Fn(&ChangeEvent) + 'static) -> Watch {
        let Some(raw) = target.origin_object() else {
            return Watch::inert();
        };
        raw.attach_reclaim_hook(&self.inner.reclaim_queue);
        let tag = self
            .inner
            .watchers
            .borrow_mut()
            .add(&raw, Rc::new(callback));
        Watch::new(self.downgrade(), raw.id(), tag)
    }

    /// Installs the watcher that re-broadcasts `child`'s changes on `parent`.
    fn add_child_watcher(&self, parent: ObjectId, key: Key, child: &RawObject) -> WatcherTag {
        child.attach_reclaim_hook(&self.inner.reclaim_queue);
        let rt = self.downgrade();
        let callback: WatchFn = Rc::new(move |event: &ChangeEvent| {
            if let Some(rt) = rt.upgrade() {
                rt.trigger(parent, &event.prefixed(&key));
            }
        });
        self.inner.watchers.borrow_mut().add(child, callback)
    }

    pub(crate) fn release_proxy_state(&self, state: &ProxyState) {
        state.release_all(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    type Log = Rc<RefCell<Vec<ChangeEvent>>>;

    fn record(target: &Observed) -> (Log, Watch) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let watch = target.watch(move |event| sink.borrow_mut().push(event.clone()));
        (log, watch)
    }

    fn observed(rt: &Runtime, raw: &RawObject) -> Observed {
        rt.observe_object(raw).expect("plain objects are observable")
    }

    #[test]
    fn observe_is_idempotent() {
        let rt = Runtime::new();
        let raw = RawObject::new();
        let a = observed(&rt, &raw);
        let b = rt.observe(&Value::from(&a));
        let c = rt.observe(&Value::from(&raw));
        assert_eq!(b, Value::Observed(a.clone()));
        assert_eq!(c, Value::Observed(a));
        assert_eq!(rt.stats().proxies, 1);
    }

    #[test]
    fn primitives_pass_through() {
        let rt = Runtime::new();
        assert_eq!(rt.observe(&Value::from(4)), Value::from(4));
        assert_eq!(rt.observe(&Value::Null), Value::Null);
    }

    #[test]
    fn excluded_kinds_are_returned_unwrapped() {
        let rt = Runtime::new();
        for kind in ObjectKind::UNSAFE_TO_PROXY {
            let raw = RawObject::of_kind(kind);
            assert_eq!(rt.observe(&Value::from(&raw)), Value::from(&raw));
            assert!(rt.observe_object(&raw).is_none());
        }
        assert_eq!(rt.stats().proxies, 0);
    }

    #[test]
    fn excluded_children_are_read_raw_and_never_notify() {
        let rt = Runtime::new();
        let map = RawObject::of_kind(ObjectKind::Map);
        let root = observed(&rt, &RawObject::new().with("cache", &map));
        let (log, _watch) = record(&root);

        let read = root.get("cache");
        assert_eq!(read, Value::from(&map));
        map.set("k", 1);
        assert!(log.borrow().is_empty());
        assert_eq!(rt.stats().watchers, 1);
    }

    #[test]
    fn write_notifies_with_raw_values() {
        let rt = Runtime::new();
        let obj = observed(&rt, &RawObject::new().with("value", 0));
        let (log, _watch) = record(&obj);

        obj.set("value", 5);
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].path, ["value"]);
        assert_eq!(log[0].old, Value::from(0));
        assert_eq!(log[0].new, Value::from(5));
    }

    #[test]
    fn equal_write_is_a_noop() {
        let rt = Runtime::new();
        let child = RawObject::new();
        let obj = observed(&rt, &RawObject::new().with("value", 1).with("child", &child));
        let (log, _watch) = record(&obj);

        obj.set("value", 1);
        obj.set("child", &child);
        obj.set("child", observed(&rt, &child));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn writes_store_origins() {
        let rt = Runtime::new();
        let child = observed(&rt, &RawObject::new());
        let obj = observed(&rt, &RawObject::new());

        obj.set("child", &child);
        let stored = obj.origin().get_own(&"child".into()).expect("stored");
        assert_eq!(stored, Value::from(child.origin()));
        assert_eq!(obj.get("child"), Value::from(&child));
    }

    #[test]
    fn delete_notifies_with_undefined() {
        let rt = Runtime::new();
        let obj = observed(&rt, &RawObject::new().with("a", 1));
        let (log, _watch) = record(&obj);

        assert!(obj.delete("a"));
        assert!(!obj.has_own_property("a"));
        assert!(!obj.delete("a"));
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].old, Value::from(1));
        assert_eq!(log[0].new, Value::Undefined);
        assert_eq!(log[1].path, ["a"]);
        assert_eq!(log[1].old, Value::Undefined);
    }

    #[test]
    fn deleting_an_undefined_value_notifies() {
        let rt = Runtime::new();
        let obj = observed(&rt, &RawObject::new().with("k", Value::Undefined));
        let (log, _watch) = record(&obj);

        assert!(obj.delete("k"));
        assert!(!obj.has_own_property("k"));
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].path, ["k"]);
        assert_eq!(log[0].new, Value::Undefined);
    }

    #[test]
    fn array_length_cannot_be_deleted() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array([1, 2]));
        let (log, _watch) = record(&list);

        assert!(!list.delete("length"));
        assert_eq!(list.len(), 2);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn delete_releases_the_child_watcher() {
        let rt = Runtime::new();
        let child = RawObject::new().with("v", 0);
        let root = observed(&rt, &RawObject::new().with("child", &child));
        let (log, _watch) = record(&root);
        let _ = root.get("child");
        assert_eq!(rt.stats().watchers, 2);

        assert!(root.delete("child"));
        assert_eq!(rt.stats().watchers, 1);
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].old.same_origin(&Value::from(&child)));

        observed(&rt, &child).set("v", 1);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn delete_inside_a_cycle_notifies_each_watcher_once() {
        let rt = Runtime::new();
        let a = observed(&rt, &RawObject::new().with("value", 0));
        let b = observed(&rt, &RawObject::new());
        a.set("child", &b);
        b.set("child", &a);
        let (a_log, _wa) = record(&a);
        let (b_log, _wb) = record(&b);

        assert!(a.delete("value"));
        assert_eq!(a_log.borrow().len(), 1);
        assert_eq!(a_log.borrow()[0].path, ["value"]);
        assert_eq!(b_log.borrow().len(), 1);
        assert_eq!(b_log.borrow()[0].path, ["child", "value"]);
        assert_eq!(b_log.borrow()[0].old, Value::from(0));

        // Deleting a cycle edge tears down its watcher; b no longer hears a.
        assert!(b.delete("child"));
        assert_eq!(a_log.borrow().len(), 2);
        assert_eq!(b_log.borrow().len(), 2);
        a.set("value", 1);
        assert_eq!(a_log.borrow().len(), 3);
        assert_eq!(b_log.borrow().len(), 2);

        a.delete("child");
    }

    #[test]
    fn nested_reads_are_wrapped_and_compose_paths() {
        let rt = Runtime::new();
        let leaf = RawObject::new().with("value", 0);
        let child = RawObject::new().with("leaf", &leaf);
        let root = observed(&rt, &RawObject::new().with("child", &child));
        let (root_log, _w1) = record(&root);

        let child_obs = root.get("child");
        let child_obs = child_obs.as_observed().expect("wrapped");
        let (child_log, _w2) = record(child_obs);
        let leaf_obs = child_obs.get("leaf");
        leaf_obs.as_observed().expect("wrapped").set("value", 9);

        assert_eq!(root_log.borrow().len(), 1);
        assert_eq!(root_log.borrow()[0].path, ["child", "leaf", "value"]);
        assert_eq!(child_log.borrow()[0].path, ["leaf", "value"]);
        assert_eq!(root_log.borrow()[0].new, Value::from(9));
    }

    #[test]
    fn repeated_reads_keep_one_child_watcher() {
        let rt = Runtime::new();
        let root = observed(&rt, &RawObject::new().with("child", RawObject::new()));
        for _ in 0..5 {
            let _ = root.get("child");
        }
        assert_eq!(rt.stats().watchers, 1);
    }

    #[test]
    fn reassignment_reparents_child_watcher() {
        let rt = Runtime::new();
        let first = RawObject::new().with("v", 0);
        let second = RawObject::new().with("v", 0);
        let root = observed(&rt, &RawObject::new().with("child", &first));
        let (log, _watch) = record(&root);
        let _ = root.get("child");

        root.set("child", &second);
        assert_eq!(log.borrow().len(), 1);

        observed(&rt, &first).set("v", 1);
        assert_eq!(log.borrow().len(), 1);

        observed(&rt, &second).set("v", 1);
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(log.borrow()[1].path, ["child", "v"]);
    }

    #[test]
    fn untracked_child_swap_is_rewatched_on_read() {
        let rt = Runtime::new();
        let first = RawObject::new();
        let second = RawObject::new().with("v", 0);
        let root = observed(&rt, &RawObject::new().with("child", &first));
        let (log, _watch) = record(&root);
        let _ = root.get("child");

        root.origin().set("child", &second);
        let _ = root.get("child");
        observed(&rt, &second).set("v", 1);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(rt.stats().watchers, 2);
    }

    #[test]
    fn cyclic_graph_notifies_each_watcher_once() {
        let rt = Runtime::new();
        let a = observed(&rt, &RawObject::new().with("value", 0));
        let b = observed(&rt, &RawObject::new().with("value", 0));
        a.set("child", &b);
        b.set("child", &a);

        let (a_log, _wa) = record(&a);
        let (b_log, _wb) = record(&b);
        a.set("value", 1);
        assert_eq!(a_log.borrow().len(), 1);
        assert_eq!(b_log.borrow().len(), 1);
        assert_eq!(b_log.borrow()[0].path, ["child", "value"]);

        b.set("value", 1);
        assert_eq!(a_log.borrow().len(), 2);
        assert_eq!(b_log.borrow().len(), 2);

        // Break the cycle so both objects can be dropped.
        a.delete("child");
        b.delete("child");
    }

    #[test]
    fn self_reference_notifies_once() {
        let rt = Runtime::new();
        let a = observed(&rt, &RawObject::new().with("value", 0));
        a.set("me", &a);
        let (log, _watch) = record(&a);

        a.set("value", 2);
        assert_eq!(log.borrow().len(), 1);
        a.delete("me");
    }

    #[test]
    fn callback_writes_start_a_fresh_broadcast() {
        let rt = Runtime::new();
        let a = observed(&rt, &RawObject::new().with("value", 0).with("mirror", 0));
        let (log, _watch) = record(&a);
        let a_clone = a.clone();
        let _mirror = a.watch(move |event| {
            if event.path == ["value"] {
                a_clone.set("mirror", event.new.clone());
            }
        });

        a.set("value", 3);
        let paths: Vec<_> = log.borrow().iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec![vec![Key::from("value")], vec![Key::from("mirror")]]);
        assert_eq!(a.get("mirror"), Value::from(3));
    }

    #[test]
    fn methods_are_bound_and_cached() {
        let rt = Runtime::new();
        let class = Class::builder("Counter")
            .field("count", 0)
            .method("inc", |this, _| {
                let next = this.get("count").as_number().unwrap_or(0.0) + 1.0;
                this.set("count", next);
                Ok(Value::from(next))
            })
            .build();
        let raw = RawObject::instance(&class);
        raw.set("count", 0);
        let counter = observed(&rt, &raw);
        let (log, _watch) = record(&counter);

        let first = counter.get("inc");
        let second = counter.get("inc");
        assert_eq!(first, second);
        assert!(first.as_bound().is_some());

        assert_eq!(counter.call("inc", &[]).expect("inc"), Value::from(1));
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(log.borrow()[0].path, ["count"]);
    }

    #[test]
    fn writing_a_method_key_invalidates_binding() {
        let rt = Runtime::new();
        let f = Method::new(|_, _| Ok(Value::from(1)));
        let g = Method::new(|_, _| Ok(Value::from(2)));
        let obj = observed(&rt, &RawObject::new().with("f", f));

        let before = obj.get("f");
        obj.set("f", g);
        let after = obj.get("f");
        assert_ne!(before, after);
        assert_eq!(obj.call("f", &[]).expect("call"), Value::from(2));
    }

    #[test]
    fn bound_method_does_not_keep_receiver_alive() {
        let rt = Runtime::new();
        let class = Class::builder("Echo")
            .method("echo", |_, args| Ok(args.first().cloned().unwrap_or_default()))
            .build();
        let bound = {
            let obj = observed(&rt, &RawObject::instance(&class));
            obj.get("echo").as_bound().cloned().expect("bound")
        };
        rt.reclaim();
        assert!(bound.receiver().is_none());
        assert!(matches!(bound.call(&[]), Err(ReactiveError::Reclaimed)));
    }

    #[test]
    fn calling_a_non_function_fails() {
        let rt = Runtime::new();
        let obj = observed(&rt, &RawObject::new().with("value", 1));
        let err = obj.call("value", &[]).expect_err("not callable");
        assert!(matches!(err, ReactiveError::NotCallable { .. }));
    }

    #[test]
    fn getters_receive_the_wrapper() {
        let rt = Runtime::new();
        let class = Class::builder("Doubler")
            .getter("double", |this| {
                Value::from(this.get("n").as_number().unwrap_or(0.0) * 2.0)
            })
            .build();
        let raw = RawObject::instance(&class).with("n", 4);
        let obj = observed(&rt, &raw);
        assert_eq!(obj.get("double"), Value::from(8));
    }

    #[test]
    fn protected_keys_bypass_tracking() {
        let rt = Runtime::new();
        let class = Class::builder("Thing").build();
        let obj = observed(&rt, &RawObject::instance(&class).with("own", 1));

        assert_eq!(obj.get("constructor"), Value::Class(class));
        assert_eq!(
            obj.call("hasOwnProperty", &[Value::from("own")]).expect("call"),
            Value::from(true)
        );
        assert_eq!(
            obj.call("hasOwnProperty", &[Value::from("missing")]).expect("call"),
            Value::from(false)
        );
        assert_eq!(rt.stats().watchers, 0);
    }

    #[test]
    fn array_search_falls_back_to_origins() {
        let rt = Runtime::new();
        let item = RawObject::new();
        let wrapped_item = observed(&rt, &item);
        let list = observed(&rt, &RawObject::array([Value::from(1), Value::from(&item)]));

        assert_eq!(list.index_of(&Value::from(&item)), Some(1));
        assert_eq!(list.index_of(&Value::from(&wrapped_item)), Some(1));
        assert!(list.includes(&Value::from(&wrapped_item)));
        assert_eq!(list.last_index_of(&Value::from(&wrapped_item)), Some(1));
        assert_eq!(list.index_of(&Value::from(2)), None);

        // Elements stored wrapped are found by their raw identity too.
        let holder = RawObject::array([Value::from(&wrapped_item)]);
        let holder = observed(&rt, &holder);
        assert_eq!(holder.index_of(&Value::from(&item)), Some(0));
    }

    #[test]
    fn array_search_through_get() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array([1, 2, 1]));
        assert_eq!(
            list.call("lastIndexOf", &[Value::from(1)]).expect("call"),
            Value::from(2)
        );
        assert_eq!(
            list.call("indexOf", &[Value::from(7)]).expect("call"),
            Value::from(-1)
        );
        assert_eq!(
            list.call("includes", &[Value::from(f64::NAN)]).expect("call"),
            Value::from(false)
        );
    }

    #[test]
    fn includes_finds_nan() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array([f64::NAN]));
        assert!(list.includes(&Value::from(f64::NAN)));
        assert_eq!(list.index_of(&Value::from(f64::NAN)), None);
    }

    #[test]
    fn array_writes_notify_by_index() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array([1, 2]));
        let (log, _watch) = record(&list);

        assert_eq!(list.push(3), 3);
        list.set(0usize, 10);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].path, vec![Key::Index(2)]);
        assert_eq!(log[1].path, vec![Key::Index(0)]);
        assert_eq!(log[1].old, Value::from(1));
    }

    #[test]
    fn pushing_undefined_grows_the_array() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array([1, 2]));
        let (log, _watch) = record(&list);

        assert_eq!(list.push(Value::Undefined), 3);
        assert_eq!(list.origin().len(), 3);
        assert!(list.has_own_property(2usize));
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].path, ["length"]);
        assert_eq!(log[0].old, Value::from(2));
        assert_eq!(log[0].new, Value::from(3));
    }

    #[test]
    fn pushed_objects_are_child_watched() {
        let rt = Runtime::new();
        let item = RawObject::new().with("v", 0);
        let list = observed(&rt, &RawObject::array(Vec::<Value>::new()));
        let (log, _watch) = record(&list);

        assert_eq!(list.push(&item), 1);
        observed(&rt, &item).set("v", 1);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].path, vec![Key::Index(0)]);
        assert_eq!(log[1].path, vec![Key::Index(0), Key::from("v")]);
    }

    #[test]
    fn huge_index_and_length_writes_do_not_allocate_or_panic() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array([1, 2]));
        let (log, _watch) = record(&list);

        list.set(usize::MAX, 1);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(usize::MAX), Value::from(1));

        list.set(1_000_000_000usize, 3);
        assert_eq!(list.len(), 1_000_000_001);
        assert_eq!(list.index_of(&Value::from(3)), Some(1_000_000_000));
        assert!(list.includes(&Value::Undefined));

        for bad in [f64::INFINITY, 1e300, -1.0, 0.5] {
            let err = list.try_set("length", bad).expect_err("invalid length");
            assert!(matches!(err, ReactiveError::InvalidArrayLength { .. }));
            list.set("length", bad);
        }
        assert_eq!(list.len(), 1_000_000_001);
        assert_eq!(log.borrow().len(), 2);

        list.set("length", 2);
        assert_eq!(list.len(), 2);
        assert!(!list.includes(&Value::Undefined));
        assert_eq!(log.borrow().len(), 3);
        assert_eq!(log.borrow()[2].path, ["length"]);
    }

    #[test]
    fn numeric_names_read_array_elements() {
        let rt = Runtime::new();
        let list = observed(&rt, &RawObject::array(["a", "b"]));
        let (log, _watch) = record(&list);

        assert_eq!(list.get("1"), Value::from("b"));
        list.set("0", "z");
        assert_eq!(list.get(0usize), Value::from("z"));
        assert_eq!(log.borrow()[0].path, vec![Key::Index(0)]);
    }

    #[test]
    fn array_elements_compose_paths() {
        let rt = Runtime::new();
        let item = RawObject::new().with("done", false);
        let root = observed(&rt, &RawObject::new().with("items", RawObject::array([&item])));
        let (log, _watch) = record(&root);

        let items = root.get("items");
        let first = items.as_observed().expect("wrapped").get(0usize);
        first.as_observed().expect("wrapped").set("done", true);

        assert_eq!(
            log.borrow()[0].path,
            vec![Key::from("items"), Key::Index(0), Key::from("done")]
        );
    }

    #[test]
    fn unwatch_stops_notifications() {
        let rt = Runtime::new();
        let obj = observed(&rt, &RawObject::new());
        let count = Rc::new(Cell::new(0));
        let count_clone = Rc::clone(&count);
        let watch = obj.watch(move |_| count_clone.set(count_clone.get() + 1));
        assert!(watch.is_active());

        obj.set("a", 1);
        watch.unwatch();
        obj.set("a", 2);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn watching_a_primitive_is_inert() {
        let rt = Runtime::new();
        let watch = rt.watch(&Value::from(1), |_| {});
        assert!(!watch.is_active());
        assert!(watch.target().is_none());
        watch.unwatch();
    }

    #[test]
    fn reclaim_releases_proxy_state_and_child_watchers() {
        let rt = Runtime::new();
        let child = RawObject::new();
        {
            let root = observed(&rt, &RawObject::new().with("child", &child));
            let _ = root.get("child");
            assert_eq!(rt.stats().watchers, 1);
        }
        assert_eq!(rt.reclaim(), 1);
        let stats = rt.stats();
        assert_eq!(stats.watchers, 0);
        assert_eq!(stats.proxies, 1);

        drop(child);
        assert_eq!(rt.reclaim(), 1);
        assert_eq!(rt.stats().proxies, 0);
    }
}
