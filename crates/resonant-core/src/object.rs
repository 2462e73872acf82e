#![forbid(unsafe_code)]

//! Raw objects and class definitions.
//!
//! A [`RawObject`] is the untracked side of the object graph. Reads and
//! writes through it never notify anyone; they are the plain reflective
//! lookup that the observation engine delegates to.
//!
//! # Lifetime
//!
//! Raw objects are reference counted. Once the runtime tracks an object
//! (observes it, watches it, or caches it) the object carries a weak link to
//! that runtime's reclaim queue, and dropping the last strong handle enqueues
//! its [`ObjectId`]. Draining the queue is the runtime's job; see
//! [`Runtime::reclaim`](crate::Runtime::reclaim).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use tracing::warn;

use crate::cache::Init;
use crate::error::{self, BoxError, ReactiveError};
use crate::observe::Observed;
use crate::value::{Key, MAX_ARRAY_LENGTH, Value};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// Allocation identity of a raw object. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Built-in shape of an object.
///
/// Collection and concurrency primitives keep their state in internal slots
/// that a tracking wrapper cannot see, so the runtime passes them through
/// unobserved (see [`RuntimeConfig::unsafe_kinds`](crate::RuntimeConfig)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectKind {
    #[default]
    Plain,
    Array,
    Map,
    Set,
    WeakMap,
    WeakSet,
    Promise,
}

impl ObjectKind {
    /// Kinds that are unsafe to wrap transparently.
    pub const UNSAFE_TO_PROXY: [ObjectKind; 5] = [
        ObjectKind::Promise,
        ObjectKind::WeakMap,
        ObjectKind::WeakSet,
        ObjectKind::Map,
        ObjectKind::Set,
    ];
}

pub(crate) type ReclaimQueue = RefCell<Vec<ObjectId>>;

/// Own properties. Array elements live in a dense prefix followed by a
/// sparse tail; every sparse index is past the end of the prefix, and
/// `length` is past every element.
#[derive(Default)]
struct Slots {
    props: AHashMap<Key, Value>,
    elements: Vec<Value>,
    sparse: BTreeMap<usize, Value>,
    length: usize,
}

impl Slots {
    fn element(&self, index: usize) -> Option<&Value> {
        self.elements.get(index).or_else(|| self.sparse.get(&index))
    }

    fn has_element(&self, index: usize) -> bool {
        index < self.elements.len() || self.sparse.contains_key(&index)
    }

    /// `index` must be below [`MAX_ARRAY_LENGTH`].
    fn set_element(&mut self, index: usize, value: Value) -> Option<Value> {
        let displaced = if let Some(slot) = self.elements.get_mut(index) {
            Some(std::mem::replace(slot, value))
        } else if index == self.elements.len() {
            self.elements.push(value);
            while let Some(next) = self.sparse.remove(&self.elements.len()) {
                self.elements.push(next);
            }
            None
        } else {
            self.sparse.insert(index, value)
        };
        self.length = self.length.max(index + 1);
        displaced
    }

    fn delete_element(&mut self, index: usize) -> Option<Value> {
        match self.elements.get_mut(index) {
            Some(slot) => Some(std::mem::take(slot)),
            None => self.sparse.remove(&index),
        }
    }

    fn set_length(&mut self, length: usize) -> Vec<Value> {
        let mut removed = self.elements.split_off(length.min(self.elements.len()));
        removed.extend(self.sparse.split_off(&length).into_values());
        self.length = length;
        removed
    }
}

/// A valid array length: an integral number in `0..=MAX_ARRAY_LENGTH`.
fn array_length(value: &Value) -> Option<usize> {
    value
        .as_number()
        .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n <= MAX_ARRAY_LENGTH as f64)
        .map(|n| n as usize)
}

pub(crate) struct RawCell {
    id: ObjectId,
    kind: ObjectKind,
    class: Option<Class>,
    slots: RefCell<Slots>,
    reclaim_hooks: RefCell<Vec<Weak<ReclaimQueue>>>,
}

impl Drop for RawCell {
    fn drop(&mut self) {
        for hook in self.reclaim_hooks.get_mut().drain(..) {
            let Some(queue) = hook.upgrade() else {
                continue;
            };
            match queue.try_borrow_mut() {
                Ok(mut queue) => queue.push(self.id),
                Err(_) => warn!(object = %self.id, "reclaim queue busy, dropped object not enqueued"),
            }
        }
    }
}

/// Shared handle to a raw, untracked object.
#[derive(Clone)]
pub struct RawObject {
    cell: Rc<RawCell>,
}

impl RawObject {
    fn with_kind(kind: ObjectKind, class: Option<Class>) -> Self {
        Self {
            cell: Rc::new(RawCell {
                id: ObjectId::next(),
                kind,
                class,
                slots: RefCell::new(Slots::default()),
                reclaim_hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A new plain object with no properties.
    #[must_use]
    pub fn new() -> Self {
        Self::with_kind(ObjectKind::Plain, None)
    }

    /// A new array holding `items`.
    #[must_use]
    pub fn array<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        let raw = Self::with_kind(ObjectKind::Array, None);
        {
            let mut slots = raw.cell.slots.borrow_mut();
            slots.elements = items.into_iter().map(Into::into).collect();
            slots.length = slots.elements.len();
        }
        raw
    }

    /// A new object of a built-in kind, e.g. a map-like or promise-like object.
    #[must_use]
    pub fn of_kind(kind: ObjectKind) -> Self {
        Self::with_kind(kind, None)
    }

    /// A blank instance of `class`; fields and constructor are not run.
    pub(crate) fn instance(class: &Class) -> Self {
        Self::with_kind(class.base_kind(), Some(class.clone()))
    }

    /// Builder-style raw assignment.
    #[must_use]
    pub fn with(self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.cell.id
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.cell.kind
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        self.cell.kind == ObjectKind::Array
    }

    #[must_use]
    pub fn class(&self) -> Option<&Class> {
        self.cell.class.as_ref()
    }

    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.cell, &b.cell)
    }

    /// Own property lookup. Arrays expose their elements by index and their
    /// length under `"length"`; a hole reads as absent.
    #[must_use]
    pub fn get_own(&self, key: &Key) -> Option<Value> {
        let slots = self.cell.slots.borrow();
        if self.is_array() {
            match key {
                Key::Index(index) if key.is_array_index() => {
                    return slots.element(*index).cloned();
                }
                Key::Name(name) if &**name == "length" => {
                    return Some(Value::from(slots.length));
                }
                _ => {}
            }
        }
        slots.props.get(key).cloned()
    }

    /// Own property, falling back to a class method. Getters are not run.
    #[must_use]
    pub fn get(&self, key: &Key) -> Value {
        if let Some(value) = self.get_own(key) {
            return value;
        }
        key.as_name()
            .and_then(|name| self.method(name))
            .map(Value::Function)
            .unwrap_or_default()
    }

    /// Assigns an own property and returns the displaced value.
    ///
    /// Writing past the end of an array extends its length and leaves holes
    /// in between. Writing to an array's `"length"` truncates or extends it;
    /// anything but an integral number up to [`MAX_ARRAY_LENGTH`] is rejected
    /// with [`ReactiveError::InvalidArrayLength`]. Index keys at or past
    /// `MAX_ARRAY_LENGTH` are plain properties and leave the length alone.
    pub fn try_set(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> error::Result<Option<Value>> {
        let key = key.into();
        let value = value.into();
        let mut slots = self.cell.slots.borrow_mut();
        if self.is_array() {
            match &key {
                Key::Index(index) if key.is_array_index() => {
                    return Ok(slots.set_element(*index, value));
                }
                Key::Name(name) if &**name == "length" => {
                    let length =
                        array_length(&value).ok_or_else(|| ReactiveError::InvalidArrayLength {
                            value: value.to_string(),
                        })?;
                    let previous = slots.length;
                    let removed = slots.set_length(length);
                    drop(slots);
                    drop(removed);
                    return Ok(Some(Value::from(previous)));
                }
                _ => {}
            }
        }
        Ok(slots.props.insert(key, value))
    }

    /// [`try_set`](Self::try_set) that ignores rejected writes, leaving the
    /// object untouched.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Option<Value> {
        self.try_set(key, value).ok().flatten()
    }

    /// Removes an own property and returns it. Deleting an element of the
    /// dense prefix leaves `undefined` in its place; deleting past it leaves
    /// a hole. An array's `"length"` cannot be deleted.
    pub fn delete(&self, key: &Key) -> Option<Value> {
        let mut slots = self.cell.slots.borrow_mut();
        if self.is_array() {
            match key {
                Key::Index(index) if key.is_array_index() => {
                    return slots.delete_element(*index);
                }
                Key::Name(name) if &**name == "length" => return None,
                _ => {}
            }
        }
        slots.props.remove(key)
    }

    /// Whether `delete` is allowed on `key` at all.
    #[must_use]
    pub fn is_deletable(&self, key: &Key) -> bool {
        !(self.is_array() && *key == "length")
    }

    #[must_use]
    pub fn has_own(&self, key: &Key) -> bool {
        let slots = self.cell.slots.borrow();
        if self.is_array() {
            match key {
                Key::Index(index) if key.is_array_index() => {
                    return slots.has_element(*index);
                }
                Key::Name(name) if &**name == "length" => return true,
                _ => {}
            }
        }
        slots.props.contains_key(key)
    }

    /// Own keys: array indices in order, then named keys in unspecified order.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        let slots = self.cell.slots.borrow();
        (0..slots.elements.len())
            .chain(slots.sparse.keys().copied())
            .map(Key::Index)
            .chain(slots.props.keys().cloned())
            .collect()
    }

    /// Array length (zero for non-arrays).
    #[must_use]
    pub fn len(&self) -> usize {
        self.cell.slots.borrow().length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the array elements in index order; holes are skipped.
    #[must_use]
    pub fn elements(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    /// Snapshot of the present array elements with their indices.
    #[must_use]
    pub fn entries(&self) -> Vec<(usize, Value)> {
        let slots = self.cell.slots.borrow();
        slots
            .elements
            .iter()
            .cloned()
            .enumerate()
            .chain(slots.sparse.iter().map(|(index, value)| (*index, value.clone())))
            .collect()
    }

    /// Lowest index below the length that holds no element, if any.
    #[must_use]
    pub fn first_hole(&self) -> Option<usize> {
        let slots = self.cell.slots.borrow();
        (slots.elements.len() < slots.length).then_some(slots.elements.len())
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<Method> {
        self.cell.class.as_ref().and_then(|class| class.method(name))
    }

    pub(crate) fn getter(&self, name: &str) -> Option<Getter> {
        self.cell.class.as_ref().and_then(|class| class.getter(name))
    }

    pub(crate) fn downgrade(&self) -> WeakRaw {
        WeakRaw(Rc::downgrade(&self.cell))
    }

    /// Links this object to a runtime's reclaim queue (idempotent).
    pub(crate) fn attach_reclaim_hook(&self, queue: &Rc<ReclaimQueue>) {
        let weak = Rc::downgrade(queue);
        let mut hooks = self.cell.reclaim_hooks.borrow_mut();
        hooks.retain(|hook| hook.strong_count() > 0);
        if !hooks.iter().any(|hook| Weak::ptr_eq(hook, &weak)) {
            hooks.push(weak);
        }
    }
}

impl Default for RawObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawObject")
            .field("id", &self.cell.id)
            .field("kind", &self.cell.kind)
            .field("class", &self.cell.class.as_ref().map(Class::name))
            .finish()
    }
}

/// Non-owning handle to a raw object.
#[derive(Clone)]
pub(crate) struct WeakRaw(Weak<RawCell>);

impl WeakRaw {
    pub(crate) fn upgrade(&self) -> Option<RawObject> {
        self.0.upgrade().map(|cell| RawObject { cell })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

type MethodFn = dyn Fn(&Observed, &[Value]) -> Result<Value, BoxError>;
pub(crate) type Getter = Rc<dyn Fn(&Observed) -> Value>;
type ConstructFn = dyn Fn(&Init<'_>, &[Value]) -> Result<(), BoxError>;

/// A shareable function value. The receiver is always an observed wrapper.
///
/// Equality and hashing are by identity.
#[derive(Clone)]
pub struct Method(Rc<MethodFn>);

impl Method {
    pub fn new(f: impl Fn(&Observed, &[Value]) -> Result<Value, BoxError> + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub(crate) fn invoke(&self, this: &Observed, args: &[Value]) -> Result<Value, BoxError> {
        (self.0)(this, args)
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast::<()>()
    }
}

impl PartialEq for Method {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl Eq for Method {}

impl Hash for Method {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({:p})", self.addr())
    }
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

/// Identity of a class definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u64);

enum FieldInit {
    Value(Value),
    With(Box<dyn Fn() -> Value>),
}

impl FieldInit {
    fn produce(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::With(f) => f(),
        }
    }
}

struct ClassDef {
    id: ClassId,
    name: Rc<str>,
    parent: Option<Class>,
    base: ObjectKind,
    fields: Vec<(Key, FieldInit)>,
    constructor: Option<Box<ConstructFn>>,
    methods: AHashMap<Rc<str>, Method>,
    getters: AHashMap<Rc<str>, Getter>,
}

/// A class: field initializers, a constructor body, methods, and getters.
///
/// Cloning shares the definition.
#[derive(Clone)]
pub struct Class(Rc<ClassDef>);

impl Class {
    #[must_use]
    pub fn builder(name: impl Into<Rc<str>>) -> ClassBuilder {
        ClassBuilder::new(name)
    }

    #[must_use]
    pub fn id(&self) -> ClassId {
        self.0.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Class> {
        self.0.parent.as_ref()
    }

    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// The built-in kind instances get, inherited through the parent chain.
    #[must_use]
    pub fn base_kind(&self) -> ObjectKind {
        match (&self.0.parent, self.0.base) {
            (Some(parent), ObjectKind::Plain) => parent.base_kind(),
            (_, base) => base,
        }
    }

    /// Whether `self` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_subclass_of(&self, ancestor: &Class) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if Class::ptr_eq(class, ancestor) {
                return true;
            }
            current = class.parent();
        }
        false
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<Method> {
        match self.0.methods.get(name) {
            Some(method) => Some(method.clone()),
            None => self.0.parent.as_ref().and_then(|p| p.method(name)),
        }
    }

    pub(crate) fn getter(&self, name: &str) -> Option<Getter> {
        match self.0.getters.get(name) {
            Some(getter) => Some(getter.clone()),
            None => self.0.parent.as_ref().and_then(|p| p.getter(name)),
        }
    }

    fn constructor(&self) -> Option<&ConstructFn> {
        match &self.0.constructor {
            Some(ctor) => Some(ctor.as_ref()),
            None => self.0.parent.as_ref().and_then(|p| p.constructor()),
        }
    }

    fn install_fields(&self, this: &RawObject) {
        if let Some(parent) = &self.0.parent {
            parent.install_fields(this);
        }
        for (key, init) in &self.0.fields {
            this.set(key.clone(), init.produce());
        }
    }

    /// Runs field initializers (root class first), then the nearest constructor.
    pub(crate) fn initialize(&self, init: &Init<'_>, args: &[Value]) -> Result<(), BoxError> {
        self.install_fields(init.this());
        match self.constructor() {
            Some(ctor) => ctor(init, args),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.0.name)
            .field("base", &self.base_kind())
            .field("parent", &self.0.parent.as_ref().map(Class::name))
            .finish()
    }
}

/// Builder for [`Class`].
#[must_use]
pub struct ClassBuilder {
    name: Rc<str>,
    parent: Option<Class>,
    base: ObjectKind,
    fields: Vec<(Key, FieldInit)>,
    constructor: Option<Box<ConstructFn>>,
    methods: AHashMap<Rc<str>, Method>,
    getters: AHashMap<Rc<str>, Getter>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            base: ObjectKind::Plain,
            fields: Vec::new(),
            constructor: None,
            methods: AHashMap::new(),
            getters: AHashMap::new(),
        }
    }

    pub fn extends(mut self, parent: &Class) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Derive from a built-in kind, e.g. a map-like class.
    pub fn base(mut self, kind: ObjectKind) -> Self {
        self.base = kind;
        self
    }

    /// A field initialized to a copy of `value`. Object values are shared
    /// between instances; use [`field_with`](Self::field_with) for fresh ones.
    pub fn field(mut self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), FieldInit::Value(value.into())));
        self
    }

    pub fn field_with(mut self, key: impl Into<Key>, init: impl Fn() -> Value + 'static) -> Self {
        self.fields.push((key.into(), FieldInit::With(Box::new(init))));
        self
    }

    pub fn constructor(
        mut self,
        ctor: impl Fn(&Init<'_>, &[Value]) -> Result<(), BoxError> + 'static,
    ) -> Self {
        self.constructor = Some(Box::new(ctor));
        self
    }

    pub fn method(
        mut self,
        name: impl Into<Rc<str>>,
        f: impl Fn(&Observed, &[Value]) -> Result<Value, BoxError> + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Method::new(f));
        self
    }

    pub fn getter(
        mut self,
        name: impl Into<Rc<str>>,
        f: impl Fn(&Observed) -> Value + 'static,
    ) -> Self {
        self.getters.insert(name.into(), Rc::new(f));
        self
    }

    pub fn build(self) -> Class {
        Class(Rc::new(ClassDef {
            id: ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            parent: self.parent,
            base: self.base,
            fields: self.fields,
            constructor: self.constructor,
            methods: self.methods,
            getters: self.getters,
        }))
    }
}
