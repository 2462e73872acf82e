#![forbid(unsafe_code)]

//! Dynamic values, property keys, and change paths.
//!
//! [`Value`] is the universe of things a property can hold. Equality on
//! `Value` is strict identity: primitives compare by value (`NaN` is never
//! equal to itself), objects by allocation, and an [`Observed`] wrapper is a
//! *different* value from the [`RawObject`] it wraps. Use
//! [`Value::same_origin`] when wrappers should be looked through.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::{Class, Method, RawObject};
use crate::observe::{BoundMethod, Observed};
use crate::origin::origin;

static NEXT_SYMBOL_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque, process-unique property key.
#[derive(Clone)]
pub struct Symbol {
    id: u64,
    description: Option<Rc<str>>,
}

impl Symbol {
    #[must_use]
    pub fn new(description: impl Into<Rc<str>>) -> Self {
        Self {
            id: NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed),
            description: Some(description.into()),
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed),
            description: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.description.as_deref().unwrap_or(""))
    }
}

/// One past the largest array index; also the largest array length.
pub const MAX_ARRAY_LENGTH: usize = u32::MAX as usize;

/// A property key: a name, an array index, or a symbol.
///
/// Names in canonical index form (`"0"`, `"17"`, but not `"017"` or `"-1"`)
/// below [`MAX_ARRAY_LENGTH`] are converted to [`Key::Index`], so `"0"` and
/// `0` name the same property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(Rc<str>),
    Index(usize),
    Symbol(Symbol),
}

impl Key {
    #[must_use]
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            _ => None,
        }
    }

    /// Whether this key addresses an array element rather than a named
    /// property.
    #[must_use]
    pub fn is_array_index(&self) -> bool {
        matches!(self, Self::Index(index) if *index < MAX_ARRAY_LENGTH)
    }

    /// Interpret a dynamic value as a key (used by `hasOwnProperty`).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(Self::from(s.clone())),
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < MAX_ARRAY_LENGTH as f64 => {
                Some(Self::Index(*n as usize))
            }
            Value::Number(n) => Some(Self::from(n.to_string())),
            Value::Symbol(sym) => Some(Self::Symbol(sym.clone())),
            _ => None,
        }
    }
}

fn canonical_index(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    let canonical = !bytes.is_empty()
        && bytes.iter().all(u8::is_ascii_digit)
        && (bytes.len() == 1 || bytes[0] != b'0');
    if !canonical {
        return None;
    }
    name.parse::<usize>()
        .ok()
        .filter(|index| *index < MAX_ARRAY_LENGTH)
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        canonical_index(name).map_or_else(|| Self::Name(name.into()), Self::Index)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        canonical_index(&name).map_or_else(|| Self::Name(name.into()), Self::Index)
    }
}

impl From<Rc<str>> for Key {
    fn from(name: Rc<str>) -> Self {
        canonical_index(&name).map_or(Self::Name(name), Self::Index)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<Symbol> for Key {
    fn from(symbol: Symbol) -> Self {
        Self::Symbol(symbol)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl PartialEq<str> for Key {
    fn eq(&self, other: &str) -> bool {
        match self {
            Self::Name(name) => &**name == other,
            Self::Index(index) => canonical_index(other) == Some(*index),
            Self::Symbol(_) => false,
        }
    }
}

impl PartialEq<&str> for Key {
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(index) => write!(f, "{index}"),
            Self::Symbol(symbol) => write!(f, "{symbol}"),
        }
    }
}

/// Ordered keys from the notified object down to the mutated property.
pub type Path = Vec<Key>;

/// Renders a path as `a.b.c`.
pub struct PathDisplay<'a>(pub &'a [Key]);

impl fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

/// A dynamic property value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Symbol(Symbol),
    /// A raw object; reads and writes through it are not tracked.
    Object(RawObject),
    /// A tracked wrapper around a raw object.
    Observed(Observed),
    /// A raw function, as stored on an object or its class.
    Function(Method),
    /// A function bound to an observed receiver, as returned by reads.
    Bound(BoundMethod),
    Class(Class),
}

impl Value {
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Whether this is an object, raw or observed.
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Observed(_))
    }

    #[must_use]
    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_) | Self::Bound(_))
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&RawObject> {
        match self {
            Self::Object(raw) => Some(raw),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_observed(&self) -> Option<&Observed> {
        match self {
            Self::Observed(observed) => Some(observed),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bound(&self) -> Option<&BoundMethod> {
        match self {
            Self::Bound(bound) => Some(bound),
            _ => None,
        }
    }

    /// Identity comparison after resolving both sides to their origin.
    #[must_use]
    pub fn same_origin(&self, other: &Value) -> bool {
        origin(self) == origin(other)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Object(_) | Self::Observed(_) => "object",
            Self::Function(_) | Self::Bound(_) | Self::Class(_) => "function",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => RawObject::ptr_eq(a, b),
            (Self::Observed(a), Self::Observed(b)) => Observed::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Bound(a), Self::Bound(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => Class::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Symbol(sym) => write!(f, "{sym:?}"),
            Self::Object(raw) => write!(f, "Object({})", raw.id()),
            Self::Observed(observed) => write!(f, "Observed({})", observed.id()),
            Self::Function(_) => f.write_str("Function"),
            Self::Bound(bound) => write!(f, "Bound({})", bound.name()),
            Self::Class(class) => write!(f, "Class({})", class.name()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Symbol(sym) => write!(f, "{sym}"),
            Self::Object(raw) => write!(f, "[object {}]", raw.id()),
            Self::Observed(observed) => write!(f, "[object {}]", observed.id()),
            Self::Function(_) | Self::Bound(_) => f.write_str("[function]"),
            Self::Class(class) => write!(f, "[class {}]", class.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s.into())
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Self::Str(s)
    }
}

impl From<Symbol> for Value {
    fn from(symbol: Symbol) -> Self {
        Self::Symbol(symbol)
    }
}

impl From<RawObject> for Value {
    fn from(raw: RawObject) -> Self {
        Self::Object(raw)
    }
}

impl From<&RawObject> for Value {
    fn from(raw: &RawObject) -> Self {
        Self::Object(raw.clone())
    }
}

impl From<Observed> for Value {
    fn from(observed: Observed) -> Self {
        Self::Observed(observed)
    }
}

impl From<&Observed> for Value {
    fn from(observed: &Observed) -> Self {
        Self::Observed(observed.clone())
    }
}

impl From<Method> for Value {
    fn from(method: Method) -> Self {
        Self::Function(method)
    }
}

impl From<BoundMethod> for Value {
    fn from(bound: BoundMethod) -> Self {
        Self::Bound(bound)
    }
}

impl From<Class> for Value {
    fn from(class: Class) -> Self {
        Self::Class(class)
    }
}

impl From<&Value> for Value {
    fn from(value: &Value) -> Self {
        value.clone()
    }
}
