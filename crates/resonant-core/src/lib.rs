#![forbid(unsafe_code)]

//! Reactive object graphs with path-qualified change notification.
//!
//! This crate provides the core of Resonant:
//!
//! - [`Runtime::observe`]: wraps a raw object in an [`Observed`] handle that
//!   intercepts reads, writes and deletes, wraps nested objects lazily, and
//!   reports every committed mutation to watchers up the graph.
//! - [`Runtime::watch`]: registers a change callback on an object; the
//!   returned [`Watch`] unregisters it on drop.
//! - [`Runtime::provide`]: a [`Provider`] factory returning one canonical
//!   observed instance per class and argument list, held weakly and evicted
//!   on reclamation or [`Runtime::revoke`].
//!
//! # Architecture
//!
//! All state lives in an explicitly constructed [`Runtime`]
//! (`Rc<RefCell<..>>` inside, single-threaded). Raw objects are reference
//! counted; the runtime holds them only weakly and learns about drops through
//! a reclaim queue drained by [`Runtime::reclaim`].
//!
//! # Invariants
//!
//! 1. `observe(x)` and `observe(observe(x))` are the same wrapper.
//! 2. A write whose old and new values share an origin notifies nobody.
//! 3. Mutating `root.child.value` reports `["child", "value"]` to watchers
//!    on `root` and `["value"]` to watchers on `child`.
//! 4. Each watcher is notified once per mutation, even in cyclic graphs.
//! 5. Pairwise-identical factory arguments yield the same live instance.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use resonant_core::{Class, Runtime};
//!
//! let rt = Runtime::new();
//! let class = Class::builder("Counter").field("value", 0).build();
//! let counter = rt.provide(&class);
//!
//! let a = counter.instance(&["x".into()])?;
//! let b = counter.instance(&["x".into()])?;
//! assert_eq!(a, b);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//! let _watch = a.watch(move |event| sink.borrow_mut().push(event.to_string()));
//! a.set("value", 5);
//! assert_eq!(*seen.borrow(), ["value: 0 -> 5"]);
//! # Ok::<(), resonant_core::ReactiveError>(())
//! ```

pub mod cache;
pub mod error;
pub mod object;
pub mod observe;
pub mod origin;
pub mod registry;
pub mod runtime;
pub mod value;

pub use cache::{Finalization, Init, Provide, Provider};
pub use error::{BoxError, ReactiveError, Result};
pub use object::{Class, ClassBuilder, ClassId, Method, ObjectId, ObjectKind, RawObject};
pub use observe::{BoundMethod, Observed};
pub use origin::{Origin, origin};
pub use registry::{ChangeEvent, Watch, WatcherTag};
pub use runtime::{Runtime, RuntimeConfig, RuntimeStats};
pub use value::{Key, MAX_ARRAY_LENGTH, Path, PathDisplay, Symbol, Value};
