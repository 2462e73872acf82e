#![forbid(unsafe_code)]

//! Resonant public facade crate.
//!
//! This crate provides the stable surface area for users. Everything lives in
//! [`resonant_core`] and is re-exported here; the [`prelude`] pulls in the
//! types most code touches.

pub use resonant_core::*;

pub mod prelude {
    pub use resonant_core::{
        ChangeEvent, Class, Key, Observed, Origin, Provider, RawObject, ReactiveError, Runtime,
        RuntimeConfig, Value, Watch, origin,
    };
}
