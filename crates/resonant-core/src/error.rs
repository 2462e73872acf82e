#![forbid(unsafe_code)]

//! Error types shared by the observation engine and the instance cache.

use thiserror::Error;

/// Boxed user error returned by constructor bodies and methods.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, ReactiveError>;

#[derive(Debug, Error)]
pub enum ReactiveError {
    #[error("constructor of `{class}` failed: {source}")]
    Construct {
        class: String,
        #[source]
        source: BoxError,
    },

    #[error("`{class}` re-entered its own factory while constructing the same key")]
    ReentrantConstruction { class: String },

    #[error("instances of `{class}` are passed through unobserved")]
    Unobservable { class: String },

    #[error("property `{key}` is not callable")]
    NotCallable { key: String },

    #[error("method `{name}` failed: {source}")]
    Method {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("receiver of a bound method was reclaimed")]
    Reclaimed,

    #[error("invalid array length `{value}`")]
    InvalidArrayLength { value: String },
}

impl ReactiveError {
    #[must_use]
    pub fn not_callable(key: impl std::fmt::Display) -> Self {
        Self::NotCallable {
            key: key.to_string(),
        }
    }

    /// Whether the error originated in user code (a constructor or method body).
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Construct { .. } | Self::Method { .. })
    }
}
