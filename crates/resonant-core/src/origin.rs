#![forbid(unsafe_code)]

//! Origin tracking: recovering the raw object behind a wrapper.

use crate::object::RawObject;
use crate::observe::Observed;
use crate::value::Value;

/// Anything that may stand for a raw object.
pub trait Origin {
    /// The underlying raw object, or `None` for non-objects.
    fn origin_object(&self) -> Option<RawObject>;
}

impl Origin for RawObject {
    fn origin_object(&self) -> Option<RawObject> {
        Some(self.clone())
    }
}

impl Origin for Observed {
    fn origin_object(&self) -> Option<RawObject> {
        Some(self.origin().clone())
    }
}

impl Origin for Value {
    fn origin_object(&self) -> Option<RawObject> {
        match self {
            Value::Object(raw) => Some(raw.clone()),
            Value::Observed(observed) => Some(observed.origin().clone()),
            _ => None,
        }
    }
}

impl<T: Origin + ?Sized> Origin for &T {
    fn origin_object(&self) -> Option<RawObject> {
        (**self).origin_object()
    }
}

/// Strips one layer of wrapping. Raw objects and primitives are returned as is.
#[must_use]
pub fn origin(value: &Value) -> Value {
    match value {
        Value::Observed(observed) => Value::Object(observed.origin().clone()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;

    #[test]
    fn raw_and_primitives_are_their_own_origin() {
        let raw = RawObject::new();
        assert_eq!(origin(&Value::from(&raw)), Value::from(&raw));
        assert_eq!(origin(&Value::from(3)), Value::from(3));
        assert!(Value::from(3).origin_object().is_none());
    }

    #[test]
    fn observed_resolves_to_raw() {
        let rt = Runtime::new();
        let raw = RawObject::new();
        let observed = rt.observe_object(&raw).expect("plain objects are observable");

        let wrapped = Value::from(&observed);
        assert_ne!(wrapped, Value::from(&raw));
        assert_eq!(origin(&wrapped), Value::from(&raw));
        assert!(wrapped.same_origin(&Value::from(&raw)));
        assert!(RawObject::ptr_eq(
            &observed.origin_object().expect("object"),
            &raw
        ));
    }
}
