//! Sandbox guards — runtime checks invoked by evaluators.
//!
//! These exist because an expression's `scope`/`locals` graph is host data:
//! without them, an expression like `a.constructor.constructor('return
//! this')()` could reach the host global and anything reachable from it.
//! Three predicates, each failing with [`SecurityError`], applied at every
//! identifier read, member dereference, call argument/result, and
//! assignment RHS.

use expr_core::{FunctionKind, Value};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SecurityError {
    #[error("referencing '{0}' is disallowed")]
    BlacklistedMemberName(String),
    #[error("referencing a host global, function constructor, reflection API, or DOM node is disallowed")]
    UnsafeObject,
    #[error("calling .call/.apply/.bind or the function constructor is disallowed")]
    UnsafeFunction,
}

const BLACKLISTED_NAMES: &[&str] = &[
    "constructor",
    "__proto__",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

/// Rejects the six blacklisted member names, whether reached via bare
/// identifier or member access.
pub fn ensure_safe_member_name(name: &str) -> Result<(), SecurityError> {
    if BLACKLISTED_NAMES.contains(&name) {
        Err(SecurityError::BlacklistedMemberName(name.to_string()))
    } else {
        Ok(())
    }
}

fn get_property(obj: &Value, name: &str) -> Value {
    match obj {
        Value::Object(map) => map.borrow().get(name).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

fn looks_like_host_global(obj: &Value) -> bool {
    get_property(obj, "document").is_truthy()
        && get_property(obj, "location").is_truthy()
        && get_property(obj, "alert").is_truthy()
        && get_property(obj, "setTimeout").is_truthy()
}

fn is_function_constructor_identity(obj: &Value) -> bool {
    match obj {
        Value::Object(map) => match map.borrow().get("constructor") {
            Some(Value::Object(ctor)) => Rc::ptr_eq(ctor, map),
            _ => false,
        },
        _ => false,
    }
}

fn exposes_reflection(obj: &Value) -> bool {
    matches!(obj, Value::Object(map) if {
        let map = map.borrow();
        map.contains_key("getOwnPropertyNames") || map.contains_key("getOwnPropertyDescriptor")
    })
}

fn looks_like_dom_node(obj: &Value) -> bool {
    match obj {
        Value::Object(map) => {
            let map = map.borrow();
            matches!(map.get("nodeType"), Some(Value::Number(_)))
                && matches!(map.get("nodeName"), Some(Value::String(_)))
        }
        _ => false,
    }
}

/// Rejects a truthy `obj` that looks like a host global, the function
/// constructor's own identity, a reflection entry point, or a DOM node.
/// Falsy values (including `undefined`/`null`) always pass — there is
/// nothing to traverse into.
pub fn ensure_safe_object(obj: &Value) -> Result<(), SecurityError> {
    if !obj.is_truthy() {
        return Ok(());
    }
    if matches!(obj, Value::Host(_)) {
        return Err(SecurityError::UnsafeObject);
    }
    if looks_like_host_global(obj)
        || is_function_constructor_identity(obj)
        || exposes_reflection(obj)
        || looks_like_dom_node(obj)
    {
        return Err(SecurityError::UnsafeObject);
    }
    Ok(())
}

/// Rejects the function constructor identity and the three bound-call
/// primitives by identity (`FunctionKind`), independent of member name.
pub fn ensure_safe_function(value: &Value) -> Result<(), SecurityError> {
    if let Value::Function(f) = value {
        if f.kind != FunctionKind::Plain {
            return Err(SecurityError::UnsafeFunction);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expr_core::NativeFunction;
    use indexmap::IndexMap;

    fn host_global() -> Value {
        let mut map = IndexMap::new();
        map.insert("document".to_string(), Value::Bool(true));
        map.insert("location".to_string(), Value::Bool(true));
        map.insert("alert".to_string(), Value::Bool(true));
        map.insert("setTimeout".to_string(), Value::Bool(true));
        Value::object(map)
    }

    #[test]
    fn blacklists_member_names() {
        for name in BLACKLISTED_NAMES {
            assert!(ensure_safe_member_name(name).is_err());
        }
        assert!(ensure_safe_member_name("foo").is_ok());
    }

    #[test]
    fn rejects_host_global_shape() {
        assert!(ensure_safe_object(&host_global()).is_err());
    }

    #[test]
    fn rejects_self_referential_constructor() {
        let map = Rc::new(std::cell::RefCell::new(IndexMap::new()));
        map.borrow_mut()
            .insert("constructor".to_string(), Value::Object(map.clone()));
        assert!(ensure_safe_object(&Value::Object(map)).is_err());
    }

    #[test]
    fn rejects_reflection_entry_points() {
        let mut map = IndexMap::new();
        map.insert("getOwnPropertyNames".to_string(), Value::Bool(true));
        assert!(ensure_safe_object(&Value::object(map)).is_err());
    }

    #[test]
    fn rejects_dom_node_shape() {
        let mut map = IndexMap::new();
        map.insert("nodeType".to_string(), Value::Number(1.0));
        map.insert("nodeName".to_string(), Value::string("DIV"));
        assert!(ensure_safe_object(&Value::object(map)).is_err());
    }

    #[test]
    fn allows_plain_objects() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Number(1.0));
        assert!(ensure_safe_object(&Value::object(map)).is_ok());
    }

    #[test]
    fn rejects_bound_call_primitives() {
        for kind in [FunctionKind::Call, FunctionKind::Apply, FunctionKind::Bind] {
            let f = Value::Function(Rc::new(NativeFunction::forbidden(kind)));
            assert!(ensure_safe_function(&f).is_err());
        }
    }
}
