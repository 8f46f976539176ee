//! The dynamic value domain.
//!
//! Source expressions are untyped, so at runtime every value — scope
//! property, locals entry, literal, intermediate result — is a [`Value`].
//! Arrays and objects are reference-counted and interior-mutable
//! (`Rc<RefCell<_>>`) because assignment and auto-vivification must be
//! visible through every other `Value` handle that aliases the same
//! container, the same way a host object graph works.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The shared container behind `scope` and `locals`: an ordered map from
/// property name to value. Ordered so object-literal and auto-vivified
/// property order survives iteration (debug rendering, `Object` literal
/// evaluation).
pub type Bindings = Rc<RefCell<IndexMap<String, Value>>>;

/// A fresh, empty bindings container — the usual starting point for a
/// scope's own property map or a `locals` overlay.
pub fn empty_bindings() -> Bindings {
    Rc::new(RefCell::new(IndexMap::new()))
}

/// Distinguishes the handful of function identities the sandbox must reject
/// by identity rather than by name: the bound-call primitives and the
/// function constructor itself. Everything else is a `Plain` native
/// function and call-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Plain,
    Call,
    Apply,
    Bind,
    Constructor,
}

/// A callable value. `call` receives the bound receiver (`this`) and the
/// evaluated argument list; it returns the result or an opaque error message
/// (native functions are host collaborators, not part of the sandboxed
/// expression language, so they don't participate in `EvalError`).
pub struct NativeFunction {
    pub name: Option<String>,
    pub kind: FunctionKind,
    call: Box<dyn Fn(Value, &[Value]) -> Result<Value, String>>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<Option<String>>,
        call: impl Fn(Value, &[Value]) -> Result<Value, String> + 'static,
    ) -> Self {
        NativeFunction {
            name: name.into(),
            kind: FunctionKind::Plain,
            call: Box::new(call),
        }
    }

    /// Build one of the sandbox-forbidden bound-call primitives. These exist
    /// so tests (and a host embedding) can construct the exact values the
    /// sandbox guards must reject, without the crate needing real host
    /// reflection.
    pub fn forbidden(kind: FunctionKind) -> Self {
        assert_ne!(kind, FunctionKind::Plain);
        NativeFunction {
            name: None,
            kind,
            call: Box::new(|_, _| Err("forbidden function invoked".to_string())),
        }
    }

    pub fn invoke(&self, receiver: Value, args: &[Value]) -> Result<Value, String> {
        (self.call)(receiver, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The untyped runtime value domain.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Bindings),
    Function(Rc<NativeFunction>),
    /// A host value the sandbox must never let expressions traverse into,
    /// e.g. a stand-in for `globalThis` or a DOM node in tests.
    Host(Rc<dyn std::any::Any>),
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(map: IndexMap<String, Value>) -> Value {
        Value::Object(Rc::new(RefCell::new(map)))
    }

    pub fn empty_object() -> Value {
        Value::object(IndexMap::new())
    }

    /// JS-style truthiness: everything is truthy except `undefined`, `null`,
    /// `false`, `0`, `NaN`, and `""`. Containers and functions are always
    /// truthy, even when empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Host(_) => true,
        }
    }

    pub fn as_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    pub fn as_object(&self) -> Option<&Bindings> {
        match self {
            Value::Object(b) => Some(b),
            _ => None,
        }
    }

    /// Numeric unary/additive operands substitute `undefined` with `0`;
    /// every other value is taken as-is through `as_number`.
    pub fn numeric_or_zero(&self) -> f64 {
        match self {
            Value::Undefined => 0.0,
            other => other.as_number(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Host(_) => "host",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "fn {}", func.name.as_deref().unwrap_or("<anon>")),
            Value::Host(_) => write!(f, "[host]"),
        }
    }
}

/// Identity/reference comparison for containers and functions, value
/// comparison for scalars — the language's `===`. NaN is *not* equal to
/// itself here; that exception belongs only to the scope's dirty-check
/// comparator (`expr-rt`'s `watch_equals`), not to the language operator.
pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Host(x), Value::Host(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// The language's `==`: like `===` for matching types, with a small
/// numeric/string coercion and a null-ish identification, deliberately far
/// short of full ECMA abstract equality.
pub fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            a.as_number() == b.as_number()
        }
        (Value::Bool(_), _) => loose_equals(&Value::Number(a.as_number()), b),
        (_, Value::Bool(_)) => loose_equals(a, &Value::Number(b.as_number())),
        _ => strict_equals(a, b),
    }
}

/// Structural comparison used only by by-value watchers, with the
/// NaN-equals-NaN exception applied uniformly, not just for numbers at the
/// top level.
pub fn deep_equals(a: &Value, b: &Value, by_value: bool) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            if !by_value {
                return false;
            }
            let (xb, yb) = (x.borrow(), y.borrow());
            xb.len() == yb.len()
                && xb
                    .iter()
                    .zip(yb.iter())
                    .all(|(xi, yi)| deep_equals(xi, yi, true))
        }
        (Value::Object(x), Value::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            if !by_value {
                return false;
            }
            let (xb, yb) = (x.borrow(), y.borrow());
            xb.len() == yb.len()
                && xb
                    .iter()
                    .all(|(k, v)| yb.get(k).is_some_and(|yv| deep_equals(v, yv, true)))
        }
        _ => strict_equals(a, b),
    }
}

/// Snapshot a value for storage as a watcher's `last`. By-value watchers
/// deep-clone containers so a later in-place mutation of the live object
/// doesn't retroactively change the remembered previous value; reference
/// watchers just clone the `Rc` handle.
pub fn deep_clone(value: &Value, by_value: bool) -> Value {
    if !by_value {
        return value.clone();
    }
    match value {
        Value::Array(items) => {
            Value::array(items.borrow().iter().map(|v| deep_clone(v, true)).collect())
        }
        Value::Object(map) => Value::object(
            map.borrow()
                .iter()
                .map(|(k, v)| (k.clone(), deep_clone(v, true)))
                .collect(),
        ),
        other => other.clone(),
    }
}
