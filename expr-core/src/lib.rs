//! Shared dynamic value domain and filter registry.
//!
//! `Value` is the untyped runtime representation expressions evaluate to and
//! `Bindings` is the shared, mutable key-value container behind both `scope`
//! and `locals` objects. Both the compiler (`expr-compiler`) and the scope
//! runtime (`expr-rt`) depend on this crate so that neither has to re-derive
//! the value domain.

pub mod filter;
pub mod value;

pub use filter::{Filter, FilterRegistry};
pub use value::{
    deep_clone, deep_equals, empty_bindings, loose_equals, strict_equals, Bindings, FunctionKind,
    NativeFunction, Value,
};
