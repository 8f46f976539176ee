//! Filter registry — name to filter-function mapping.

use crate::value::Value;
use std::collections::HashMap;
use std::rc::Rc;

/// A filter: a unary function of its input value plus any pipe arguments.
pub type Filter = Rc<dyn Fn(&Value, &[Value]) -> Value>;

struct FilterEntry {
    func: Filter,
    stateful: bool,
}

/// Maps filter names to cached filter functions. A factory is invoked
/// exactly once and its product cached, so registration cost (building
/// closures, precompiling regexes, etc.) is paid once per name rather than
/// per use.
#[derive(Default)]
pub struct FilterRegistry {
    entries: HashMap<String, FilterEntry>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single filter under `name`. `stateful` marks the filter as
    /// non-constant and opaque to the AST's `toWatch` analysis: a `Filter`
    /// node's `constant`/`toWatch` depend on the callee's statelessness.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        stateful: bool,
        factory: impl FnOnce() -> Filter,
    ) {
        let func = factory();
        self.entries
            .insert(name.into(), FilterEntry { func, stateful });
    }

    /// Bulk-register from an iterator of `(name, stateful, filter)`, for
    /// installing a whole set of factories at once.
    pub fn register_all<I>(&mut self, filters: I)
    where
        I: IntoIterator<Item = (&'static str, bool, Filter)>,
    {
        for (name, stateful, func) in filters {
            self.entries
                .insert(name.to_string(), FilterEntry { func, stateful });
        }
    }

    pub fn filter(&self, name: &str) -> Option<Filter> {
        self.entries.get(name).map(|e| e.func.clone())
    }

    /// Whether calling this filter with constant arguments yields a constant
    /// result — consulted by the AST's `constant`/`toWatch` analysis for
    /// `Filter` nodes. An unregistered name is treated as stateful so the
    /// analysis stays conservative rather than wrongly folding it away.
    pub fn is_stateless(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| !e.stateful)
    }
}
