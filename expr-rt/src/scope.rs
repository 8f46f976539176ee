//! The dirty-checking scope: watcher registration, the digest fixed-point
//! loop, and the async/apply/post-digest scheduling queues.
//!
//! A `Scope` is always held as `Rc<Scope>` — `watch`/`watchGroup` hand back a
//! [`WatchHandle`] that deregisters through a `Weak` reference, so a handle
//! outliving its scope is simply inert rather than dangling.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use expr_compiler::{EvalError, Evaluator};
use expr_core::{deep_clone, deep_equals, empty_bindings, Bindings, Value};

use crate::config::DigestConfig;
use crate::error::{ApplyError, DigestLimitError};
use crate::logger::{DigestLogger, EnvDigestLogger};

/// A single watched expression: reads the scope (and whatever else it
/// closes over) and returns the value to compare against last digest's
/// observation.
pub type WatchFn = Rc<dyn Fn(&Scope) -> Result<Value, EvalError>>;

/// Fires when a watcher's value changes. `new` equals `old` (by the same
/// underlying handle, for containers) on a watcher's very first dispatch.
pub type ListenerFn = Rc<dyn Fn(&Value, &Value, &Scope) -> Result<(), EvalError>>;

/// Fires for a `watchGroup` composite watcher. `new`/`old` are parallel
/// arrays of each member watch's current/previous value; on the first
/// dispatch they are the *same* `Rc` instance.
pub type GroupListenerFn = Rc<dyn Fn(&Rc<Vec<Value>>, &Rc<Vec<Value>>, &Scope) -> Result<(), EvalError>>;

/// A unit of scheduled work queued by `evalAsync`/`applyAsync`/`postDigest`:
/// a closure over whatever scope/expression/locals it needs, run for effect.
pub type ScopeAction = Rc<dyn Fn(&Scope) -> Result<Value, EvalError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    None,
    Digest,
    Apply,
}

impl Phase {
    /// The name spec §6 asks the phase-probe to expose.
    pub fn name(self) -> &'static str {
        match self {
            Phase::None => "",
            Phase::Digest => "$digest",
            Phase::Apply => "$apply",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The value a watcher polls each pass: either a plain expression result or
/// a `watchGroup`'s per-slot tuple. Unified so the digest's pass/compare/
/// dispatch logic — including the `lastDirty` early-termination rule — is
/// written once and shared by both.
#[derive(Clone)]
enum Polled {
    Single(Value),
    Group(Rc<Vec<Value>>),
}

fn polled_equal(a: &Polled, b: &Polled, by_value: bool) -> bool {
    match (a, b) {
        (Polled::Single(x), Polled::Single(y)) => deep_equals(x, y, by_value),
        (Polled::Group(x), Polled::Group(y)) => {
            Rc::ptr_eq(x, y)
                || (x.len() == y.len()
                    && x.iter().zip(y.iter()).all(|(xi, yi)| deep_equals(xi, yi, by_value)))
        }
        _ => false,
    }
}

type PollFn = Box<dyn Fn(&Scope) -> Result<Polled, EvalError>>;
type DispatchFn = Box<dyn Fn(&Polled, &Polled, &Scope) -> Result<(), EvalError>>;

struct Watcher {
    id: u64,
    poll: PollFn,
    dispatch: DispatchFn,
    by_value: bool,
    last: RefCell<Option<Polled>>,
}

/// Deregistration handle returned by `watch`/`watchGroup`. Holding a `Weak`
/// means a handle outliving its scope is inert, never a dangling pointer.
#[derive(Clone)]
pub struct WatchHandle {
    scope: Weak<Scope>,
    id: Option<u64>,
}

impl WatchHandle {
    fn noop() -> Self {
        WatchHandle { scope: Weak::new(), id: None }
    }

    /// Removes the watcher. Safe to call at any time, including from
    /// inside the watcher's own listener or another listener mid-digest:
    /// the watcher list tombstones removed entries rather than shifting,
    /// so no other watcher is skipped or double-visited.
    pub fn deregister(&self) {
        if let Some(id) = self.id {
            if let Some(scope) = self.scope.upgrade() {
                scope.remove_watcher(id);
            }
        }
    }
}

/// Dirty-checking scope: owns watchers and the async/apply/post-digest
/// queues, runs the bounded fixed-point `digest` loop.
pub struct Scope {
    bindings: Bindings,
    watchers: RefCell<Vec<Option<Rc<Watcher>>>>,
    next_id: RefCell<u64>,
    last_dirty: RefCell<Option<u64>>,
    async_queue: RefCell<VecDeque<ScopeAction>>,
    apply_async_queue: RefCell<VecDeque<ScopeAction>>,
    apply_async_scheduled: RefCell<bool>,
    deferred_digest_scheduled: RefCell<bool>,
    post_digest_queue: RefCell<VecDeque<ScopeAction>>,
    phase: RefCell<Phase>,
    logger: Rc<dyn DigestLogger>,
    config: DigestConfig,
}

impl Scope {
    pub fn new() -> Rc<Scope> {
        Self::with_logger_and_config(Rc::new(EnvDigestLogger), DigestConfig::default())
    }

    pub fn with_config(config: DigestConfig) -> Rc<Scope> {
        Self::with_logger_and_config(Rc::new(EnvDigestLogger), config)
    }

    pub fn with_logger(logger: Rc<dyn DigestLogger>) -> Rc<Scope> {
        Self::with_logger_and_config(logger, DigestConfig::default())
    }

    pub fn with_logger_and_config(logger: Rc<dyn DigestLogger>, config: DigestConfig) -> Rc<Scope> {
        Rc::new(Scope {
            bindings: empty_bindings(),
            watchers: RefCell::new(Vec::new()),
            next_id: RefCell::new(0),
            last_dirty: RefCell::new(None),
            async_queue: RefCell::new(VecDeque::new()),
            apply_async_queue: RefCell::new(VecDeque::new()),
            apply_async_scheduled: RefCell::new(false),
            deferred_digest_scheduled: RefCell::new(false),
            post_digest_queue: RefCell::new(VecDeque::new()),
            phase: RefCell::new(Phase::None),
            logger,
            config,
        })
    }

    /// The scope's own bindings — what `this`, bare identifiers, and
    /// `ThisExpr` resolve against.
    pub fn bindings(&self) -> Bindings {
        self.bindings.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn next_id(&self) -> u64 {
        let mut id = self.next_id.borrow_mut();
        let current = *id;
        *id += 1;
        current
    }

    fn remove_watcher(&self, id: u64) {
        let mut watchers = self.watchers.borrow_mut();
        if let Some(slot) = watchers.iter_mut().find(|w| matches!(w, Some(w) if w.id == id)) {
            *slot = None;
        }
    }

    // -- watch registration -------------------------------------------------

    /// Registers a watcher. `listener` is optional — a bare watch with no
    /// listener is legal (used to force the watched expression to be
    /// evaluated every digest with no side effect of its own).
    pub fn watch(self: &Rc<Self>, watch_fn: WatchFn, listener: Option<ListenerFn>, by_value: bool) -> WatchHandle {
        let id = self.next_id();
        let poll: PollFn = Box::new(move |scope| Ok(Polled::Single(watch_fn(scope)?)));
        let dispatch: DispatchFn = Box::new(move |new, old, scope| {
            if let (Polled::Single(new), Polled::Single(old)) = (new, old) {
                if let Some(listener) = &listener {
                    listener(new, old, scope)?;
                }
            }
            Ok(())
        });
        self.watchers.borrow_mut().push(Some(Rc::new(Watcher {
            id,
            poll,
            dispatch,
            by_value,
            last: RefCell::new(None),
        })));
        WatchHandle { scope: Rc::downgrade(self), id: Some(id) }
    }

    /// Registers a composite watcher over `watches`. The listener fires at
    /// most once per digest; an empty `watches` fires the listener exactly
    /// once, with two empty arrays, and never again.
    pub fn watch_group(self: &Rc<Self>, watches: Vec<WatchFn>, listener: GroupListenerFn) -> WatchHandle {
        let id = self.next_id();
        let poll: PollFn = Box::new(move |scope| {
            let mut values = Vec::with_capacity(watches.len());
            for w in &watches {
                values.push(w(scope)?);
            }
            Ok(Polled::Group(Rc::new(values)))
        });
        let dispatch: DispatchFn = Box::new(move |new, old, scope| {
            if let (Polled::Group(new), Polled::Group(old)) = (new, old) {
                listener(new, old, scope)?;
            }
            Ok(())
        });
        self.watchers.borrow_mut().push(Some(Rc::new(Watcher {
            id,
            poll,
            dispatch,
            by_value: false,
            last: RefCell::new(None),
        })));
        WatchHandle { scope: Rc::downgrade(self), id: Some(id) }
    }

    /// Watches a compiled [`Evaluator`], honoring its `constant`/`oneTime`/
    /// `inputs` attributes rather than re-evaluating the full expression
    /// tree on every digest pass:
    ///
    /// - `constant`: evaluated once, immediately, with no watcher registered.
    /// - `inputs` non-empty: a `watchGroup` over the cheaper input
    ///   sub-expressions; the full expression is only re-evaluated (and the
    ///   real listener only invoked) when one of them changes.
    /// - otherwise: the whole expression is the watch function.
    ///
    /// `oneTime` expressions deregister themselves the first time they
    /// settle on a defined, non-undefined value.
    pub fn watch_expression(
        self: &Rc<Self>,
        evaluator: Evaluator,
        listener: Option<ListenerFn>,
        locals: Option<Bindings>,
    ) -> WatchHandle {
        if evaluator.constant {
            let value = evaluator
                .eval(Some(self.bindings()), locals)
                .unwrap_or(Value::Undefined);
            if let Some(listener) = &listener {
                if let Err(e) = listener(&value, &value, self) {
                    self.logger.log_error("$watch(constant)", &e);
                }
            }
            return WatchHandle::noop();
        }

        if !evaluator.inputs.is_empty() {
            return self.watch_inputs(evaluator, listener, locals);
        }

        let ev = evaluator.clone();
        let locals_for_watch = locals.clone();
        let watch_fn: WatchFn = Rc::new(move |scope: &Scope| ev.eval(Some(scope.bindings()), locals_for_watch.clone()));

        if evaluator.one_time {
            self.watch_one_time(watch_fn, listener)
        } else {
            self.watch(watch_fn, listener, false)
        }
    }

    fn watch_one_time(self: &Rc<Self>, watch_fn: WatchFn, listener: Option<ListenerFn>) -> WatchHandle {
        let handle_cell: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
        let handle_cell_for_listener = handle_cell.clone();
        let wrapped: ListenerFn = Rc::new(move |new_value, old_value, scope| {
            if let Some(listener) = &listener {
                listener(new_value, old_value, scope)?;
            }
            if !matches!(new_value, Value::Undefined) {
                if let Some(handle) = handle_cell_for_listener.borrow().as_ref() {
                    handle.deregister();
                }
            }
            Ok(())
        });
        let handle = self.watch(watch_fn, Some(wrapped), false);
        *handle_cell.borrow_mut() = Some(handle.clone());
        handle
    }

    fn watch_inputs(self: &Rc<Self>, evaluator: Evaluator, listener: Option<ListenerFn>, locals: Option<Bindings>) -> WatchHandle {
        let input_watches: Vec<WatchFn> = evaluator
            .inputs
            .iter()
            .map(|input_ev| {
                let input_ev = input_ev.clone();
                let locals = locals.clone();
                let f: WatchFn = Rc::new(move |scope: &Scope| input_ev.eval(Some(scope.bindings()), locals.clone()));
                f
            })
            .collect();

        let one_time = evaluator.one_time;
        let full_last: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let handle_cell: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
        let handle_cell_for_listener = handle_cell.clone();

        let ev = evaluator.clone();
        let locals_for_full = locals;
        let group_listener: GroupListenerFn = Rc::new(move |_new_inputs, _old_inputs, scope| {
            let full_value = ev.eval(Some(scope.bindings()), locals_for_full.clone())?;
            let previous = full_last.borrow().clone();
            let changed = match &previous {
                None => true,
                Some(prev) => !deep_equals(prev, &full_value, false),
            };
            if !changed {
                return Ok(());
            }
            let previous = previous.unwrap_or_else(|| full_value.clone());
            *full_last.borrow_mut() = Some(full_value.clone());
            if let Some(listener) = &listener {
                listener(&full_value, &previous, scope)?;
            }
            if one_time && !matches!(full_value, Value::Undefined) {
                if let Some(handle) = handle_cell_for_listener.borrow().as_ref() {
                    handle.deregister();
                }
            }
            Ok(())
        });

        let handle = self.watch_group(input_watches, group_listener);
        *handle_cell.borrow_mut() = Some(handle.clone());
        handle
    }

    // -- digest ---------------------------------------------------------

    /// Runs the bounded fixed-point loop: drains the async queue and walks
    /// the watcher list, in order, until a full pass finds nothing dirty
    /// and the async queue is empty — or fails with `DigestLimitError`
    /// after `config.ttl` outer iterations. Drains the post-digest queue
    /// once, on successful convergence only.
    pub fn digest(self: &Rc<Self>) -> Result<(), DigestLimitError> {
        let _guard = PhaseGuard::enter(self, Phase::Digest);

        *self.deferred_digest_scheduled.borrow_mut() = false;
        if *self.apply_async_scheduled.borrow() {
            *self.apply_async_scheduled.borrow_mut() = false;
            self.drain_apply_async_inline();
        }

        *self.last_dirty.borrow_mut() = None;
        let mut iterations = 0u32;
        loop {
            let async_had_items = self.drain_async_queue();
            let pass_dirty = self.watcher_pass();

            iterations += 1;
            if !pass_dirty && !async_had_items {
                break;
            }
            if iterations >= self.config.ttl {
                return Err(DigestLimitError { ttl: self.config.ttl });
            }
        }

        self.drain_post_digest_queue();
        Ok(())
    }

    /// One walk of the watcher list, honoring the `lastDirty` short-circuit:
    /// `last_dirty` persists across passes within a single `digest` call, so
    /// once a pass revisits the watcher that caused the previous dirty
    /// signal and finds it clean, the rest of the list is known stable and
    /// the walk stops early.
    fn watcher_pass(&self) -> bool {
        let len = self.watchers.borrow().len();
        let mut pass_dirty = false;
        let mut idx = 0;
        while idx < len {
            let entry = self.watchers.borrow().get(idx).and_then(|e| e.clone());
            idx += 1;
            let Some(entry) = entry else { continue };

            let current = match (entry.poll)(self) {
                Ok(v) => v,
                Err(e) => {
                    self.logger.log_error("$watch", &e);
                    continue;
                }
            };

            let previous = entry.last.borrow().clone();
            let is_dirty = match &previous {
                None => true,
                Some(prev) => !polled_equal(&current, prev, entry.by_value),
            };

            if is_dirty {
                *self.last_dirty.borrow_mut() = Some(entry.id);
                pass_dirty = true;
                let old = previous.unwrap_or_else(|| current.clone());
                *entry.last.borrow_mut() = Some(snapshot(&current, entry.by_value));
                if let Err(e) = (entry.dispatch)(&current, &old, self) {
                    self.logger.log_error("$watch listener", &e);
                }
            } else if *self.last_dirty.borrow() == Some(entry.id) {
                break;
            }
        }
        pass_dirty
    }

    fn drain_async_queue(&self) -> bool {
        let actions = drain(&self.async_queue);
        let had_items = !actions.is_empty();
        for action in actions {
            if let Err(e) = action(self) {
                self.logger.log_error("$evalAsync", &e);
            }
        }
        had_items
    }

    fn drain_apply_async_inline(&self) {
        let actions = drain(&self.apply_async_queue);
        for action in actions {
            if let Err(e) = action(self) {
                self.logger.log_error("$applyAsync", &e);
            }
        }
    }

    fn drain_post_digest_queue(&self) {
        let actions = drain(&self.post_digest_queue);
        for action in actions {
            if let Err(e) = action(self) {
                self.logger.log_error("$postDigest", &e);
            }
        }
    }

    // -- eval / apply / scheduling ---------------------------------------

    /// Synchronous call: `f(self)`. Never catches `f`'s errors — those are
    /// this call's direct caller's to handle.
    pub fn eval(&self, f: &ScopeAction) -> Result<Value, EvalError> {
        f(self)
    }

    /// Enters `$apply` phase, runs `f`, restores phase, then guarantees a
    /// `digest()`. A nested `apply` (phase already non-`None`) only runs
    /// `f` — the enclosing phase keeps control of the eventual digest.
    pub fn apply(self: &Rc<Self>, f: &ScopeAction) -> Result<Value, ApplyError> {
        if *self.phase.borrow() != Phase::None {
            return Ok(f(self)?);
        }
        *self.phase.borrow_mut() = Phase::Apply;
        let result = f(self);
        *self.phase.borrow_mut() = Phase::None;
        let digest_result = self.digest();
        match (result, digest_result) {
            (Ok(v), Ok(())) => Ok(v),
            (Err(e), _) => Err(ApplyError::Eval(e)),
            (Ok(_), Err(d)) => Err(ApplyError::Digest(d)),
        }
    }

    /// Enqueues `f` onto the async queue, drained at the top of every TTL
    /// iteration inside `digest`. Schedules a deferred digest (via
    /// `flush_scheduled`) if nothing else will trigger one.
    pub fn eval_async(self: &Rc<Self>, f: ScopeAction) {
        self.async_queue.borrow_mut().push_back(f);
        if *self.phase.borrow() == Phase::None && !*self.apply_async_scheduled.borrow() {
            *self.deferred_digest_scheduled.borrow_mut() = true;
        }
    }

    /// Enqueues `f` onto the apply-async queue, coalesced into a single
    /// `apply` by the next `flush_scheduled` call — or drained inline if a
    /// `digest()` begins first, cancelling the scheduled flush.
    pub fn apply_async(self: &Rc<Self>, f: ScopeAction) {
        self.apply_async_queue.borrow_mut().push_back(f);
        *self.apply_async_scheduled.borrow_mut() = true;
    }

    /// Enqueues `f` to run once, after the next digest's TTL loop exits.
    pub fn post_digest(&self, f: ScopeAction) {
        self.post_digest_queue.borrow_mut().push_back(f);
    }

    /// Runs whatever `evalAsync`/`applyAsync` scheduled and a `digest()`
    /// hasn't already picked up. There is no ambient event loop in this
    /// crate — a host integration's own loop calls this once per tick, the
    /// Rust-native stand-in for "schedule on the next tick" (`digest()`
    /// itself also inlines a pending `applyAsync` flush if it runs first).
    pub fn flush_scheduled(self: &Rc<Self>) -> Result<(), DigestLimitError> {
        if *self.apply_async_scheduled.borrow() {
            *self.apply_async_scheduled.borrow_mut() = false;
            if *self.phase.borrow() != Phase::None {
                self.drain_apply_async_inline();
                return Ok(());
            }
            *self.phase.borrow_mut() = Phase::Apply;
            self.drain_apply_async_inline();
            *self.phase.borrow_mut() = Phase::None;
            return self.digest();
        }
        if *self.deferred_digest_scheduled.borrow() {
            *self.deferred_digest_scheduled.borrow_mut() = false;
            return self.digest();
        }
        Ok(())
    }
}

fn snapshot(value: &Polled, by_value: bool) -> Polled {
    match value {
        Polled::Single(v) => Polled::Single(deep_clone(v, by_value)),
        Polled::Group(v) => Polled::Group(v.clone()),
    }
}

fn drain(queue: &RefCell<VecDeque<ScopeAction>>) -> Vec<ScopeAction> {
    queue.borrow_mut().drain(..).collect()
}

struct PhaseGuard<'a> {
    scope: &'a Scope,
    previous: Phase,
}

impl<'a> PhaseGuard<'a> {
    fn enter(scope: &'a Scope, phase: Phase) -> Self {
        let previous = *scope.phase.borrow();
        *scope.phase.borrow_mut() = phase;
        PhaseGuard { scope, previous }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.scope.phase.borrow_mut() = self.previous;
    }
}
