//! End-to-end scope tests: watcher registration, the digest fixed-point
//! loop, `watchGroup`, the async/apply/post-digest queues, and the
//! `watch_expression` bridge into compiled evaluators.

use std::cell::RefCell;
use std::rc::Rc;

use expr_compiler::compile;
use expr_core::{FilterRegistry, Value};
use expr_rt::{DigestConfig, Scope};

fn set(scope: &Rc<Scope>, name: &str, value: Value) {
    scope.bindings().borrow_mut().insert(name.to_string(), value);
}

fn get(scope: &Rc<Scope>, name: &str) -> Value {
    scope.bindings().borrow().get(name).cloned().unwrap_or(Value::Undefined)
}

fn number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => *n,
        other => panic!("expected number, got {other:?}"),
    }
}

#[test]
fn watcher_fires_on_first_digest_with_old_equal_to_new() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    let calls: Rc<RefCell<Vec<(f64, f64)>>> = Rc::new(RefCell::new(Vec::new()));
    let calls_clone = calls.clone();
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap_or(Value::Undefined))),
        Some(Rc::new(move |new, old, _s| {
            calls_clone.borrow_mut().push((number(new), number(old)));
            Ok(())
        })),
        false,
    );
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), vec![(1.0, 1.0)]);
}

#[test]
fn watcher_fires_again_only_when_value_changes() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    let calls: Rc<RefCell<Vec<(f64, f64)>>> = Rc::new(RefCell::new(Vec::new()));
    let calls_clone = calls.clone();
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap_or(Value::Undefined))),
        Some(Rc::new(move |new, old, _s| {
            calls_clone.borrow_mut().push((number(new), number(old)));
            Ok(())
        })),
        false,
    );
    scope.digest().unwrap();
    scope.digest().unwrap();
    assert_eq!(calls.borrow().len(), 1, "unchanged value must not refire");

    set(&scope, "a", Value::Number(2.0));
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), vec![(1.0, 1.0), (2.0, 1.0)]);
}

#[test]
fn digest_terminates_at_ttl_exactly_ten() {
    let scope = Scope::new();
    set(&scope, "n", Value::Number(0.0));
    // Each watch bumps the watched value further, so the watcher set never
    // stabilises — this must hit the TTL bound, not loop forever.
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| {
            let current = number(&s.bindings().borrow().get("n").cloned().unwrap());
            s.bindings().borrow_mut().insert("n".to_string(), Value::Number(current + 1.0));
            Ok(Value::Number(current))
        }),
        None,
        false,
    );
    let err = scope.digest().unwrap_err();
    assert_eq!(err.ttl, 10);
}

#[test]
fn custom_ttl_is_honored() {
    let scope = Scope::with_config(DigestConfig { ttl: 3 });
    set(&scope, "n", Value::Number(0.0));
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| {
            let current = number(&s.bindings().borrow().get("n").cloned().unwrap());
            s.bindings().borrow_mut().insert("n".to_string(), Value::Number(current + 1.0));
            Ok(Value::Number(current))
        }),
        None,
        false,
    );
    let err = scope.digest().unwrap_err();
    assert_eq!(err.ttl, 3);
}

#[test]
fn deregistering_during_own_listener_is_safe() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    let handle_cell: Rc<RefCell<Option<expr_rt::WatchHandle>>> = Rc::new(RefCell::new(None));
    let handle_cell_clone = handle_cell.clone();
    let fire_count = Rc::new(RefCell::new(0));
    let fire_count_clone = fire_count.clone();
    let handle = scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap_or(Value::Undefined))),
        Some(Rc::new(move |_new, _old, _s| {
            *fire_count_clone.borrow_mut() += 1;
            handle_cell_clone.borrow().as_ref().unwrap().deregister();
            Ok(())
        })),
        false,
    );
    *handle_cell.borrow_mut() = Some(handle);
    scope.digest().unwrap();
    assert_eq!(*fire_count.borrow(), 1);

    set(&scope, "a", Value::Number(2.0));
    scope.digest().unwrap();
    assert_eq!(*fire_count.borrow(), 1, "deregistered watcher must not fire again");
}

#[test]
fn deregistering_an_earlier_watcher_does_not_skip_a_later_one() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    set(&scope, "b", Value::Number(1.0));
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let handle_a_cell: Rc<RefCell<Option<expr_rt::WatchHandle>>> = Rc::new(RefCell::new(None));
    let handle_a_cell_clone = handle_a_cell.clone();
    let handle_a = scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap_or(Value::Undefined))),
        Some(Rc::new(move |_n, _o, _s| {
            handle_a_cell_clone.borrow().as_ref().unwrap().deregister();
            Ok(())
        })),
        false,
    );
    *handle_a_cell.borrow_mut() = Some(handle_a);

    let log_clone = log.clone();
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("b").cloned().unwrap_or(Value::Undefined))),
        Some(Rc::new(move |_n, _o, _s| {
            log_clone.borrow_mut().push("b");
            Ok(())
        })),
        false,
    );

    scope.digest().unwrap();
    assert_eq!(*log.borrow(), vec!["b"]);
}

#[test]
fn hundred_watchers_report_full_pass_plus_early_termination() {
    let scope = Scope::new();
    let arr = Value::array((0..100).map(|i| Value::Number(i as f64)).collect());
    set(&scope, "arr", arr);

    let invocation_count = Rc::new(RefCell::new(0usize));
    for i in 0..100usize {
        let count = invocation_count.clone();
        scope.watch(
            Rc::new(move |s: &expr_rt::Scope| {
                *count.borrow_mut() += 1;
                let arr = s.bindings().borrow().get("arr").cloned().unwrap();
                let Value::Array(items) = arr else { unreachable!() };
                let value = items.borrow()[i].clone();
                Ok(value)
            }),
            None,
            false,
        );
    }

    // Stabilize first; first digest fires every watcher once (never-seen).
    scope.digest().unwrap();
    invocation_count.replace(0);

    if let Value::Array(items) = get(&scope, "arr") {
        items.borrow_mut()[0] = Value::Number(999.0);
    }
    scope.digest().unwrap();
    assert_eq!(*invocation_count.borrow(), 101);
}

#[test]
fn watch_group_fires_once_with_same_array_instance_on_first_dispatch() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    set(&scope, "b", Value::Number(2.0));

    let dispatches: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let same_instance: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
    let dispatches_clone = dispatches.clone();
    let same_instance_clone = same_instance.clone();

    scope.watch_group(
        vec![
            Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap())),
            Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("b").cloned().unwrap())),
        ],
        Rc::new(move |new, old, _s| {
            *dispatches_clone.borrow_mut() += 1;
            *same_instance_clone.borrow_mut() = Rc::ptr_eq(new, old);
            Ok(())
        }),
    );

    scope.digest().unwrap();
    assert_eq!(*dispatches.borrow(), 1);
    assert!(*same_instance.borrow(), "first dispatch must pass the same array instance for old and new");

    set(&scope, "a", Value::Number(10.0));
    scope.digest().unwrap();
    assert_eq!(*dispatches.borrow(), 2);
    assert!(!*same_instance.borrow(), "subsequent dispatch must pass distinct arrays");
}

#[test]
fn watch_group_fires_once_per_digest_even_with_two_members_dirty() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    set(&scope, "b", Value::Number(2.0));
    let dispatches = Rc::new(RefCell::new(0));
    let dispatches_clone = dispatches.clone();
    scope.watch_group(
        vec![
            Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap())),
            Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("b").cloned().unwrap())),
        ],
        Rc::new(move |_n, _o, _s| {
            *dispatches_clone.borrow_mut() += 1;
            Ok(())
        }),
    );
    scope.digest().unwrap();
    dispatches.replace(0);

    set(&scope, "a", Value::Number(100.0));
    set(&scope, "b", Value::Number(200.0));
    scope.digest().unwrap();
    assert_eq!(*dispatches.borrow(), 1);
}

#[test]
fn watch_group_with_empty_member_list_fires_exactly_once() {
    let scope = Scope::new();
    let dispatches = Rc::new(RefCell::new(0));
    let dispatches_clone = dispatches.clone();
    scope.watch_group(
        vec![],
        Rc::new(move |new, old, _s| {
            assert!(new.is_empty());
            assert!(old.is_empty());
            *dispatches_clone.borrow_mut() += 1;
            Ok(())
        }),
    );
    scope.digest().unwrap();
    scope.digest().unwrap();
    scope.digest().unwrap();
    assert_eq!(*dispatches.borrow(), 1);
}

#[test]
fn watch_group_deregister_removes_the_composite_watcher() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(1.0));
    let dispatches = Rc::new(RefCell::new(0));
    let dispatches_clone = dispatches.clone();
    let handle = scope.watch_group(
        vec![Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap()))],
        Rc::new(move |_n, _o, _s| {
            *dispatches_clone.borrow_mut() += 1;
            Ok(())
        }),
    );
    scope.digest().unwrap();
    handle.deregister();
    set(&scope, "a", Value::Number(2.0));
    scope.digest().unwrap();
    assert_eq!(*dispatches.borrow(), 1);
}

#[test]
fn eval_async_runs_before_the_next_watcher_pass_within_digest() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(0.0));
    scope.eval_async(Rc::new(|s: &expr_rt::Scope| {
        s.bindings().borrow_mut().insert("a".to_string(), Value::Number(42.0));
        Ok(Value::Undefined)
    }));

    let seen = Rc::new(RefCell::new(Value::Undefined));
    let seen_clone = seen.clone();
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap())),
        Some(Rc::new(move |new, _old, _s| {
            *seen_clone.borrow_mut() = new.clone();
            Ok(())
        })),
        false,
    );
    scope.digest().unwrap();
    assert_eq!(number(&seen.borrow()), 42.0);
}

#[test]
fn apply_async_coalesces_two_enqueued_mutations_into_one_flush() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(0.0));
    let watcher_calls = Rc::new(RefCell::new(0));
    let watcher_calls_clone = watcher_calls.clone();
    scope.watch(
        Rc::new(move |s: &expr_rt::Scope| {
            *watcher_calls_clone.borrow_mut() += 1;
            Ok(s.bindings().borrow().get("a").cloned().unwrap())
        }),
        None,
        false,
    );
    scope.digest().unwrap();
    watcher_calls.replace(0);

    scope.apply_async(Rc::new(|s: &expr_rt::Scope| {
        s.bindings().borrow_mut().insert("a".to_string(), Value::Number(1.0));
        Ok(Value::Undefined)
    }));
    scope.apply_async(Rc::new(|s: &expr_rt::Scope| {
        s.bindings().borrow_mut().insert("a".to_string(), Value::Number(2.0));
        Ok(Value::Undefined)
    }));

    scope.digest().unwrap();
    assert_eq!(number(&get(&scope, "a")), 2.0, "last enqueued mutation wins");
}

#[test]
fn flush_scheduled_runs_a_pending_apply_async_flush() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(0.0));
    scope.apply_async(Rc::new(|s: &expr_rt::Scope| {
        s.bindings().borrow_mut().insert("a".to_string(), Value::Number(7.0));
        Ok(Value::Undefined)
    }));
    scope.flush_scheduled().unwrap();
    assert_eq!(number(&get(&scope, "a")), 7.0);
}

#[test]
fn post_digest_runs_once_after_the_digest_converges() {
    let scope = Scope::new();
    let count = Rc::new(RefCell::new(0));
    let count_clone = count.clone();
    scope.post_digest(Rc::new(move |_s| {
        *count_clone.borrow_mut() += 1;
        Ok(Value::Undefined)
    }));
    scope.digest().unwrap();
    scope.digest().unwrap();
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn apply_runs_fn_then_triggers_a_digest() {
    let scope = Scope::new();
    set(&scope, "a", Value::Number(0.0));
    let seen = Rc::new(RefCell::new(Value::Undefined));
    let seen_clone = seen.clone();
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("a").cloned().unwrap())),
        Some(Rc::new(move |new, _old, _s| {
            *seen_clone.borrow_mut() = new.clone();
            Ok(())
        })),
        false,
    );
    scope.digest().unwrap();

    let apply_fn: expr_rt::ScopeAction = Rc::new(|s: &expr_rt::Scope| {
        s.bindings().borrow_mut().insert("a".to_string(), Value::Number(9.0));
        Ok(Value::Undefined)
    });
    scope.apply(&apply_fn).unwrap();
    assert_eq!(number(&seen.borrow()), 9.0);
}

#[test]
fn phase_probe_reports_digest_and_apply_and_resets_to_none() {
    let scope = Scope::new();
    assert_eq!(scope.phase().name(), "");
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| {
            assert_eq!(s.phase().name(), "$digest");
            Ok(Value::Undefined)
        }),
        None,
        false,
    );
    scope.digest().unwrap();
    assert_eq!(scope.phase().name(), "");

    let apply_fn: expr_rt::ScopeAction = Rc::new(|s: &expr_rt::Scope| {
        assert_eq!(s.phase().name(), "$apply");
        Ok(Value::Undefined)
    });
    scope.apply(&apply_fn).unwrap();
    assert_eq!(scope.phase().name(), "");
}

#[test]
fn watch_expression_bridges_compiled_evaluators_into_the_digest() {
    let scope = Scope::new();
    let filters = FilterRegistry::new();
    set(&scope, "a", Value::Number(1.0));
    set(&scope, "b", Value::Number(2.0));

    let evaluator = compile("a + b", &filters).unwrap();
    let seen = Rc::new(RefCell::new(0.0));
    let seen_clone = seen.clone();
    scope.watch_expression(
        evaluator,
        Some(Rc::new(move |new, _old, _s| {
            *seen_clone.borrow_mut() = number(new);
            Ok(())
        })),
        None,
    );
    scope.digest().unwrap();
    assert_eq!(*seen.borrow(), 3.0);

    set(&scope, "b", Value::Number(10.0));
    scope.digest().unwrap();
    assert_eq!(*seen.borrow(), 11.0);
}

#[test]
fn watch_expression_constant_fires_once_with_no_watcher_registered() {
    let scope = Scope::new();
    let filters = FilterRegistry::new();
    let evaluator = compile("1 + 2", &filters).unwrap();
    assert!(evaluator.constant);
    let calls = Rc::new(RefCell::new(0));
    let calls_clone = calls.clone();
    scope.watch_expression(
        evaluator,
        Some(Rc::new(move |new, _old, _s| {
            assert_eq!(number(new), 3.0);
            *calls_clone.borrow_mut() += 1;
            Ok(())
        })),
        None,
    );
    // A constant fires immediately at registration, not at the next digest,
    // and never again.
    assert_eq!(*calls.borrow(), 1);
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn watch_expression_one_time_deregisters_once_defined() {
    let scope = Scope::new();
    let filters = FilterRegistry::new();
    let evaluator = compile("::a", &filters).unwrap();
    assert!(evaluator.one_time);

    let calls = Rc::new(RefCell::new(Vec::new()));
    let calls_clone = calls.clone();
    scope.watch_expression(
        evaluator,
        Some(Rc::new(move |new, _old, _s| {
            calls_clone.borrow_mut().push(new.clone());
            Ok(())
        })),
        None,
    );

    scope.digest().unwrap();
    assert_eq!(calls.borrow().len(), 1);
    assert!(matches!(calls.borrow()[0], Value::Undefined));

    set(&scope, "a", Value::Number(5.0));
    scope.digest().unwrap();
    assert_eq!(calls.borrow().len(), 2);

    set(&scope, "a", Value::Number(6.0));
    scope.digest().unwrap();
    assert_eq!(calls.borrow().len(), 2, "one-time binding must stop watching once defined");
}

#[test]
fn watch_expression_uses_input_fast_path_for_member_access() {
    let scope = Scope::new();
    let filters = FilterRegistry::new();
    let evaluator = compile("a.b.c", &filters).unwrap();
    // `a.b.c` watches its single input (itself, since member access has no
    // simpler sub-expression) via the inputs fast path only when `inputs`
    // is non-empty; here it resolves to `[]` since MemberNonComputed's
    // `toWatch` is `[self]`, so this exercises the plain watch path.
    assert!(evaluator.inputs.is_empty());

    let inner = expr_core::empty_bindings();
    inner.borrow_mut().insert("c".to_string(), Value::Number(7.0));
    let mid = expr_core::empty_bindings();
    mid.borrow_mut().insert("b".to_string(), Value::Object(inner));
    set(&scope, "a", Value::Object(mid));

    let calls = Rc::new(RefCell::new(0));
    let calls_clone = calls.clone();
    scope.watch_expression(
        evaluator,
        Some(Rc::new(move |new, _old, _s| {
            assert_eq!(number(new), 7.0);
            *calls_clone.borrow_mut() += 1;
            Ok(())
        })),
        None,
    );
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn watch_expression_uses_input_fast_path_for_binary_expression() {
    let scope = Scope::new();
    let filters = FilterRegistry::new();
    let evaluator = compile("a + 1", &filters).unwrap();
    assert!(!evaluator.inputs.is_empty(), "`a + 1`'s toWatch is `a`'s, so it takes the inputs fast path");

    set(&scope, "a", Value::Number(1.0));
    let calls = Rc::new(RefCell::new(0.0));
    let calls_clone = calls.clone();
    scope.watch_expression(
        evaluator,
        Some(Rc::new(move |new, _old, _s| {
            *calls_clone.borrow_mut() = number(new);
            Ok(())
        })),
        None,
    );
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 2.0);

    set(&scope, "a", Value::Number(5.0));
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 6.0);
}

#[test]
fn digest_catches_watch_function_panics_of_type_error_and_continues() {
    // A watch function that returns a security error must be caught and
    // logged, not abort the whole digest — the other watchers still run.
    let scope = Scope::new();
    let logger = Rc::new(expr_rt::RecordingDigestLogger::default());
    let scope = {
        let _ = &scope; // drop the default scope, build one with a recording logger
        expr_rt::Scope::with_logger(logger.clone())
    };
    set(&scope, "wd", Value::Undefined);
    let filters = FilterRegistry::new();
    let bad = compile("wd.constructor", &filters).unwrap();
    let ok_calls = Rc::new(RefCell::new(0));
    let ok_calls_clone = ok_calls.clone();

    scope.watch(
        Rc::new(move |s: &expr_rt::Scope| bad.eval(Some(s.bindings()), None)),
        None,
        false,
    );
    scope.watch(
        Rc::new(|_s: &expr_rt::Scope| Ok(Value::Number(1.0))),
        Some(Rc::new(move |_n, _o, _s| {
            *ok_calls_clone.borrow_mut() += 1;
            Ok(())
        })),
        false,
    );

    scope.digest().unwrap();
    assert_eq!(*ok_calls.borrow(), 1, "a later watcher must still run after an earlier one errors");
    assert!(!logger.records.borrow().is_empty());
}

#[test]
fn by_value_watch_over_an_array_converges_and_only_fires_on_structural_change() {
    // The watched array is mutated in place, so the live value and the
    // watcher's stored snapshot are always distinct `Rc`s — a by_value
    // watcher must fall back to deep structural comparison instead of
    // `Rc::ptr_eq`, or it would see every pass as dirty and never converge.
    let scope = Scope::new();
    set(&scope, "arr", Value::array(vec![Value::Number(1.0), Value::Number(2.0)]));
    let calls: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let calls_clone = calls.clone();
    scope.watch(
        Rc::new(|s: &expr_rt::Scope| Ok(s.bindings().borrow().get("arr").cloned().unwrap_or(Value::Undefined))),
        Some(Rc::new(move |_new, _old, _s| {
            *calls_clone.borrow_mut() += 1;
            Ok(())
        })),
        true,
    );

    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 1, "first digest always dispatches once");

    // Nothing changed: a second digest must converge without re-dispatching
    // and without exhausting the TTL.
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 1);

    // Mutate the same array in place (same Rc, different contents).
    let Value::Array(items) = get(&scope, "arr") else { unreachable!() };
    items.borrow_mut().push(Value::Number(3.0));
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 2, "structural change must still be detected");

    // Converges again once stable.
    scope.digest().unwrap();
    assert_eq!(*calls.borrow(), 2);
}
