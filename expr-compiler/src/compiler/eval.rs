//! The evaluator builder: lowers an AST into a closure tree.
//!
//! A closure tree was chosen over string codegen or a bytecode VM — nothing
//! in this crate requires generated source text or a dispatch loop, and
//! closures let each node capture exactly the state it needs. Every
//! identifier read, member dereference, call argument/result, and
//! assignment right-hand side is run through the sandbox guards at the
//! point it is dereferenced, not once up front, so a value that only turns
//! dangerous after a prior step (e.g. auto-vivifying into an object that
//! later turns out reflection-shaped) is still caught.

use crate::compiler::ast::{
    assignable_ast, inputs, is_literal, AstRef, BinaryOp, LiteralValue, LogicalOp, NodeKind,
    UnaryOp,
};
use crate::compiler::sandbox::{ensure_safe_function, ensure_safe_member_name, ensure_safe_object, SecurityError};
use expr_core::{loose_equals, strict_equals, Bindings, FilterRegistry, Value};
use std::cmp::Ordering;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("'{0}' is not a function")]
    NotAFunction(String),
    #[error("{0}")]
    Native(String),
}

/// Errors that can only be detected while lowering the AST, before any
/// evaluator runs — these are reported once, at compile time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LowerError {
    #[error("left-hand side of an assignment must be an identifier or member expression")]
    InvalidAssignmentTarget,
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
}

/// Everything an evaluator closure needs at call time: the user's scope and
/// an optional locals overlay.
#[derive(Clone)]
pub struct EvalContext {
    pub scope: Option<Bindings>,
    pub locals: Option<Bindings>,
}

impl EvalContext {
    pub fn new(scope: Option<Bindings>, locals: Option<Bindings>) -> Self {
        EvalContext { scope, locals }
    }
}

type NodeFn = Rc<dyn Fn(&EvalContext) -> Result<Value, EvalError>>;
type AssignFn = Rc<dyn Fn(&EvalContext, Value) -> Result<Value, EvalError>>;
type ReceiverFn = Rc<dyn Fn(&EvalContext) -> Result<Value, EvalError>>;

/// A fully lowered expression: a callable carrying its optional `assign`,
/// `inputs`, and the `literal`/`constant`/`oneTime` flags, all fixed at
/// build time and never mutated afterwards.
#[derive(Clone)]
pub struct Evaluator {
    call: NodeFn,
    assign: Option<AssignFn>,
    pub inputs: Vec<Evaluator>,
    pub literal: bool,
    pub constant: bool,
    pub one_time: bool,
}

impl Evaluator {
    pub fn eval(&self, scope: Option<Bindings>, locals: Option<Bindings>) -> Result<Value, EvalError> {
        (self.call)(&EvalContext::new(scope, locals))
    }

    /// Assigns through the evaluator's synthesized LHS, or no-ops (returning
    /// the value unchanged) when the expression isn't assignable.
    pub fn assign(
        &self,
        scope: Option<Bindings>,
        value: Value,
        locals: Option<Bindings>,
    ) -> Result<Value, EvalError> {
        match &self.assign {
            Some(f) => f(&EvalContext::new(scope, locals), value),
            None => Ok(value),
        }
    }
}

/// Lowers a `Program` node into an [`Evaluator`]. `one_time` records whether
/// the source carried a leading `::` (stripped before lexing by the caller).
pub fn build(program: &AstRef, filters: &FilterRegistry, one_time: bool) -> Result<Evaluator, LowerError> {
    let body = match &program.kind {
        NodeKind::Program(body) => body.clone(),
        _ => panic!("build() expects a Program node"),
    };

    let call = build_program(&body, filters)?;
    let assign = assignable_ast(&body)
        .map(|ast| build_assign(&ast, filters))
        .transpose()?;
    let inputs = inputs(&body)
        .iter()
        .map(|node| {
            Ok(Evaluator {
                call: build_expr(node, filters, false, true)?,
                assign: None,
                inputs: Vec::new(),
                literal: false,
                constant: node.constant,
                one_time: false,
            })
        })
        .collect::<Result<Vec<_>, LowerError>>()?;

    Ok(Evaluator {
        call,
        assign,
        inputs,
        literal: is_literal(&body),
        constant: body.iter().all(|n| n.constant),
        one_time,
    })
}

fn build_program(body: &[AstRef], filters: &FilterRegistry) -> Result<NodeFn, LowerError> {
    if body.is_empty() {
        return Ok(Rc::new(|_ctx| Ok(Value::Undefined)));
    }
    let statements = body
        .iter()
        .map(|n| build_expr(n, filters, false, false))
        .collect::<Result<Vec<NodeFn>, LowerError>>()?;
    Ok(Rc::new(move |ctx: &EvalContext| {
        let mut last = Value::Undefined;
        for stmt in &statements {
            last = stmt(ctx)?;
        }
        Ok(last)
    }))
}

fn build_assign(ast: &AstRef, filters: &FilterRegistry) -> Result<AssignFn, LowerError> {
    match &ast.kind {
        NodeKind::Assignment { left, .. } => build_lvalue(left, filters, false),
        _ => Err(LowerError::InvalidAssignmentTarget),
    }
}

/// Builds the mutating side of an assignable node: identifier or member
/// expression. The object chain for a member target is itself built in
/// create-mode, so `a.b.c = 1` vivifies `a.b` as an empty object if absent.
fn build_lvalue(node: &AstRef, filters: &FilterRegistry, ignore_locals: bool) -> Result<AssignFn, LowerError> {
    match &node.kind {
        NodeKind::Identifier(name) => {
            let name = name.clone();
            Ok(Rc::new(move |ctx: &EvalContext, value: Value| {
                ensure_safe_member_name(&name)?;
                ensure_safe_object(&value)?;
                let locals_has = !ignore_locals
                    && ctx
                        .locals
                        .as_ref()
                        .is_some_and(|l| l.borrow().contains_key(&name));
                let container = if locals_has {
                    ctx.locals.clone()
                } else {
                    ctx.scope.clone()
                };
                if let Some(container) = container {
                    container.borrow_mut().insert(name.clone(), value.clone());
                }
                Ok(value)
            }))
        }
        NodeKind::MemberNonComputed { object, property } => {
            let object_fn = build_expr(object, filters, true, ignore_locals)?;
            let property = property.clone();
            Ok(Rc::new(move |ctx: &EvalContext, value: Value| {
                ensure_safe_member_name(&property)?;
                ensure_safe_object(&value)?;
                let obj = object_fn(ctx)?;
                if let Value::Object(map) = &obj {
                    ensure_safe_object(&obj)?;
                    map.borrow_mut().insert(property.clone(), value.clone());
                }
                Ok(value)
            }))
        }
        NodeKind::MemberComputed { object, property } => {
            let object_fn = build_expr(object, filters, true, ignore_locals)?;
            let property_fn = build_expr(property, filters, false, ignore_locals)?;
            Ok(Rc::new(move |ctx: &EvalContext, value: Value| {
                ensure_safe_object(&value)?;
                let obj = object_fn(ctx)?;
                let key_val = property_fn(ctx)?;
                let key = member_key_string(&key_val);
                ensure_safe_member_name(&key)?;
                match &obj {
                    Value::Object(map) => {
                        ensure_safe_object(&obj)?;
                        map.borrow_mut().insert(key, value.clone());
                    }
                    Value::Array(items) => {
                        let idx = key_val.as_number();
                        if idx.is_finite() && idx >= 0.0 && idx.fract() == 0.0 {
                            let idx = idx as usize;
                            let mut items = items.borrow_mut();
                            if idx < items.len() {
                                items[idx] = value.clone();
                            } else if idx == items.len() {
                                items.push(value.clone());
                            }
                        }
                    }
                    _ => {}
                }
                Ok(value)
            }))
        }
        _ => Err(LowerError::InvalidAssignmentTarget),
    }
}

/// Resolves the callee together with the receiver (`this`) a `Call` must
/// bind: a bare identifier call receives the container it resolved from
/// (locals or scope), a member call receives its object, anything else
/// (e.g. a parenthesized sub-expression) receives `undefined`.
fn build_callable(
    node: &AstRef,
    filters: &FilterRegistry,
    ignore_locals: bool,
) -> Result<(NodeFn, ReceiverFn), LowerError> {
    match &node.kind {
        NodeKind::Identifier(name) => {
            let callee_fn = build_expr(node, filters, false, ignore_locals)?;
            let name = name.clone();
            let receiver_fn: ReceiverFn = Rc::new(move |ctx: &EvalContext| {
                let locals_has = !ignore_locals
                    && ctx
                        .locals
                        .as_ref()
                        .is_some_and(|l| l.borrow().contains_key(&name));
                if locals_has {
                    Ok(Value::Object(ctx.locals.clone().unwrap()))
                } else if let Some(scope) = &ctx.scope {
                    Ok(Value::Object(scope.clone()))
                } else {
                    Ok(Value::Undefined)
                }
            });
            Ok((callee_fn, receiver_fn))
        }
        NodeKind::MemberNonComputed { object, .. } | NodeKind::MemberComputed { object, .. } => {
            let callee_fn = build_expr(node, filters, false, ignore_locals)?;
            let object_fn = build_expr(object, filters, false, ignore_locals)?;
            let receiver_fn: ReceiverFn = Rc::new(move |ctx: &EvalContext| object_fn(ctx));
            Ok((callee_fn, receiver_fn))
        }
        _ => {
            let callee_fn = build_expr(node, filters, false, ignore_locals)?;
            let receiver_fn: ReceiverFn = Rc::new(|_ctx: &EvalContext| Ok(Value::Undefined));
            Ok((callee_fn, receiver_fn))
        }
    }
}

fn member_key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.to_string(),
        other => format!("{other}"),
    }
}

fn member_get(obj: &Value, key: &Value) -> Value {
    match obj {
        Value::Array(items) => {
            let idx = key.as_number();
            if idx.is_finite() && idx >= 0.0 && idx.fract() == 0.0 {
                items.borrow().get(idx as usize).cloned().unwrap_or(Value::Undefined)
            } else {
                Value::Undefined
            }
        }
        Value::Object(map) => map
            .borrow()
            .get(&member_key_string(key))
            .cloned()
            .unwrap_or(Value::Undefined),
        Value::String(s) => {
            let idx = key.as_number();
            if idx.is_finite() && idx >= 0.0 {
                s.chars()
                    .nth(idx as usize)
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or(Value::Undefined)
            } else {
                Value::Undefined
            }
        }
        _ => Value::Undefined,
    }
}

fn add_values(a: &Value, b: &Value) -> Value {
    let a = if matches!(a, Value::Undefined) { Value::Number(0.0) } else { a.clone() };
    let b = if matches!(b, Value::Undefined) { Value::Number(0.0) } else { b.clone() };
    match (&a, &b) {
        (Value::String(_), _) | (_, Value::String(_)) => Value::string(format!("{a}{b}")),
        _ => Value::Number(a.as_number() + b.as_number()),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.as_ref().cmp(y.as_ref())),
        _ => a.as_number().partial_cmp(&b.as_number()),
    }
}

/// The general recursive lowering pass. `create_mode` makes Identifier and
/// Member nodes auto-vivify missing containers along the path being built
/// (used while lowering an assignment's LHS); `ignore_locals` makes
/// Identifier resolution skip the locals overlay regardless of what it
/// holds (used only for the per-input evaluators attached to the scope's
/// fast-path comparison).
fn build_expr(
    node: &AstRef,
    filters: &FilterRegistry,
    create_mode: bool,
    ignore_locals: bool,
) -> Result<NodeFn, LowerError> {
    let f: NodeFn = match &node.kind {
        NodeKind::Program(body) => build_program(body, filters)?,
        NodeKind::Literal(lit) => {
            let value = literal_value(lit);
            Rc::new(move |_ctx: &EvalContext| Ok(value.clone()))
        }
        NodeKind::Array(elements) => {
            let fns = elements
                .iter()
                .map(|e| build_expr(e, filters, false, ignore_locals))
                .collect::<Result<Vec<NodeFn>, LowerError>>()?;
            Rc::new(move |ctx: &EvalContext| {
                let mut items = Vec::with_capacity(fns.len());
                for f in &fns {
                    items.push(f(ctx)?);
                }
                Ok(Value::array(items))
            })
        }
        NodeKind::Object(props) => {
            let fns = props
                .iter()
                .map(|(key, value)| {
                    let key = key.name().to_string();
                    build_expr(value, filters, false, ignore_locals).map(|f| (key, f))
                })
                .collect::<Result<Vec<(String, NodeFn)>, LowerError>>()?;
            Rc::new(move |ctx: &EvalContext| {
                let mut map = indexmap::IndexMap::with_capacity(fns.len());
                for (key, f) in &fns {
                    map.insert(key.clone(), f(ctx)?);
                }
                Ok(Value::object(map))
            })
        }
        NodeKind::Identifier(name) => {
            let name = name.clone();
            Rc::new(move |ctx: &EvalContext| {
                ensure_safe_member_name(&name)?;
                let locals_has = !ignore_locals
                    && ctx
                        .locals
                        .as_ref()
                        .is_some_and(|l| l.borrow().contains_key(&name));
                let mut value = if locals_has {
                    ctx.locals.as_ref().unwrap().borrow().get(&name).cloned().unwrap_or(Value::Undefined)
                } else if let Some(scope) = &ctx.scope {
                    scope.borrow().get(&name).cloned().unwrap_or(Value::Undefined)
                } else {
                    Value::Undefined
                };
                if create_mode && matches!(value, Value::Undefined) {
                    let container = if locals_has { ctx.locals.clone() } else { ctx.scope.clone() };
                    if let Some(container) = container {
                        let new_obj = Value::empty_object();
                        container.borrow_mut().insert(name.clone(), new_obj.clone());
                        value = new_obj;
                    }
                }
                ensure_safe_object(&value)?;
                Ok(value)
            })
        }
        NodeKind::ThisExpr => Rc::new(|ctx: &EvalContext| {
            Ok(match &ctx.scope {
                Some(scope) => Value::Object(scope.clone()),
                None => Value::Undefined,
            })
        }),
        NodeKind::MemberNonComputed { object, property } => {
            let object_fn = build_expr(object, filters, create_mode, ignore_locals)?;
            let property = property.clone();
            Rc::new(move |ctx: &EvalContext| {
                ensure_safe_member_name(&property)?;
                let obj = object_fn(ctx)?;
                if !obj.is_truthy() {
                    return Ok(Value::Undefined);
                }
                ensure_safe_object(&obj)?;
                let mut result = member_get(&obj, &Value::string(property.clone()));
                if create_mode && matches!(result, Value::Undefined) {
                    if let Value::Object(map) = &obj {
                        let new_obj = Value::empty_object();
                        map.borrow_mut().insert(property.clone(), new_obj.clone());
                        result = new_obj;
                    }
                }
                ensure_safe_object(&result)?;
                Ok(result)
            })
        }
        NodeKind::MemberComputed { object, property } => {
            let object_fn = build_expr(object, filters, create_mode, ignore_locals)?;
            let property_fn = build_expr(property, filters, false, ignore_locals)?;
            Rc::new(move |ctx: &EvalContext| {
                let obj = object_fn(ctx)?;
                let key_val = property_fn(ctx)?;
                let key = member_key_string(&key_val);
                ensure_safe_member_name(&key)?;
                if !obj.is_truthy() {
                    return Ok(Value::Undefined);
                }
                ensure_safe_object(&obj)?;
                let mut result = member_get(&obj, &key_val);
                if create_mode && matches!(result, Value::Undefined) {
                    if let Value::Object(map) = &obj {
                        let new_obj = Value::empty_object();
                        map.borrow_mut().insert(key, new_obj.clone());
                        result = new_obj;
                    }
                }
                ensure_safe_object(&result)?;
                Ok(result)
            })
        }
        NodeKind::Call { callee, args } => {
            let (callee_fn, receiver_fn) = build_callable(callee, filters, ignore_locals)?;
            let arg_fns = args
                .iter()
                .map(|a| build_expr(a, filters, false, ignore_locals))
                .collect::<Result<Vec<NodeFn>, LowerError>>()?;
            Rc::new(move |ctx: &EvalContext| {
                let callee_val = callee_fn(ctx)?;
                if !callee_val.is_truthy() {
                    return Ok(Value::Undefined);
                }
                let receiver = receiver_fn(ctx)?;
                ensure_safe_object(&receiver)?;
                ensure_safe_function(&callee_val)?;
                let mut arg_vals = Vec::with_capacity(arg_fns.len());
                for f in &arg_fns {
                    let v = f(ctx)?;
                    ensure_safe_object(&v)?;
                    arg_vals.push(v);
                }
                match &callee_val {
                    Value::Function(func) => {
                        let result = func.invoke(receiver, &arg_vals).map_err(EvalError::Native)?;
                        ensure_safe_object(&result)?;
                        Ok(result)
                    }
                    other => Err(EvalError::NotAFunction(format!("{other}"))),
                }
            })
        }
        NodeKind::Filter { callee, args } => {
            let filter = filters
                .filter(callee)
                .ok_or_else(|| LowerError::UnknownFilter(callee.clone()))?;
            let arg_fns = args
                .iter()
                .map(|a| build_expr(a, filters, false, ignore_locals))
                .collect::<Result<Vec<NodeFn>, LowerError>>()?;
            Rc::new(move |ctx: &EvalContext| {
                let mut vals = Vec::with_capacity(arg_fns.len());
                for f in &arg_fns {
                    vals.push(f(ctx)?);
                }
                let (input, rest) = vals.split_first().expect("a Filter node always has the piped value as args[0]");
                Ok(filter(input, rest))
            })
        }
        NodeKind::Assignment { left, right } => {
            let assign_fn = build_lvalue(left, filters, ignore_locals)?;
            let right_fn = build_expr(right, filters, false, ignore_locals)?;
            Rc::new(move |ctx: &EvalContext| {
                let value = right_fn(ctx)?;
                ensure_safe_object(&value)?;
                assign_fn(ctx, value)
            })
        }
        NodeKind::Unary { op, arg } => {
            let arg_fn = build_expr(arg, filters, false, ignore_locals)?;
            match op {
                UnaryOp::Plus => Rc::new(move |ctx: &EvalContext| Ok(Value::Number(arg_fn(ctx)?.numeric_or_zero()))),
                UnaryOp::Minus => Rc::new(move |ctx: &EvalContext| Ok(Value::Number(-arg_fn(ctx)?.numeric_or_zero()))),
                UnaryOp::Not => Rc::new(move |ctx: &EvalContext| Ok(Value::Bool(!arg_fn(ctx)?.is_truthy()))),
            }
        }
        NodeKind::Binary { op, left, right } => {
            let l = build_expr(left, filters, false, ignore_locals)?;
            let r = build_expr(right, filters, false, ignore_locals)?;
            let op = *op;
            Rc::new(move |ctx: &EvalContext| {
                let lv = l(ctx)?;
                let rv = r(ctx)?;
                Ok(match op {
                    BinaryOp::Add => add_values(&lv, &rv),
                    BinaryOp::Sub => Value::Number(lv.numeric_or_zero() - rv.numeric_or_zero()),
                    BinaryOp::Mul => Value::Number(lv.as_number() * rv.as_number()),
                    BinaryOp::Div => Value::Number(lv.as_number() / rv.as_number()),
                    BinaryOp::Mod => Value::Number(lv.as_number() % rv.as_number()),
                    BinaryOp::Eq => Value::Bool(loose_equals(&lv, &rv)),
                    BinaryOp::NotEq => Value::Bool(!loose_equals(&lv, &rv)),
                    BinaryOp::StrictEq => Value::Bool(strict_equals(&lv, &rv)),
                    BinaryOp::StrictNotEq => Value::Bool(!strict_equals(&lv, &rv)),
                    BinaryOp::Lt => Value::Bool(compare(&lv, &rv) == Some(Ordering::Less)),
                    BinaryOp::Gt => Value::Bool(compare(&lv, &rv) == Some(Ordering::Greater)),
                    BinaryOp::LtEq => Value::Bool(matches!(compare(&lv, &rv), Some(Ordering::Less | Ordering::Equal))),
                    BinaryOp::GtEq => {
                        Value::Bool(matches!(compare(&lv, &rv), Some(Ordering::Greater | Ordering::Equal)))
                    }
                })
            })
        }
        NodeKind::Logical { op, left, right } => {
            let l = build_expr(left, filters, false, ignore_locals)?;
            let r = build_expr(right, filters, false, ignore_locals)?;
            match op {
                LogicalOp::And => Rc::new(move |ctx: &EvalContext| {
                    let lv = l(ctx)?;
                    if lv.is_truthy() { r(ctx) } else { Ok(lv) }
                }),
                LogicalOp::Or => Rc::new(move |ctx: &EvalContext| {
                    let lv = l(ctx)?;
                    if lv.is_truthy() { Ok(lv) } else { r(ctx) }
                }),
            }
        }
        NodeKind::Conditional { test, consequent, alternate } => {
            let t = build_expr(test, filters, false, ignore_locals)?;
            let c = build_expr(consequent, filters, false, ignore_locals)?;
            let a = build_expr(alternate, filters, false, ignore_locals)?;
            Rc::new(move |ctx: &EvalContext| if t(ctx)?.is_truthy() { c(ctx) } else { a(ctx) })
        }
        NodeKind::ValueParameter => unreachable!("ValueParameter only appears inside a synthetic assign target"),
    };
    Ok(f)
}

fn literal_value(lit: &LiteralValue) -> Value {
    lit.to_value()
}
