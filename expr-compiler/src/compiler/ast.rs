//! The AST produced by the [`parser`](crate::compiler::parser) and the pure
//! analyses over it: `constant`, `toWatch`, `isLiteral`, `inputs`,
//! `assignableAST`.
//!
//! Every node is wrapped in `Rc` so `toWatch` can reference shared
//! sub-nodes without cloning the tree, and the evaluator builder can close
//! over nodes directly. The tree is immutable once built.
//!
//! `toWatch`'s `[self]` case ("no simpler inputs, watch me") is represented
//! by [`Watch::SelfNode`] rather than an actual `Rc` cycle back to the node
//! — a real self-reference would need `Rc::new_cyclic`, which can't hand out
//! a *strong* reference to itself during construction. The tag carries
//! identical meaning: when a parent flattens a child's `toWatch`, a
//! `SelfNode` child contributes itself (the child's own `AstRef`), exactly
//! as if it held a pointer to itself.

use crate::compiler::tokens::Span;
use expr_core::Value;
use std::rc::Rc;

pub type AstRef = Rc<Node>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    Identifier(String),
    Literal(String),
}

impl PropertyKey {
    pub fn name(&self) -> &str {
        match self {
            PropertyKey::Identifier(s) | PropertyKey::Literal(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Program(Vec<AstRef>),
    Literal(LiteralValue),
    Array(Vec<AstRef>),
    Object(Vec<(PropertyKey, AstRef)>),
    Identifier(String),
    ThisExpr,
    MemberNonComputed {
        object: AstRef,
        property: String,
    },
    MemberComputed {
        object: AstRef,
        property: AstRef,
    },
    Call {
        callee: AstRef,
        args: Vec<AstRef>,
    },
    Filter {
        callee: String,
        args: Vec<AstRef>,
    },
    Assignment {
        left: AstRef,
        right: AstRef,
    },
    Unary {
        op: UnaryOp,
        arg: AstRef,
    },
    Binary {
        op: BinaryOp,
        left: AstRef,
        right: AstRef,
    },
    Logical {
        op: LogicalOp,
        left: AstRef,
        right: AstRef,
    },
    Conditional {
        test: AstRef,
        consequent: AstRef,
        alternate: AstRef,
    },
    /// Synthetic placeholder standing in for the RHS of a generated
    /// assignment built by `assignableAST`.
    ValueParameter,
}

/// A constant-folded literal. Kept distinct from the runtime `Value` so the
/// AST has no dependency on scope/locals lifetime; converted to `Value` by
/// the evaluator builder.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl LiteralValue {
    pub fn to_value(&self) -> Value {
        match self {
            LiteralValue::Undefined => Value::Undefined,
            LiteralValue::Null => Value::Null,
            LiteralValue::Bool(b) => Value::Bool(*b),
            LiteralValue::Number(n) => Value::Number(*n),
            LiteralValue::String(s) => Value::string(s.clone()),
        }
    }
}

/// See the module doc comment for why `SelfNode` is a tag, not a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Watch {
    None,
    SelfNode,
    Nodes(Vec<AstRef>),
}

impl Watch {
    pub fn is_empty(&self) -> bool {
        matches!(self, Watch::None) || matches!(self, Watch::Nodes(v) if v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub constant: bool,
    pub to_watch: Watch,
}

/// Flatten a set of children's `toWatch` sets into one `Watch::Nodes`,
/// treating a `SelfNode` child as contributing the child itself — the
/// `Array`/`Object`/`Binary` "flat-map non-constant element toWatch" rules.
fn flatten<'a>(children: impl Iterator<Item = &'a AstRef>) -> Vec<AstRef> {
    let mut out: Vec<AstRef> = Vec::new();
    for child in children {
        match &child.to_watch {
            Watch::None => {}
            Watch::SelfNode => out.push(child.clone()),
            Watch::Nodes(v) => out.extend(v.iter().cloned()),
        }
    }
    dedup(out)
}

fn dedup(refs: Vec<AstRef>) -> Vec<AstRef> {
    let mut out: Vec<AstRef> = Vec::with_capacity(refs.len());
    for r in refs {
        if !out.iter().any(|o| Rc::ptr_eq(o, &r)) {
            out.push(r);
        }
    }
    out
}

impl Node {
    /// Build a node, computing `constant`/`toWatch` from its already-built
    /// children. `Filter` nodes go through [`Node::build_filter`] instead,
    /// since their rule additionally depends on the callee's registered
    /// statefulness.
    pub fn build(kind: NodeKind, span: Span) -> AstRef {
        let (constant, to_watch) = match &kind {
            NodeKind::Program(body) => (body.iter().all(|b| b.constant), Watch::None),
            NodeKind::Literal(_) => (true, Watch::None),
            NodeKind::Array(elements) => {
                let constant = elements.iter().all(|e| e.constant);
                let watch = if constant {
                    Watch::None
                } else {
                    Watch::Nodes(flatten(elements.iter().filter(|e| !e.constant)))
                };
                (constant, watch)
            }
            NodeKind::Object(props) => {
                let constant = props.iter().all(|(_, v)| v.constant);
                let watch = if constant {
                    Watch::None
                } else {
                    Watch::Nodes(flatten(
                        props.iter().map(|(_, v)| v).filter(|v| !v.constant),
                    ))
                };
                (constant, watch)
            }
            NodeKind::Identifier(_) => (false, Watch::SelfNode),
            NodeKind::ThisExpr => (false, Watch::None),
            NodeKind::MemberNonComputed { object, .. } => (object.constant, Watch::SelfNode),
            NodeKind::MemberComputed { object, property } => {
                (object.constant && property.constant, Watch::SelfNode)
            }
            NodeKind::Call { .. } => (false, Watch::SelfNode),
            NodeKind::Assignment { left, right } => {
                (left.constant && right.constant, Watch::SelfNode)
            }
            NodeKind::Unary { arg, .. } => (arg.constant, arg.to_watch.clone()),
            NodeKind::Binary { left, right, .. } => {
                let constant = left.constant && right.constant;
                (constant, Watch::Nodes(flatten([left, right].into_iter())))
            }
            NodeKind::Logical { left, right, .. } => {
                (left.constant && right.constant, Watch::SelfNode)
            }
            NodeKind::Conditional {
                test,
                consequent,
                alternate,
            } => (
                test.constant && consequent.constant && alternate.constant,
                Watch::SelfNode,
            ),
            NodeKind::ValueParameter => (false, Watch::None),
            NodeKind::Filter { .. } => unreachable!("Filter nodes are built via build_filter"),
        };
        Rc::new(Node {
            kind,
            span,
            constant,
            to_watch,
        })
    }

    /// Build a `Filter` node, given whether the named filter is registered
    /// stateless. `toWatch` differs from every other node: when stateless it
    /// flattens the (non-constant) argument `toWatch` sets instead of
    /// watching the whole call.
    pub fn build_filter(callee: String, args: Vec<AstRef>, span: Span, stateless: bool) -> AstRef {
        let constant = stateless && args.iter().all(|a| a.constant);
        let to_watch = if constant {
            Watch::None
        } else if stateless {
            Watch::Nodes(flatten(args.iter().filter(|a| !a.constant)))
        } else {
            Watch::SelfNode
        };
        Rc::new(Node {
            kind: NodeKind::Filter { callee, args },
            span,
            constant,
            to_watch,
        })
    }
}

/// `isLiteral`: an empty program, or a single `Literal`/`Array`/`Object`
/// body element.
pub fn is_literal(program_body: &[AstRef]) -> bool {
    match program_body {
        [] => true,
        [only] => matches!(
            only.kind,
            NodeKind::Literal(_) | NodeKind::Array(_) | NodeKind::Object(_)
        ),
        _ => false,
    }
}

/// `inputs`: for a single-statement program, the body's `toWatch` unless it
/// is exactly `[self]` (no simpler inputs exist).
pub fn inputs(program_body: &[AstRef]) -> Vec<AstRef> {
    match program_body {
        [only] => match &only.to_watch {
            Watch::SelfNode => Vec::new(),
            Watch::Nodes(v) => v.clone(),
            Watch::None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// `assignableAST`: if the program's single body element is an Identifier or
/// member expression, synthesize `element = <value parameter>`.
pub fn assignable_ast(program_body: &[AstRef]) -> Option<AstRef> {
    let [only] = program_body else {
        return None;
    };
    let assignable = matches!(
        only.kind,
        NodeKind::Identifier(_)
            | NodeKind::MemberComputed { .. }
            | NodeKind::MemberNonComputed { .. }
    );
    if !assignable {
        return None;
    }
    let value_param = Node::build(NodeKind::ValueParameter, only.span);
    Some(Node::build(
        NodeKind::Assignment {
            left: only.clone(),
            right: value_param,
        },
        only.span,
    ))
}
