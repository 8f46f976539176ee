//! Compiles expression source text into reusable [`Evaluator`]s: lexer →
//! parser → AST → evaluator builder, with sandbox guards enforced at
//! evaluation time.

pub mod compiler;

use compiler::ast::AstRef;
use compiler::eval::LowerError;
use compiler::lexer::{lex, LexError};
use compiler::parser::{parse, ParseError};
use expr_core::FilterRegistry;
use thiserror::Error;

pub use compiler::eval::{EvalContext, EvalError, Evaluator};
pub use compiler::sandbox::SecurityError;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Lower(#[from] LowerError),
}

/// Compiles `source` into an [`Evaluator`] against the given filter
/// registry. A leading `::` marks the expression as one-time (stripped
/// before lexing, never seen by the lexer or parser).
pub fn compile(source: &str, filters: &FilterRegistry) -> Result<Evaluator, CompileError> {
    let (one_time, source) = match source.strip_prefix("::") {
        Some(rest) => (true, rest),
        None => (false, source),
    };
    let program = parse_program(source, filters)?;
    Ok(compiler::eval::build(&program, filters, one_time)?)
}

/// Parses `source` into an AST without lowering it to an evaluator — used
/// by the scope runtime when it only needs `constant`/`isLiteral`/`inputs`
/// metadata ahead of building.
pub fn parse_program(source: &str, filters: &FilterRegistry) -> Result<AstRef, CompileError> {
    let tokens = lex(source)?;
    Ok(parse(tokens, filters)?)
}
