//! Errors `expr-rt` can return directly to a caller (as opposed to the ones
//! a digest catches and forwards to its [`DigestLogger`](crate::DigestLogger)).

use thiserror::Error;

/// The TTL loop in `Scope::digest` ran for `ttl` outer iterations without
/// the watcher set stabilising. Fatal to that one digest call; the scope
/// itself remains usable (watchers, queues, and state are untouched).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("$digest did not converge within {ttl} iterations")]
pub struct DigestLimitError {
    pub ttl: u32,
}

/// `Scope::apply`'s combined failure mode: either the applied function
/// itself failed, or the digest it guarantees afterwards failed to
/// converge. Kept distinct from `EvalError`/`DigestLimitError` so a caller
/// can match on which side produced the failure.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Eval(#[from] expr_compiler::EvalError),
    #[error(transparent)]
    Digest(#[from] DigestLimitError),
}
