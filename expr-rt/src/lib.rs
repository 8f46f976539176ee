//! Dirty-checking scope: watchers, the bounded digest fixed-point loop, and
//! the async/apply/post-digest scheduling queues built on top of
//! `expr-compiler`'s evaluators.

pub mod config;
pub mod error;
pub mod logger;
pub mod scope;

pub use config::DigestConfig;
pub use error::{ApplyError, DigestLimitError};
pub use logger::{DigestLogger, EnvDigestLogger, RecordingDigestLogger};
pub use scope::{GroupListenerFn, ListenerFn, Phase, Scope, ScopeAction, WatchFn, WatchHandle};
