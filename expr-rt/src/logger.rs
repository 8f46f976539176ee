//! The logger a [`Scope`](crate::Scope) reports caught watch/listener/digest
//! errors to, so a digest never aborts on a single bad watcher.

use std::fmt;

pub trait DigestLogger {
    fn log_error(&self, context: &str, err: &dyn fmt::Display);
}

/// Forwards to the `log` crate at `warn` level — the default a `Scope` is
/// built with.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvDigestLogger;

impl DigestLogger for EnvDigestLogger {
    fn log_error(&self, context: &str, err: &dyn fmt::Display) {
        log::warn!("{context}: {err}");
    }
}

/// Collects errors into a `Vec` instead of emitting them, so tests can
/// assert on what a digest caught without needing a logging backend.
#[derive(Default)]
pub struct RecordingDigestLogger {
    pub records: std::cell::RefCell<Vec<String>>,
}

impl DigestLogger for RecordingDigestLogger {
    fn log_error(&self, context: &str, err: &dyn fmt::Display) {
        self.records.borrow_mut().push(format!("{context}: {err}"));
    }
}
