//! Tunable scope configuration.
//!
//! The core has no CLI and no file-based configuration — both are explicit
//! non-goals — but a digest has exactly one knob worth exposing: the TTL
//! bound. `Default` reproduces the spec-mandated value so callers never have
//! to think about it; tests that want to observe [`DigestLimitError`](crate::DigestLimitError)
//! without spinning a genuinely non-convergent watcher can tighten it.

/// Construction-time knobs for a [`Scope`](crate::Scope).
#[derive(Debug, Clone, Copy)]
pub struct DigestConfig {
    /// Maximum number of outer digest iterations before `digest()` fails
    /// with `DigestLimitError`. Fixed at 10 by the spec's default.
    pub ttl: u32,
}

impl Default for DigestConfig {
    fn default() -> Self {
        DigestConfig { ttl: 10 }
    }
}
