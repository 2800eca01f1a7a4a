// ── Core error types ──
//
// User-facing errors from devsync-core. Backend fault details stay in
// `ProxyError`; the variants here say which engine operation failed and
// on which attribute, so consumers never have to guess the context.

use thiserror::Error;

use crate::proxy::ProxyError;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Configuration errors (raised synchronously, never as events) ──
    #[error("Invalid model name '{name}': {reason}")]
    Configuration { name: String, reason: String },

    #[error("No backend registered for scheme '{0}'")]
    UnknownScheme(String),

    // ── Backend operation errors ─────────────────────────────────────
    #[error("Subscription to '{name}' failed: {source}")]
    Subscription {
        name: String,
        #[source]
        source: ProxyError,
    },

    #[error("Read of '{name}' failed: {source}")]
    Read {
        name: String,
        #[source]
        source: ProxyError,
    },

    #[error("Write to '{name}' failed: {source}")]
    Write {
        name: String,
        #[source]
        source: ProxyError,
    },

    // ── Cache state ──────────────────────────────────────────────────
    /// The entity has never completed a successful read or received a
    /// push, so there is nothing cached to hand out. This is the
    /// explicit "no data yet" sentinel, not a failure of the backend.
    #[error("No data received yet for '{0}'")]
    NoData(String),

    #[error("Timed out after {waited_ms}ms waiting for first data on '{name}'")]
    Timeout { name: String, waited_ms: u64 },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Entity '{0}' has been removed")]
    Defunct(String),

    #[error("Dispatcher is shut down")]
    ShuttingDown,
}

impl CoreError {
    pub(crate) fn config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Configuration {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
