//! Engine configuration.
//!
//! Plain data with sensible defaults; construct with struct-update
//! syntax. Nothing here is persisted or re-read at runtime: the values
//! are captured when the [`Manager`](crate::manager::Manager) is built.

use std::time::Duration;

use crate::dispatch::SerializationMode;

/// Caller-facing tuning knobs for a [`Manager`](crate::manager::Manager).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default polling period for attributes that fall back to polling.
    /// `Duration::ZERO` disables the polling fallback entirely.
    pub polling_period: Duration,
    /// Event coalescing window. `Duration::ZERO` (the default) delivers
    /// every event individually.
    pub buffer_period: Duration,
    /// Default dispatch mode for entities that do not override it.
    pub serialization: SerializationMode,
    /// Whether a freshly added listener is caught up with the cached
    /// value (or fault) as a targeted event.
    pub catch_up: bool,
    /// How long a blocking cached read waits for first data while a
    /// subscription is still settling.
    pub subscribe_timeout: Duration,
    /// Number of dispatcher worker tasks.
    pub workers: usize,
    /// Capacity of each dispatcher lane queue.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            polling_period: Duration::from_millis(3000),
            buffer_period: Duration::ZERO,
            serialization: SerializationMode::Concurrent,
            catch_up: true,
            subscribe_timeout: Duration::from_secs(10),
            workers: 5,
            queue_capacity: 1000,
        }
    }
}
