//! Client-side synchronization engine for control-system device
//! attributes.
//!
//! The engine keeps one live mirror per attribute name and feeds it from
//! the backend's push channel, falling back to periodic polling when
//! push is unavailable:
//!
//! - **[`Manager`]** — Process-wide context built from an
//!   [`EngineConfig`]: owns the event dispatcher and one [`Factory`] per
//!   registered scheme. Not a singleton; construct it once and pass it
//!   around.
//!
//! - **[`Factory`]** — Identity cache per scheme. Resolving the same
//!   canonical name twice yields the same [`AttributeEntity`]; device
//!   proxies and polling timers are cached alongside.
//!
//! - **[`AttributeEntity`]** — The mirror itself: cached last value,
//!   push subscription state machine with automatic polling fallback,
//!   cached reads with a freshness window, typed writes with read-back.
//!
//! - **[`EventListener`]** — Observer attached to an entity. Delivery
//!   runs either inline ([`SerializationMode::Serial`]) or through a
//!   shared worker pool ([`SerializationMode::Concurrent`]) with
//!   per-entity ordering.
//!
//! - **[`DeviceProxy`]** — The backend contract: subscribe/unsubscribe,
//!   single and bulk reads, writes, metadata. Backends register through
//!   [`Manager::register_scheme`].

pub mod attribute;
mod coalesce;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod factory;
mod listener;
pub mod manager;
pub mod name;
mod polling;
pub mod proxy;

// ── Primary re-exports ──────────────────────────────────────────────
pub use attribute::{AttributeEntity, SubscriptionState};
pub use config::EngineConfig;
pub use dispatch::SerializationMode;
pub use error::CoreError;
pub use event::{AttrEvent, AttrInfo, AttrValue, EventData, EventKind, ValueKind};
pub use factory::{Factory, ProxyFactory};
pub use listener::{EventListener, ListenerToken};
pub use manager::Manager;
pub use name::ModelName;
pub use proxy::{
    DeviceProxy, FaultReason, ProxyError, PushEvent, PushSender, RETRYABLE_FAULTS, SharedProxy,
    SubscriptionId,
};
