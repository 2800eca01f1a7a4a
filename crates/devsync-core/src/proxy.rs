// ── Backend device proxy interface ──
//
// The engine never speaks a wire protocol itself. Each owner device is
// represented by a `DeviceProxy` supplied by a registered backend; push
// notifications flow through a bounded channel handed over at subscribe
// time, so a slow consumer applies backpressure to the transport instead
// of growing an unbounded buffer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{AttrInfo, AttrValue};

// ── Fault classification ─────────────────────────────────────────────

/// Enumerated backend fault reasons.
///
/// Retryability is decided against `RETRYABLE_FAULTS` — one fixed
/// allow-list, applied identically to subscribe failures and push
/// errors. A retryable fault means "push delivery is degraded but the
/// attribute itself is fine", so the engine falls back to polling;
/// everything else is surfaced verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum FaultReason {
    /// The backend does not implement push for this attribute.
    PushUnsupported,
    /// The event channel/broker is down or not exported.
    EventChannelDown,
    /// The notification service failed to register the subscription.
    NotifyServiceFailure,
    /// The subscription handshake timed out.
    SubscriptionTimeout,
    /// The attribute does not exist on the device.
    AttributeUnknown,
    /// The device itself is unreachable.
    DeviceUnreachable,
    /// The value was rejected (type or range).
    InvalidValue,
    /// The caller is not allowed to perform the operation.
    PermissionDenied,
    /// Anything the backend could not classify.
    Internal,
}

/// The fault reasons that trigger the polling fallback.
pub const RETRYABLE_FAULTS: [FaultReason; 4] = [
    FaultReason::PushUnsupported,
    FaultReason::EventChannelDown,
    FaultReason::NotifyServiceFailure,
    FaultReason::SubscriptionTimeout,
];

impl FaultReason {
    pub fn is_retryable(self) -> bool {
        RETRYABLE_FAULTS.contains(&self)
    }
}

/// A classified backend fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct ProxyError {
    pub reason: FaultReason,
    pub message: String,
}

impl ProxyError {
    pub fn new(reason: FaultReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

// ── Push plumbing ────────────────────────────────────────────────────

/// An asynchronous notification pushed by the backend transport.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// New value for the subscribed attribute.
    Value(AttrValue),
    /// A fault on the push path, classified by the backend.
    Error(ProxyError),
    /// Attribute metadata changed.
    Config(AttrInfo),
}

/// Sender half handed to the backend at subscribe time. Bounded: a
/// lagging consumer blocks the transport rather than buffering forever.
pub type PushSender = mpsc::Sender<PushEvent>;

/// Opaque subscription handle returned by [`DeviceProxy::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

// ── DeviceProxy ──────────────────────────────────────────────────────

/// One backend connection per owner device.
///
/// Attribute arguments are the bare attribute segment (the proxy already
/// knows which device it fronts). Retry policy for reads and writes is
/// the backend's responsibility; the engine never retries them.
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    /// Subscribe to push notifications for `attribute`. On success the
    /// backend is expected to push the current value as an initial
    /// event through `sink`.
    async fn subscribe(
        &self,
        attribute: &str,
        sink: PushSender,
    ) -> Result<SubscriptionId, ProxyError>;

    /// Cancel a push subscription. Tolerates already-gone subscriptions.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProxyError>;

    /// Read one attribute.
    async fn read(&self, attribute: &str) -> Result<AttrValue, ProxyError>;

    /// Bulk read for the polling tick: one round trip for all of this
    /// device's polled attributes. The default falls back to sequential
    /// single reads.
    async fn read_many(
        &self,
        attributes: &[String],
    ) -> Vec<(String, Result<AttrValue, ProxyError>)> {
        let mut out = Vec::with_capacity(attributes.len());
        for a in attributes {
            out.push((a.clone(), self.read(a).await));
        }
        out
    }

    /// Write one attribute. Returns the read-back value when the backend
    /// performs one.
    async fn write(
        &self,
        attribute: &str,
        value: AttrValue,
    ) -> Result<Option<AttrValue>, ProxyError>;

    /// Fetch static attribute metadata.
    async fn describe(&self, attribute: &str) -> Result<AttrInfo, ProxyError> {
        Err(ProxyError::new(
            FaultReason::AttributeUnknown,
            format!("no metadata available for '{attribute}'"),
        ))
    }
}

/// Shared proxy handle as stored by factories.
pub type SharedProxy = Arc<dyn DeviceProxy>;
