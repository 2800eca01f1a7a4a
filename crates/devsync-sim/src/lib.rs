//! In-memory simulator backend for `devsync-core`.
//!
//! [`SimNetwork`] hands out one [`SimDevice`] per device path; each
//! device serves scripted attribute values (a monotonic counter by
//! default) and can be told, per attribute, to refuse push
//! subscriptions retryably or fatally, or to fail reads. Registered
//! under the `sim` scheme via [`SimNetwork::register`].
//!
//! The simulator exists for tests and demos; it counts backend calls so
//! tests can assert how often the engine actually hit the "wire".

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use devsync_core::manager::Manager;
use devsync_core::proxy::{
    DeviceProxy, FaultReason, ProxyError, PushEvent, PushSender, SharedProxy, SubscriptionId,
};
use devsync_core::{AttrInfo, AttrValue, Factory};

/// How a simulated attribute responds to subscribe attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeBehavior {
    /// Accept and push an initial value (the default).
    Push,
    /// Refuse with a retryable fault, so the engine falls back to
    /// polling.
    FailRetryable(FaultReason),
    /// Refuse with a non-retryable fault.
    FailFatal(FaultReason),
}

struct AttrScript {
    behavior: Mutex<SubscribeBehavior>,
    read_fault: Mutex<Option<FaultReason>>,
    counter: AtomicI64,
    written: Mutex<Option<AttrValue>>,
    info: Mutex<Option<AttrInfo>>,
}

impl Default for AttrScript {
    fn default() -> Self {
        Self {
            behavior: Mutex::new(SubscribeBehavior::Push),
            read_fault: Mutex::new(None),
            counter: AtomicI64::new(0),
            written: Mutex::new(None),
            info: Mutex::new(None),
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl AttrScript {
    /// Next scripted value: the last written value if any, otherwise the
    /// monotonic counter.
    fn next_value(&self) -> AttrValue {
        locked(&self.written)
            .clone()
            .unwrap_or_else(|| AttrValue::Int(self.counter.fetch_add(1, Ordering::SeqCst)))
    }
}

/// One simulated device: a bag of scripted attributes plus the live
/// push subscriptions against them.
pub struct SimDevice {
    path: String,
    attrs: DashMap<String, Arc<AttrScript>>,
    subs: DashMap<u64, (String, PushSender)>,
    next_sub: AtomicU64,
    read_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
}

impl SimDevice {
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            attrs: DashMap::new(),
            subs: DashMap::new(),
            next_sub: AtomicU64::new(1),
            read_calls: AtomicUsize::new(0),
            bulk_calls: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn script(&self, attribute: &str) -> Arc<AttrScript> {
        Arc::clone(
            &self
                .attrs
                .entry(attribute.to_owned())
                .or_default(),
        )
    }

    // ── Scripting knobs ──────────────────────────────────────────────

    pub fn set_behavior(&self, attribute: &str, behavior: SubscribeBehavior) {
        *locked(&self.script(attribute).behavior) = behavior;
    }

    pub fn fail_reads(&self, attribute: &str, reason: FaultReason) {
        *locked(&self.script(attribute).read_fault) = Some(reason);
    }

    pub fn serve_reads(&self, attribute: &str) {
        *locked(&self.script(attribute).read_fault) = None;
    }

    pub fn describe_with(&self, attribute: &str, info: AttrInfo) {
        *locked(&self.script(attribute).info) = Some(info);
    }

    /// The last value written through the engine, if any.
    pub fn written(&self, attribute: &str) -> Option<AttrValue> {
        self.attrs
            .get(attribute)
            .and_then(|s| locked(&s.written).clone())
    }

    // ── Push injection and introspection ─────────────────────────────

    /// Push a value to every live subscription on `attribute`.
    pub async fn push_value(&self, attribute: &str, value: AttrValue) {
        self.push(attribute, PushEvent::Value(value)).await;
    }

    /// Push a classified fault to every live subscription on `attribute`.
    pub async fn push_error(&self, attribute: &str, error: ProxyError) {
        self.push(attribute, PushEvent::Error(error)).await;
    }

    async fn push(&self, attribute: &str, event: PushEvent) {
        let sinks: Vec<PushSender> = self
            .subs
            .iter()
            .filter(|s| s.0 == attribute)
            .map(|s| s.1.clone())
            .collect();
        for sink in sinks {
            let _ = sink.send(event.clone()).await;
        }
    }

    /// Live push subscriptions across all attributes.
    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Single reads served so far (bulk reads not included).
    pub fn read_count(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Bulk read round trips served so far.
    pub fn bulk_read_count(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    fn serve_read(&self, attribute: &str) -> Result<AttrValue, ProxyError> {
        let script = self.script(attribute);
        if let Some(reason) = *locked(&script.read_fault) {
            return Err(ProxyError::new(reason, "scripted read failure"));
        }
        Ok(script.next_value())
    }
}

#[async_trait]
impl DeviceProxy for SimDevice {
    async fn subscribe(
        &self,
        attribute: &str,
        sink: PushSender,
    ) -> Result<SubscriptionId, ProxyError> {
        let script = self.script(attribute);
        let behavior = *locked(&script.behavior);
        match behavior {
            SubscribeBehavior::FailRetryable(reason) | SubscribeBehavior::FailFatal(reason) => {
                tracing::debug!(device = %self.path, attribute, %reason, "refusing subscription");
                Err(ProxyError::new(reason, "scripted subscribe failure"))
            }
            SubscribeBehavior::Push => {
                let initial = script.next_value();
                let _ = sink.send(PushEvent::Value(initial)).await;
                let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
                self.subs.insert(id, (attribute.to_owned(), sink));
                tracing::debug!(device = %self.path, attribute, id, "subscription accepted");
                Ok(SubscriptionId(id))
            }
        }
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProxyError> {
        self.subs.remove(&id.0);
        Ok(())
    }

    async fn read(&self, attribute: &str) -> Result<AttrValue, ProxyError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.serve_read(attribute)
    }

    async fn read_many(
        &self,
        attributes: &[String],
    ) -> Vec<(String, Result<AttrValue, ProxyError>)> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        attributes
            .iter()
            .map(|a| (a.clone(), self.serve_read(a)))
            .collect()
    }

    async fn write(
        &self,
        attribute: &str,
        value: AttrValue,
    ) -> Result<Option<AttrValue>, ProxyError> {
        let script = self.script(attribute);
        *locked(&script.written) = Some(value.clone());
        Ok(Some(value))
    }

    async fn describe(&self, attribute: &str) -> Result<AttrInfo, ProxyError> {
        locked(&self.script(attribute).info)
            .clone()
            .ok_or_else(|| {
                ProxyError::new(
                    FaultReason::AttributeUnknown,
                    format!("no metadata scripted for '{attribute}'"),
                )
            })
    }
}

/// The simulated control system: one device per path, created on
/// demand.
#[derive(Default)]
pub struct SimNetwork {
    devices: DashMap<String, Arc<SimDevice>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the device at `path`.
    pub fn device(&self, path: &str) -> Arc<SimDevice> {
        Arc::clone(
            &self
                .devices
                .entry(path.to_owned())
                .or_insert_with(|| SimDevice::new(path)),
        )
    }

    /// Register this network under the `sim` scheme.
    pub fn register(self: &Arc<Self>, manager: &Manager) -> Arc<Factory> {
        let net = Arc::clone(self);
        manager.register_scheme(
            "sim",
            Arc::new(move |device: &str| {
                let proxy: SharedProxy = net.device(device);
                Ok(proxy)
            }),
        )
    }
}
