// ── Attribute entity ──
//
// One live mirror per canonical attribute name. The entity prefers push
// notifications from the backend and falls back to periodic polling when
// push is unavailable, tracking where it stands with a small state
// machine:
//
//   Unsubscribed ──subscribe──▶ Subscribing ──ok──▶ Subscribed
//        ▲                          │
//        │ fatal                    │ retryable fault
//        └──────────────────────    ▼
//                               PendingSubscribe (polling fallback)
//
// A successful push while pending promotes back to Subscribed and the
// fallback polling is released (unless polling was forced explicitly).
// All state mutations go through one std mutex, never held across an
// await; the cached value itself lives in an `ArcSwapOption` so readers
// never contend with the state lock.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::coalesce::EventBuffer;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, Job, SerializationMode, source_key};
use crate::error::CoreError;
use crate::event::{AttrEvent, AttrInfo, AttrValue, EventData, EventKind};
use crate::listener::{EventListener, ListenerRegistry, ListenerToken, deliver};
use crate::name::ModelName;
use crate::polling::PollingPool;
use crate::proxy::{ProxyError, PushEvent, SharedProxy, SubscriptionId};

/// Where the entity stands with respect to backend push delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SubscriptionState {
    /// No subscription attempted or subscription released.
    Unsubscribed,
    /// Subscribe handshake in flight.
    Subscribing,
    /// Push is live.
    Subscribed,
    /// Push unavailable for a retryable reason; polling carries the load.
    PendingSubscribe,
}

/// One cached read outcome. Faults are cached too: a read that failed is
/// information, and listeners added later deserve to see it.
struct CachedRead {
    data: Result<AttrValue, Arc<ProxyError>>,
    read_at: Instant,
    at: DateTime<Utc>,
}

#[allow(clippy::struct_excessive_bools)]
struct AttrState {
    subscription: SubscriptionState,
    sub_id: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
    flush: Option<JoinHandle<()>>,
    polling_enabled: bool,
    polling_active: bool,
    polling_forced: bool,
    polling_period: Duration,
    mode: SerializationMode,
    pinned: Option<Arc<dyn EventListener>>,
    defunct: bool,
}

/// The live mirror of one remote device attribute.
pub struct AttributeEntity {
    me: Weak<AttributeEntity>,
    name: ModelName,
    source: Arc<str>,
    key: u64,
    proxy: SharedProxy,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<PollingPool>,
    listeners: ListenerRegistry,
    state: Mutex<AttrState>,
    cache: ArcSwapOption<CachedRead>,
    info: ArcSwapOption<AttrInfo>,
    settled: watch::Sender<bool>,
    cancel: CancellationToken,
    buffer: Option<EventBuffer>,
    catch_up: bool,
    subscribe_timeout: Duration,
}

impl std::fmt::Debug for AttributeEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeEntity")
            .field("name", &self.source)
            .finish_non_exhaustive()
    }
}

impl AttributeEntity {
    pub(crate) fn new(
        name: ModelName,
        proxy: SharedProxy,
        dispatcher: Arc<Dispatcher>,
        pool: Arc<PollingPool>,
        cfg: &EngineConfig,
        polling_period: Duration,
    ) -> Arc<Self> {
        let source: Arc<str> = Arc::from(name.full());
        let key = source_key(name.full());
        let (settled, _) = watch::channel(false);
        let buffer =
            (cfg.buffer_period > Duration::ZERO).then(|| EventBuffer::new(cfg.buffer_period));

        let entity = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name,
            source,
            key,
            proxy,
            dispatcher,
            pool,
            listeners: ListenerRegistry::new(),
            state: Mutex::new(AttrState {
                subscription: SubscriptionState::Unsubscribed,
                sub_id: None,
                pump: None,
                flush: None,
                polling_enabled: true,
                polling_active: false,
                polling_forced: false,
                polling_period,
                mode: cfg.serialization,
                pinned: None,
                defunct: false,
            }),
            cache: ArcSwapOption::empty(),
            info: ArcSwapOption::empty(),
            settled,
            cancel: CancellationToken::new(),
            buffer,
            catch_up: cfg.catch_up,
            subscribe_timeout: cfg.subscribe_timeout,
        });

        if entity.buffer.is_some() {
            let flush = Self::spawn_flush(&entity);
            entity.lock_state().flush = Some(flush);
        }
        entity
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AttrState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn name(&self) -> &ModelName {
        &self.name
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.lock_state().subscription
    }

    pub fn is_polling_active(&self) -> bool {
        self.lock_state().polling_active
    }

    pub fn polling_period(&self) -> Duration {
        self.lock_state().polling_period
    }

    pub fn serialization_mode(&self) -> SerializationMode {
        self.lock_state().mode
    }

    /// Override the dispatch mode for this entity only.
    pub fn set_serialization_mode(&self, mode: SerializationMode) {
        self.lock_state().mode = mode;
    }

    /// Attribute metadata, if the backend reported any.
    pub fn info(&self) -> Option<AttrInfo> {
        self.info.load().as_deref().cloned()
    }

    /// Load metadata from the backend if none is cached yet. Backends
    /// without metadata support are tolerated silently.
    pub async fn fetch_info(&self) {
        if self.info.load().is_some() {
            return;
        }
        match self.proxy.describe(self.name.attribute()).await {
            Ok(info) => self.info.store(Some(Arc::new(info))),
            Err(e) => tracing::trace!(name = %self.source, error = %e, "no attribute metadata"),
        }
    }

    /// The cached value without touching the backend. `NoData` when
    /// nothing has been received yet.
    pub fn cached_value(&self) -> Result<AttrValue, CoreError> {
        match self.cache.load().as_deref() {
            Some(c) => c.data.clone().map_err(|e| CoreError::Read {
                name: self.name.full().to_owned(),
                source: (*e).clone(),
            }),
            None => Err(CoreError::NoData(self.name.full().to_owned())),
        }
    }

    /// Wall-clock time of the last cache refresh.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.cache.load().as_deref().map(|c| c.at)
    }

    pub(crate) fn device_key(&self) -> String {
        self.name.device_key()
    }

    pub(crate) fn proxy(&self) -> SharedProxy {
        Arc::clone(&self.proxy)
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Attach a listener. The first listener starts the backend
    /// subscription (or the polling fallback). Returns `Ok(None)` when
    /// the listener was already registered.
    ///
    /// A subscribe failure is surfaced through an `Error` event rather
    /// than a return error: the listener stays attached and will see
    /// recovery if the backend comes back.
    pub async fn add_listener(
        &self,
        listener: Arc<dyn EventListener>,
    ) -> Result<Option<ListenerToken>, CoreError> {
        if self.lock_state().defunct {
            return Err(CoreError::Defunct(self.name.full().to_owned()));
        }
        let Some(token) = self.listeners.add(listener) else {
            return Ok(None);
        };
        let started = self.start_subscription_if_needed().await;
        // The listener that triggered the subscription already sees its
        // outcome; only later listeners need catching up.
        if self.catch_up && !started {
            self.catch_up_listener(token).await;
        }
        Ok(Some(token))
    }

    /// Attach a listener without keeping it alive. Same subscription and
    /// catch-up semantics as [`add_listener`](Self::add_listener); the
    /// registration is pruned silently once the observer is dropped.
    pub async fn add_listener_weak(
        &self,
        listener: &Arc<dyn EventListener>,
    ) -> Result<Option<ListenerToken>, CoreError> {
        if self.lock_state().defunct {
            return Err(CoreError::Defunct(self.name.full().to_owned()));
        }
        let Some(token) = self.listeners.add_weak(listener) else {
            return Ok(None);
        };
        let started = self.start_subscription_if_needed().await;
        if self.catch_up && !started {
            self.catch_up_listener(token).await;
        }
        Ok(Some(token))
    }

    /// Detach by identity. Removing the last listener releases the
    /// subscription and leaves the polling group inline, so the caller
    /// can rely on backend resources being gone when this returns.
    pub async fn remove_listener(&self, listener: &Arc<dyn EventListener>) -> bool {
        let removed = self.listeners.remove(listener);
        if removed && !self.listeners.has_listeners() {
            self.release_subscription().await;
        }
        removed
    }

    /// Detach by registration token, with the same release semantics as
    /// [`remove_listener`](Self::remove_listener).
    pub async fn remove_listener_token(&self, token: ListenerToken) -> bool {
        let removed = self.listeners.remove_token(token);
        if removed && !self.listeners.has_listeners() {
            self.release_subscription().await;
        }
        removed
    }

    /// Pin the subscription alive without observing events.
    pub async fn force_listening(&self) -> Result<(), CoreError> {
        let pinned = {
            let mut st = self.lock_state();
            if st.defunct {
                return Err(CoreError::Defunct(self.name.full().to_owned()));
            }
            if st.pinned.is_some() {
                return Ok(());
            }
            let pin: Arc<dyn EventListener> = Arc::new(|_: &AttrEvent| {});
            st.pinned = Some(Arc::clone(&pin));
            pin
        };
        self.add_listener(pinned).await.map(|_| ())
    }

    /// Drop the pin installed by [`force_listening`](Self::force_listening).
    pub async fn unforce_listening(&self) {
        let pinned = self.lock_state().pinned.take();
        if let Some(pin) = pinned {
            self.remove_listener(&pin).await;
        }
    }

    async fn catch_up_listener(&self, token: ListenerToken) {
        let Some(cached) = self.cache.load_full() else {
            return;
        };
        let (kind, data) = match &cached.data {
            Ok(v) => (EventKind::Change, EventData::Value(v.clone())),
            Err(e) => (EventKind::Error, EventData::Error(Arc::clone(e))),
        };
        self.fire(kind, data, Some(token)).await;
    }

    // ── Subscription lifecycle ───────────────────────────────────────

    /// Returns true when this call performed the subscription attempt.
    async fn start_subscription_if_needed(&self) -> bool {
        {
            let mut st = self.lock_state();
            if st.defunct || st.subscription != SubscriptionState::Unsubscribed {
                return false;
            }
            st.subscription = SubscriptionState::Subscribing;
        }
        self.settled.send_replace(false);
        self.fetch_info().await;

        let (tx, rx) = mpsc::channel::<PushEvent>(32);
        match self.proxy.subscribe(self.name.attribute(), tx).await {
            Ok(id) => {
                let pump = self.spawn_pump(rx);
                let pump_to_abort = {
                    let mut st = self.lock_state();
                    if st.defunct {
                        Some(pump)
                    } else {
                        st.subscription = SubscriptionState::Subscribed;
                        st.sub_id = Some(id);
                        st.pump = Some(pump);
                        None
                    }
                };
                if let Some(pump) = pump_to_abort {
                    pump.abort();
                    let _ = self.proxy.unsubscribe(id).await;
                    return true;
                }
                tracing::debug!(name = %self.source, "push subscription established");
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    name = %self.source,
                    reason = %e.reason,
                    "push unavailable, falling back to polling"
                );
                self.lock_state().subscription = SubscriptionState::PendingSubscribe;
                self.activate_polling();
                self.fire(EventKind::Error, EventData::Error(Arc::new(e)), None)
                    .await;
            }
            Err(e) => {
                tracing::error!(name = %self.source, error = %e, "subscription failed");
                self.lock_state().subscription = SubscriptionState::Unsubscribed;
                let shared = Arc::new(e);
                self.store_cache(Err(Arc::clone(&shared)));
                self.fire(EventKind::Error, EventData::Error(shared), None)
                    .await;
            }
        }
        true
    }

    async fn release_subscription(&self) {
        let (sub_id, pump) = {
            let mut st = self.lock_state();
            st.subscription = SubscriptionState::Unsubscribed;
            st.polling_forced = false;
            (st.sub_id.take(), st.pump.take())
        };
        self.deactivate_polling(true);
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(id) = sub_id {
            if let Err(e) = self.proxy.unsubscribe(id).await {
                tracing::debug!(name = %self.source, error = %e, "unsubscribe failed");
            }
        }
        self.settled.send_replace(false);
    }

    fn spawn_pump(&self, mut rx: mpsc::Receiver<PushEvent>) -> JoinHandle<()> {
        let me = self.me.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(entity) = me.upgrade() else { break };
                        entity.handle_push(event).await;
                    }
                }
            }
        })
    }

    async fn handle_push(&self, event: PushEvent) {
        if self.lock_state().defunct {
            return;
        }
        match event {
            PushEvent::Value(v) => {
                let release = {
                    let mut st = self.lock_state();
                    // A value already in flight can race release_subscription
                    // on another worker thread. Without a live subscription
                    // id the push is stale and must not resurrect the state.
                    if st.sub_id.is_none() {
                        return;
                    }
                    st.subscription = SubscriptionState::Subscribed;
                    st.polling_active && !st.polling_forced
                };
                if release {
                    self.deactivate_polling(false);
                }
                self.store_cache(Ok(v.clone()));
                self.fire(EventKind::Change, EventData::Value(v), None).await;
            }
            PushEvent::Error(e) if e.is_retryable() => {
                tracing::warn!(
                    name = %self.source,
                    reason = %e.reason,
                    "push channel degraded, falling back to polling"
                );
                self.lock_state().subscription = SubscriptionState::PendingSubscribe;
                self.activate_polling();
                self.fire(EventKind::Error, EventData::Error(Arc::new(e)), None)
                    .await;
            }
            PushEvent::Error(e) => {
                let shared = Arc::new(e);
                self.store_cache(Err(Arc::clone(&shared)));
                self.fire(EventKind::Error, EventData::Error(shared), None)
                    .await;
            }
            PushEvent::Config(info) => {
                self.info.store(Some(Arc::new(info.clone())));
                self.fire(EventKind::Config, EventData::Info(info), None)
                    .await;
            }
        }
    }

    // ── Reads and writes ─────────────────────────────────────────────

    /// Read the attribute. With `use_cache` the cached value is returned
    /// when it is still current (always, while push is live; within one
    /// polling period otherwise); while a subscription is settling the
    /// call waits for first data up to the configured timeout, then
    /// proceeds with whatever is cached by then. Without `use_cache` the
    /// backend is always consulted.
    pub async fn read(&self, use_cache: bool) -> Result<AttrValue, CoreError> {
        if self.lock_state().defunct {
            return Err(CoreError::Defunct(self.name.full().to_owned()));
        }
        if !use_cache {
            return self.direct_read().await;
        }

        let (subscription, polling_active, period) = {
            let st = self.lock_state();
            (st.subscription, st.polling_active, st.polling_period)
        };

        if let Some(cached) = self.cache.load_full() {
            let fresh = subscription == SubscriptionState::Subscribed
                || (period > Duration::ZERO && cached.read_at.elapsed() < period);
            if fresh {
                return self.unpack(&cached);
            }
        }

        let should_wait = matches!(
            subscription,
            SubscriptionState::Subscribing | SubscriptionState::Subscribed
        ) || (subscription == SubscriptionState::PendingSubscribe && polling_active);
        if should_wait {
            // A timeout is not an error here: proceed with whatever is
            // cached by now, stale or not.
            if let Err(e) = self.wait_settled().await {
                tracing::debug!(name = %self.source, error = %e, "gave up waiting for first data");
            }
            if self.lock_state().defunct {
                return Err(CoreError::Defunct(self.name.full().to_owned()));
            }
            if let Some(cached) = self.cache.load_full() {
                return self.unpack(&cached);
            }
        }
        self.direct_read().await
    }

    async fn wait_settled(&self) -> Result<(), CoreError> {
        let mut rx = self.settled.subscribe();
        let waited = self.subscribe_timeout;
        let outcome = tokio::time::timeout(waited, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        outcome.map_err(|_| CoreError::Timeout {
            name: self.name.full().to_owned(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn direct_read(&self) -> Result<AttrValue, CoreError> {
        match self.proxy.read(self.name.attribute()).await {
            Ok(v) => {
                self.store_cache(Ok(v.clone()));
                Ok(v)
            }
            Err(e) => {
                self.store_cache(Err(Arc::new(e.clone())));
                Err(CoreError::Read {
                    name: self.name.full().to_owned(),
                    source: e,
                })
            }
        }
    }

    /// Write the attribute, encoding `value` to the declared type when
    /// metadata is known. Returns the backend's read-back value, if any.
    /// While push is live the read-back is not cached (the push channel
    /// is the source of truth); otherwise it refreshes the cache and is
    /// announced as a Change event.
    pub async fn write(&self, value: AttrValue) -> Result<Option<AttrValue>, CoreError> {
        if self.lock_state().defunct {
            return Err(CoreError::Defunct(self.name.full().to_owned()));
        }
        let encoded = match self.info.load().as_deref().and_then(|i| i.kind) {
            Some(kind) => value.encode_as(kind).map_err(|e| CoreError::Write {
                name: self.name.full().to_owned(),
                source: e,
            })?,
            None => value,
        };
        let read_back = self
            .proxy
            .write(self.name.attribute(), encoded)
            .await
            .map_err(|e| CoreError::Write {
                name: self.name.full().to_owned(),
                source: e,
            })?;

        if let Some(v) = &read_back {
            let push_live = self.lock_state().subscription == SubscriptionState::Subscribed;
            if !push_live {
                self.store_cache(Ok(v.clone()));
                self.fire(EventKind::Change, EventData::Value(v.clone()), None)
                    .await;
            }
        }
        Ok(read_back)
    }

    // ── Polling ──────────────────────────────────────────────────────

    /// Re-enable polling. With `force`, the entity joins its polling
    /// group immediately and stays in it even while push is live.
    pub fn enable_polling(&self, force: bool) {
        let join = {
            let mut st = self.lock_state();
            st.polling_enabled = true;
            if force {
                st.polling_forced = true;
            }
            force || st.subscription == SubscriptionState::PendingSubscribe
        };
        if join {
            self.activate_polling();
        }
    }

    /// Switch polling off for this entity and leave the group.
    pub fn disable_polling(&self) {
        {
            let mut st = self.lock_state();
            st.polling_enabled = false;
            st.polling_forced = false;
        }
        self.deactivate_polling(true);
    }

    /// Move this entity to a different polling period. A zero period
    /// disables polling.
    pub fn change_polling_period(&self, period: Duration) {
        if period == Duration::ZERO {
            self.lock_state().polling_period = Duration::ZERO;
            self.disable_polling();
            return;
        }
        let rejoin = {
            let mut st = self.lock_state();
            let old = st.polling_period;
            st.polling_period = period;
            st.polling_active.then_some(old)
        };
        if let Some(old) = rejoin {
            if old != period {
                self.pool.remove(old, self.name.full());
                if let Some(me) = self.me.upgrade() {
                    self.pool.add(period, &me);
                }
            }
        }
    }

    fn activate_polling(&self) {
        let period = {
            let mut st = self.lock_state();
            if st.defunct || st.polling_active || !st.polling_enabled {
                return;
            }
            if st.polling_period == Duration::ZERO {
                tracing::debug!(name = %self.source, "polling disabled by zero period");
                return;
            }
            st.polling_active = true;
            st.polling_period
        };
        if let Some(me) = self.me.upgrade() {
            self.pool.add(period, &me);
        }
    }

    fn deactivate_polling(&self, even_if_forced: bool) {
        let period = {
            let mut st = self.lock_state();
            if !st.polling_active || (st.polling_forced && !even_if_forced) {
                return;
            }
            st.polling_active = false;
            st.polling_period
        };
        self.pool.remove(period, self.name.full());
    }

    /// Fold one polling tick result into the mirror.
    pub(crate) async fn apply_poll(&self, result: Result<AttrValue, ProxyError>) {
        if self.lock_state().defunct {
            return;
        }
        match result {
            Ok(v) => {
                self.store_cache(Ok(v.clone()));
                self.fire(EventKind::Periodic, EventData::Value(v), None)
                    .await;
            }
            Err(e) => {
                let shared = Arc::new(e);
                self.store_cache(Err(Arc::clone(&shared)));
                self.fire(EventKind::Error, EventData::Error(shared), None)
                    .await;
            }
        }
    }

    /// One out-of-band poll, for entities that join a group between
    /// ticks.
    pub(crate) async fn poll_once(&self) {
        let result = self.proxy.read(self.name.attribute()).await;
        self.apply_poll(result).await;
    }

    // ── Event plumbing ───────────────────────────────────────────────

    fn store_cache(&self, data: Result<AttrValue, Arc<ProxyError>>) {
        self.cache.store(Some(Arc::new(CachedRead {
            data,
            read_at: Instant::now(),
            at: Utc::now(),
        })));
        self.settled.send_replace(true);
    }

    fn unpack(&self, cached: &CachedRead) -> Result<AttrValue, CoreError> {
        cached.data.clone().map_err(|e| CoreError::Read {
            name: self.name.full().to_owned(),
            source: (*e).clone(),
        })
    }

    // Targeted and error events always bypass the buffer.
    async fn fire(&self, kind: EventKind, data: EventData, target: Option<ListenerToken>) {
        let event = AttrEvent::new(Arc::clone(&self.source), kind, data);
        if target.is_none() && kind.is_regular() {
            if let Some(buffer) = &self.buffer {
                buffer.offer(event);
                return;
            }
        }
        self.dispatch_now(event, target).await;
    }

    async fn dispatch_now(&self, event: AttrEvent, target: Option<ListenerToken>) {
        let targets = self.listeners.snapshot(target);
        if targets.is_empty() {
            return;
        }
        let mode = self.lock_state().mode;
        let job = Job::new(move || deliver(&targets, &event));
        if let Err(e) = self.dispatcher.dispatch(mode, self.key, job).await {
            tracing::debug!(name = %self.source, error = %e, "event dropped");
        }
    }

    fn spawn_flush(entity: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::downgrade(entity);
        let cancel = entity.cancel.clone();
        let window = entity
            .buffer
            .as_ref()
            .map_or(Duration::from_millis(100), EventBuffer::window);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(window);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(entity) = me.upgrade() else { break };
                        let Some(buffer) = &entity.buffer else { break };
                        if buffer.is_empty() {
                            continue;
                        }
                        for event in buffer.drain() {
                            entity.dispatch_now(event, None).await;
                        }
                    }
                }
            }
        })
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Irreversibly shut the entity down: cancel its tasks, release the
    /// subscription and polling membership, drop all listeners. Safe to
    /// call more than once.
    pub(crate) async fn teardown(&self) {
        {
            let mut st = self.lock_state();
            if st.defunct {
                return;
            }
            st.defunct = true;
        }
        self.cancel.cancel();
        self.listeners.clear();
        self.release_subscription().await;
        // Wake any blocked reader so it can observe the defunct flag.
        self.settled.send_replace(true);
        tracing::debug!(name = %self.source, "attribute entity torn down");
    }
}
