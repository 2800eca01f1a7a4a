// ── Per-scheme factory ──
//
// The identity cache. Asking twice for the same canonical name yields
// the same `Arc<AttributeEntity>`; the dashmap entry API serializes
// construction per name, so a losing racer receives the winner's
// instance instead of building a duplicate. Device proxies are cached
// the same way, one per owner device.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::attribute::AttributeEntity;
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::CoreError;
use crate::name::ModelName;
use crate::polling::PollingPool;
use crate::proxy::SharedProxy;

/// Backend constructor: builds one [`DeviceProxy`](crate::proxy::DeviceProxy)
/// for a device path.
pub type ProxyFactory = Arc<dyn Fn(&str) -> Result<SharedProxy, CoreError> + Send + Sync>;

/// Entity and proxy cache for one scheme.
pub struct Factory {
    scheme: String,
    make_proxy: ProxyFactory,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    default_period_ms: AtomicU64,
    devices: DashMap<String, SharedProxy>,
    attrs: DashMap<String, Arc<AttributeEntity>>,
    pool: Arc<PollingPool>,
}

impl Factory {
    pub(crate) fn new(
        scheme: impl Into<String>,
        make_proxy: ProxyFactory,
        dispatcher: Arc<Dispatcher>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let default_period_ms =
            AtomicU64::new(u64::try_from(config.polling_period.as_millis()).unwrap_or(u64::MAX));
        Arc::new(Self {
            scheme: scheme.into(),
            make_proxy,
            dispatcher,
            config,
            default_period_ms,
            devices: DashMap::new(),
            attrs: DashMap::new(),
            pool: PollingPool::new(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Get or create the entity for `name`. Same canonical name, same
    /// instance.
    pub fn attribute(&self, name: &ModelName) -> Result<Arc<AttributeEntity>, CoreError> {
        debug_assert_eq!(name.scheme(), self.scheme);

        let device_key = name.device_key();
        let proxy = match self.devices.get(&device_key) {
            Some(p) => Arc::clone(&p),
            None => {
                let made = (self.make_proxy)(name.device())?;
                // A concurrent creator may have won; keep whichever
                // landed first.
                Arc::clone(&self.devices.entry(device_key).or_insert(made))
            }
        };

        let entity = match self.attrs.entry(name.full().to_owned()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let period = self.default_polling_period();
                let entity = AttributeEntity::new(
                    name.clone(),
                    proxy,
                    Arc::clone(&self.dispatcher),
                    Arc::clone(&self.pool),
                    &self.config,
                    period,
                );
                vacant.insert(Arc::clone(&entity));
                tracing::debug!(name = %name, "attribute entity created");
                entity
            }
        };
        Ok(entity)
    }

    /// Tear one entity down and evict it. Returns false when the name
    /// was not cached.
    pub async fn remove(&self, full_name: &str) -> bool {
        let Some((_, entity)) = self.attrs.remove(full_name) else {
            return false;
        };
        entity.teardown().await;
        true
    }

    // ── Polling controls ─────────────────────────────────────────────

    /// Default period handed to newly created entities.
    pub fn default_polling_period(&self) -> Duration {
        Duration::from_millis(self.default_period_ms.load(Ordering::Acquire))
    }

    /// Change the default for entities created from now on; existing
    /// entities keep their period until told otherwise.
    pub fn set_default_polling_period(&self, period: Duration) {
        let ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self.default_period_ms.store(ms, Ordering::Release);
    }

    /// Stop all polling timers of this scheme, keeping membership.
    pub fn disable_polling(&self) {
        self.pool.disable();
    }

    /// Restart the timers stopped by [`disable_polling`](Self::disable_polling).
    pub fn enable_polling(&self) {
        self.pool.enable();
    }

    pub fn is_polling_enabled(&self) -> bool {
        self.pool.is_enabled()
    }

    /// Live polling groups as (period, member count).
    pub fn polling_groups(&self) -> Vec<(Duration, usize)> {
        self.pool.groups()
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Tear every cached entity down and drop all proxies.
    pub(crate) async fn clean_up(&self) {
        let names: Vec<String> = self.attrs.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entity)) = self.attrs.remove(&name) {
                entity.teardown().await;
            }
        }
        self.pool.shutdown();
        self.devices.clear();
        tracing::debug!(scheme = %self.scheme, "factory cleaned up");
    }
}
