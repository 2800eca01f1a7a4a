// ── Manager ──
//
// The process-wide context object. Deliberately not a singleton: a
// Manager is built once from an `EngineConfig`, handed around
// explicitly, and owns the dispatcher plus one factory per registered
// scheme. Backends register themselves with `register_scheme`; nothing
// is discovered at runtime.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::attribute::AttributeEntity;
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::CoreError;
use crate::factory::{Factory, ProxyFactory};
use crate::name::ModelName;

pub struct Manager {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    factories: DashMap<String, Arc<Factory>>,
    default_scheme: Mutex<Option<String>>,
}

impl Manager {
    /// Build a manager and spawn its dispatcher workers. Must be called
    /// inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(config.workers, config.queue_capacity));
        Arc::new(Self {
            config,
            dispatcher,
            factories: DashMap::new(),
            default_scheme: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a backend for `scheme`. The first registered scheme
    /// becomes the default for names without a `scheme://` prefix. A
    /// second registration for the same scheme is ignored; the original
    /// factory wins.
    pub fn register_scheme(&self, scheme: &str, make_proxy: ProxyFactory) -> Arc<Factory> {
        let scheme = scheme.to_ascii_lowercase();
        {
            let mut default = self
                .default_scheme
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if default.is_none() {
                *default = Some(scheme.clone());
            }
        }
        if let Some(existing) = self.factories.get(&scheme) {
            tracing::warn!(%scheme, "scheme already registered, keeping the first backend");
            return Arc::clone(&existing);
        }
        let factory = Factory::new(
            scheme.clone(),
            make_proxy,
            Arc::clone(&self.dispatcher),
            self.config.clone(),
        );
        Arc::clone(
            &self
                .factories
                .entry(scheme)
                .or_insert(factory),
        )
    }

    /// The scheme applied to names without an explicit `scheme://`.
    pub fn default_scheme(&self) -> Option<String> {
        self.default_scheme
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn set_default_scheme(&self, scheme: &str) {
        *self
            .default_scheme
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(scheme.to_ascii_lowercase());
    }

    /// The factory registered for `scheme`.
    pub fn factory(&self, scheme: &str) -> Result<Arc<Factory>, CoreError> {
        self.factories
            .get(scheme)
            .map(|f| Arc::clone(&f))
            .ok_or_else(|| CoreError::UnknownScheme(scheme.to_owned()))
    }

    /// Resolve `name` to its (possibly shared) attribute entity.
    pub fn attribute(&self, name: &str) -> Result<Arc<AttributeEntity>, CoreError> {
        let default = self.default_scheme().unwrap_or_default();
        let parsed = ModelName::parse(name, &default)?;
        self.factory(parsed.scheme())?.attribute(&parsed)
    }

    /// Tear down and evict one entity.
    pub async fn remove_attribute(&self, name: &str) -> Result<bool, CoreError> {
        let default = self.default_scheme().unwrap_or_default();
        let parsed = ModelName::parse(name, &default)?;
        Ok(self.factory(parsed.scheme())?.remove(parsed.full()).await)
    }

    /// Tear every factory down, then drain the dispatcher so queued
    /// events are delivered before this returns. Further dispatches are
    /// rejected with [`CoreError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let factories: Vec<Arc<Factory>> =
            self.factories.iter().map(|f| Arc::clone(f.value())).collect();
        for factory in factories {
            factory.clean_up().await;
        }
        self.dispatcher.drain().await;
        tracing::info!("manager shut down");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use async_trait::async_trait;

    use super::*;
    use crate::event::AttrValue;
    use crate::proxy::{
        DeviceProxy, FaultReason, ProxyError, PushSender, SharedProxy, SubscriptionId,
    };

    struct NullProxy;

    #[async_trait]
    impl DeviceProxy for NullProxy {
        async fn subscribe(
            &self,
            _attribute: &str,
            _sink: PushSender,
        ) -> Result<SubscriptionId, ProxyError> {
            Err(ProxyError::new(FaultReason::PushUnsupported, "no push"))
        }

        async fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), ProxyError> {
            Ok(())
        }

        async fn read(&self, _attribute: &str) -> Result<AttrValue, ProxyError> {
            Ok(AttrValue::Int(1))
        }

        async fn write(
            &self,
            _attribute: &str,
            _value: AttrValue,
        ) -> Result<Option<AttrValue>, ProxyError> {
            Ok(None)
        }
    }

    fn null_backend() -> ProxyFactory {
        Arc::new(|_device| Ok(Arc::new(NullProxy) as SharedProxy))
    }

    #[tokio::test]
    async fn same_canonical_name_resolves_to_the_same_entity() {
        let manager = Manager::new(EngineConfig::default());
        manager.register_scheme("sim", null_backend());

        let a = manager.attribute("sim://motor/lab/position").unwrap();
        let b = manager.attribute("SIM://motor/lab/position").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let manager = Manager::new(EngineConfig::default());
        manager.register_scheme("sim", null_backend());

        let err = manager.attribute("nope://dev/attr").unwrap_err();
        assert!(matches!(err, CoreError::UnknownScheme(s) if s == "nope"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn first_registered_scheme_becomes_the_default() {
        let manager = Manager::new(EngineConfig::default());
        manager.register_scheme("sim", null_backend());

        assert_eq!(manager.default_scheme().as_deref(), Some("sim"));
        let e = manager.attribute("dev/attr").unwrap();
        assert_eq!(e.name().scheme(), "sim");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_the_first_backend() {
        let manager = Manager::new(EngineConfig::default());
        let first = manager.register_scheme("sim", null_backend());
        let second = manager.register_scheme("sim", null_backend());
        assert!(Arc::ptr_eq(&first, &second));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn removed_attribute_is_rebuilt_on_next_resolve() {
        let manager = Manager::new(EngineConfig::default());
        manager.register_scheme("sim", null_backend());

        let a = manager.attribute("sim://dev/attr").unwrap();
        assert!(manager.remove_attribute("sim://dev/attr").await.unwrap());
        assert!(!manager.remove_attribute("sim://dev/attr").await.unwrap());

        let b = manager.attribute("sim://dev/attr").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        manager.shutdown().await;
    }
}
