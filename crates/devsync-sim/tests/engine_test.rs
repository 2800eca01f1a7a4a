//! End-to-end tests driving the engine through the simulator backend,
//! with paused tokio time so polling grids are exact.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use devsync_core::manager::Manager;
use devsync_core::proxy::{FaultReason, ProxyError};
use devsync_core::{
    AttrEvent, AttrInfo, AttrValue, CoreError, EngineConfig, EventKind, EventListener,
    SerializationMode, SubscriptionState, ValueKind,
};
use devsync_sim::{SimNetwork, SubscribeBehavior};

struct Recorder {
    events: Mutex<Vec<AttrEvent>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn values(&self, kind: EventKind) -> Vec<AttrValue> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.value().cloned())
            .collect()
    }

    fn count(&self, kind: EventKind) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl EventListener for Recorder {
    fn on_event(&self, event: &AttrEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn setup(cfg: EngineConfig) -> (Arc<Manager>, Arc<SimNetwork>) {
    let manager = Manager::new(cfg);
    let net = SimNetwork::new();
    net.register(&manager);
    (manager, net)
}

fn serial_cfg(polling_ms: u64) -> EngineConfig {
    EngineConfig {
        polling_period: Duration::from_millis(polling_ms),
        serialization: SerializationMode::Serial,
        ..EngineConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn polling_fallback_polls_on_the_500ms_grid() {
    let (manager, net) = setup(serial_cfg(500));
    net.device("dev").set_behavior(
        "attr",
        SubscribeBehavior::FailRetryable(FaultReason::PushUnsupported),
    );

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();

    assert_eq!(
        entity.subscription_state(),
        SubscriptionState::PendingSubscribe
    );
    assert!(entity.is_polling_active());
    assert_eq!(rec.kinds()[0], EventKind::Error);

    // First poll happens immediately, not one period later.
    sleep(Duration::from_millis(10)).await;
    assert_eq!(rec.count(EventKind::Periodic), 1);

    // Ticks at 500 / 1000 / 1500 ms.
    sleep(Duration::from_millis(1590)).await;
    assert_eq!(rec.count(EventKind::Periodic), 4);
    assert_eq!(
        rec.values(EventKind::Periodic),
        vec![
            AttrValue::Int(0),
            AttrValue::Int(1),
            AttrValue::Int(2),
            AttrValue::Int(3)
        ]
    );

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_joiner_is_polled_out_of_band() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");
    for attr in ["attr1", "attr2"] {
        dev.set_behavior(
            attr,
            SubscribeBehavior::FailRetryable(FaultReason::PushUnsupported),
        );
    }

    let first = manager.attribute("sim://dev/attr1").unwrap();
    first
        .add_listener(Recorder::new() as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(250)).await;

    // Joining mid-period must not wait 250 ms for the next tick.
    let second = manager.attribute("sim://dev/attr2").unwrap();
    let rec2 = Recorder::new();
    second
        .add_listener(Arc::clone(&rec2) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(rec2.count(EventKind::Periodic), 1);
    assert!(second.cached_value().is_ok());

    // From the next tick on, both attributes share one bulk read.
    let bulk_before = dev.bulk_read_count();
    sleep(Duration::from_millis(500)).await;
    assert!(dev.bulk_read_count() > bulk_before);
    assert!(rec2.count(EventKind::Periodic) >= 2);

    let factory = manager.factory("sim").unwrap();
    assert_eq!(factory.polling_groups(), vec![(Duration::from_millis(500), 2)]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn same_name_spellings_share_one_entity() {
    let (manager, _net) = setup(serial_cfg(500));
    let a = manager.attribute("sim://motor/lab/position").unwrap();
    let b = manager.attribute("SIM://motor/lab/position").unwrap();
    let c = manager.attribute("motor/lab/position").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn push_events_flow_in_order() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(entity.subscription_state(), SubscriptionState::Subscribed);
    assert!(!entity.is_polling_active());

    for i in 10..15 {
        dev.push_value("attr", AttrValue::Int(i)).await;
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        rec.values(EventKind::Change),
        vec![
            AttrValue::Int(0),
            AttrValue::Int(10),
            AttrValue::Int(11),
            AttrValue::Int(12),
            AttrValue::Int(13),
            AttrValue::Int(14)
        ]
    );
    assert_eq!(entity.cached_value().unwrap(), AttrValue::Int(14));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bursts_coalesce_to_the_latest_value() {
    let cfg = EngineConfig {
        buffer_period: Duration::from_millis(100),
        ..serial_cfg(500)
    };
    let (manager, net) = setup(cfg);
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();
    // Let the initial push flush out of the buffer on its own.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(rec.count(EventKind::Change), 1);

    for i in 100..105 {
        dev.push_value("attr", AttrValue::Int(i)).await;
    }
    sleep(Duration::from_millis(150)).await;

    // One burst, one delivered event, carrying the newest value.
    assert_eq!(rec.count(EventKind::Change), 2);
    assert_eq!(
        rec.values(EventKind::Change).last(),
        Some(&AttrValue::Int(104))
    );

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn error_events_bypass_the_buffer() {
    let cfg = EngineConfig {
        buffer_period: Duration::from_millis(200),
        ..serial_cfg(500)
    };
    let (manager, net) = setup(cfg);
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(250)).await;

    dev.push_error(
        "attr",
        ProxyError::new(FaultReason::DeviceUnreachable, "powered off"),
    )
    .await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(rec.count(EventKind::Error), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn blocked_read_waits_for_the_initial_push() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    entity
        .add_listener(Recorder::new() as Arc<dyn EventListener>)
        .await
        .unwrap();

    // The cached read is satisfied by the push channel; the backend's
    // read path is never used.
    let value = entity.read(true).await.unwrap();
    assert_eq!(value, AttrValue::Int(0));
    assert_eq!(dev.read_count(), 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_listener_catches_up_from_cache() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    entity
        .add_listener(Recorder::new() as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    dev.push_value("attr", AttrValue::Int(42)).await;
    sleep(Duration::from_millis(10)).await;

    let late = Recorder::new();
    entity
        .add_listener(Arc::clone(&late) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(late.values(EventKind::Change), vec![AttrValue::Int(42)]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn catch_up_disabled_leaves_late_listeners_silent() {
    let cfg = EngineConfig {
        catch_up: false,
        ..serial_cfg(500)
    };
    let (manager, net) = setup(cfg);
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    entity
        .add_listener(Recorder::new() as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    dev.push_value("attr", AttrValue::Int(42)).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(entity.cached_value().unwrap(), AttrValue::Int(42));

    // No synthetic event for the late joiner; it only sees live traffic.
    let late = Recorder::new();
    entity
        .add_listener(Arc::clone(&late) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(late.kinds().is_empty());

    dev.push_value("attr", AttrValue::Int(43)).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(late.values(EventKind::Change), vec![AttrValue::Int(43)]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fatal_subscribe_failure_stays_down() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");
    dev.set_behavior(
        "attr",
        SubscribeBehavior::FailFatal(FaultReason::AttributeUnknown),
    );

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(600)).await;

    assert_eq!(entity.subscription_state(), SubscriptionState::Unsubscribed);
    assert!(!entity.is_polling_active());
    assert_eq!(rec.kinds(), vec![EventKind::Error]);
    assert!(matches!(
        entity.cached_value().unwrap_err(),
        CoreError::Read { .. }
    ));
    // The fault is cached; nothing kept hammering the backend.
    assert_eq!(dev.read_count(), 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn write_is_encoded_to_the_declared_kind() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");
    dev.describe_with(
        "attr",
        AttrInfo {
            label: Some("Position".into()),
            unit: Some("mm".into()),
            writable: true,
            kind: Some(ValueKind::Float),
            ..AttrInfo::default()
        },
    );

    let entity = manager.attribute("sim://dev/attr").unwrap();
    entity
        .add_listener(Recorder::new() as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(entity.info().unwrap().unit.as_deref(), Some("mm"));

    let back = entity.write(AttrValue::Int(5)).await.unwrap();
    assert_eq!(back, Some(AttrValue::Float(5.0)));
    assert_eq!(dev.written("attr"), Some(AttrValue::Float(5.0)));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removing_the_last_listener_frees_backend_resources() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let listener: Arc<dyn EventListener> = Recorder::new();
    entity.add_listener(Arc::clone(&listener)).await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(dev.subscription_count(), 1);

    assert!(entity.remove_listener(&listener).await);
    assert_eq!(dev.subscription_count(), 0);
    assert_eq!(entity.subscription_state(), SubscriptionState::Unsubscribed);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_listening_pins_the_subscription() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    entity.force_listening().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(dev.subscription_count(), 1);

    entity.unforce_listening().await;
    assert_eq!(dev.subscription_count(), 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pool_wide_disable_pauses_polling_without_forgetting_members() {
    let (manager, net) = setup(serial_cfg(100));
    net.device("dev").set_behavior(
        "attr",
        SubscribeBehavior::FailRetryable(FaultReason::EventChannelDown),
    );

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(250)).await;
    let before = rec.count(EventKind::Periodic);
    assert!(before >= 2);

    let factory = manager.factory("sim").unwrap();
    factory.disable_polling();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(rec.count(EventKind::Periodic), before);
    assert!(entity.is_polling_active());

    factory.enable_polling();
    sleep(Duration::from_millis(150)).await;
    assert!(rec.count(EventKind::Periodic) > before);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn changing_the_polling_period_moves_the_entity() {
    let (manager, net) = setup(serial_cfg(500));
    net.device("dev").set_behavior(
        "attr",
        SubscribeBehavior::FailRetryable(FaultReason::PushUnsupported),
    );

    let entity = manager.attribute("sim://dev/attr").unwrap();
    let rec = Recorder::new();
    entity
        .add_listener(Arc::clone(&rec) as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    entity.change_polling_period(Duration::from_millis(100));
    let factory = manager.factory("sim").unwrap();
    assert_eq!(factory.polling_groups(), vec![(Duration::from_millis(100), 1)]);

    let before = rec.count(EventKind::Periodic);
    sleep(Duration::from_millis(450)).await;
    assert!(rec.count(EventKind::Periodic) >= before + 4);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_tears_everything_down() {
    let (manager, net) = setup(serial_cfg(500));
    let dev = net.device("dev");

    let entity = manager.attribute("sim://dev/attr").unwrap();
    entity
        .add_listener(Recorder::new() as Arc<dyn EventListener>)
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(dev.subscription_count(), 1);

    manager.shutdown().await;
    assert_eq!(dev.subscription_count(), 0);
    assert!(matches!(
        entity.read(true).await.unwrap_err(),
        CoreError::Defunct(_)
    ));
}
