// ── Polling fallback ──
//
// One timer per distinct period; each timer batches its members by owner
// device so a tick costs one bulk read per device, and devices are
// polled concurrently so one slow device cannot stall the rest. Members
// are held weakly: a dropped entity disappears from its group at the
// next tick without any unregistration call.
//
// Timer ticks fire immediately on start, so the first member of a new
// group is polled right away. A member joining an already-running group
// gets one out-of-band poll instead of waiting for the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::attribute::AttributeEntity;
use crate::proxy::SharedProxy;

struct Member {
    /// Bare attribute segment, as the proxy expects it.
    attr: String,
    /// Canonical full name, the removal key.
    full: String,
    entity: Weak<AttributeEntity>,
}

struct DeviceGroup {
    proxy: SharedProxy,
    members: Vec<Member>,
}

/// Periodic poller for every attribute sharing one period.
struct PollingTimer {
    period: Duration,
    devices: DashMap<String, DeviceGroup>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl PollingTimer {
    fn new(period: Duration) -> Arc<Self> {
        Arc::new(Self {
            period,
            devices: DashMap::new(),
            cancel: Mutex::new(None),
        })
    }

    fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    fn start(self: &Arc<Self>) {
        let mut guard = self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let timer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(timer.period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => timer.run_tick().await,
                }
            }
            tracing::trace!(period = ?timer.period, "polling timer stopped");
        });
    }

    fn stop(&self) {
        if let Some(cancel) = self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }

    fn insert(&self, entity: &Arc<AttributeEntity>) {
        let key = entity.device_key();
        let mut group = self.devices.entry(key).or_insert_with(|| DeviceGroup {
            proxy: entity.proxy(),
            members: Vec::new(),
        });
        let full = entity.name().full().to_owned();
        if group.members.iter().any(|m| m.full == full) {
            return;
        }
        group.members.push(Member {
            attr: entity.name().attribute().to_owned(),
            full,
            entity: Arc::downgrade(entity),
        });
    }

    /// Returns true when the timer has no members left.
    fn evict(&self, full_name: &str) -> bool {
        self.devices.retain(|_, group| {
            group.members.retain(|m| m.full != full_name);
            !group.members.is_empty()
        });
        self.devices.is_empty()
    }

    async fn run_tick(&self) {
        // Snapshot the groups first; dashmap guards must not be held
        // across the reads.
        let groups: Vec<_> = self
            .devices
            .iter()
            .map(|g| {
                let members: Vec<(String, Weak<AttributeEntity>)> = g
                    .members
                    .iter()
                    .map(|m| (m.attr.clone(), m.entity.clone()))
                    .collect();
                (Arc::clone(&g.proxy), members)
            })
            .collect();

        let polls = groups.into_iter().map(|(proxy, members)| async move {
            let attrs: Vec<String> = members.iter().map(|(a, _)| a.clone()).collect();
            for (attr, result) in proxy.read_many(&attrs).await {
                let hit = members
                    .iter()
                    .find(|(a, _)| *a == attr)
                    .and_then(|(_, w)| w.upgrade());
                if let Some(entity) = hit {
                    entity.apply_poll(result).await;
                }
            }
        });
        futures_util::future::join_all(polls).await;

        self.devices.retain(|_, group| {
            group.members.retain(|m| m.entity.strong_count() > 0);
            !group.members.is_empty()
        });
    }
}

/// All polling timers of one factory, keyed by period.
pub struct PollingPool {
    timers: DashMap<u64, Arc<PollingTimer>>,
    enabled: AtomicBool,
}

#[allow(clippy::cast_possible_truncation)]
fn period_key(period: Duration) -> u64 {
    period.as_millis() as u64
}

impl PollingPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: DashMap::new(),
            enabled: AtomicBool::new(true),
        })
    }

    /// Join the group for `period`, creating its timer on first use. A
    /// newly created timer ticks immediately; joining a running timer
    /// triggers one out-of-band poll so the newcomer does not wait a
    /// full period for its first value.
    pub(crate) fn add(&self, period: Duration, entity: &Arc<AttributeEntity>) {
        if period == Duration::ZERO {
            return;
        }
        let timer = Arc::clone(
            &self
                .timers
                .entry(period_key(period))
                .or_insert_with(|| PollingTimer::new(period)),
        );
        let already_running = timer.is_running();
        timer.insert(entity);
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        if already_running {
            let late = Arc::clone(entity);
            tokio::spawn(async move { late.poll_once().await });
        } else {
            timer.start();
        }
    }

    /// Leave the group for `period`. The timer is stopped and released
    /// when its last member leaves.
    pub(crate) fn remove(&self, period: Duration, full_name: &str) {
        let key = period_key(period);
        let empty = match self.timers.get(&key) {
            Some(timer) => timer.evict(full_name),
            None => return,
        };
        if empty {
            if let Some((_, timer)) = self.timers.remove(&key) {
                timer.stop();
            }
        }
    }

    /// Stop every timer without forgetting group membership.
    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        let timers: Vec<Arc<PollingTimer>> =
            self.timers.iter().map(|t| Arc::clone(t.value())).collect();
        for timer in timers {
            timer.stop();
        }
        tracing::debug!("polling disabled pool-wide");
    }

    /// Restart every timer that still has members.
    pub(crate) fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        let timers: Vec<Arc<PollingTimer>> =
            self.timers.iter().map(|t| Arc::clone(t.value())).collect();
        for timer in timers {
            if !timer.devices.is_empty() {
                timer.start();
            }
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Active groups as (period, member count), for introspection.
    pub(crate) fn groups(&self) -> Vec<(Duration, usize)> {
        let mut out: Vec<(Duration, usize)> = self
            .timers
            .iter()
            .map(|t| {
                let members = t.devices.iter().map(|g| g.members.len()).sum();
                (t.period, members)
            })
            .collect();
        out.sort_by_key(|(p, _)| *p);
        out
    }

    pub(crate) fn shutdown(&self) {
        let keys: Vec<u64> = self.timers.iter().map(|t| *t.key()).collect();
        for key in keys {
            if let Some((_, timer)) = self.timers.remove(&key) {
                timer.stop();
            }
        }
    }
}
