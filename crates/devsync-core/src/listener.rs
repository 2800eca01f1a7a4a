// ── Listener registry ──
//
// Every synchronized entity owns one of these. Registrations carry a
// token and hold the observer either strongly or weakly; weak ones are
// liveness-checked and pruned silently. Delivery isolates each listener:
// a panicking observer is logged and skipped, never propagated.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event::AttrEvent;

/// The one-method observer contract.
///
/// Implementations must be prepared to be called from dispatcher worker
/// tasks (Concurrent mode) or directly on the producing task (Serial
/// mode).
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &AttrEvent);
}

impl<F> EventListener for F
where
    F: Fn(&AttrEvent) + Send + Sync,
{
    fn on_event(&self, event: &AttrEvent) {
        self(event);
    }
}

/// Opaque registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> ListenerToken {
    ListenerToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
}

enum ListenerRef {
    Strong(Arc<dyn EventListener>),
    Weak(Weak<dyn EventListener>),
}

impl ListenerRef {
    fn upgrade(&self) -> Option<Arc<dyn EventListener>> {
        match self {
            ListenerRef::Strong(l) => Some(Arc::clone(l)),
            ListenerRef::Weak(w) => w.upgrade(),
        }
    }

    /// Identity comparison by address, ignoring strength.
    fn is(&self, other: &Arc<dyn EventListener>) -> bool {
        let addr = match self {
            ListenerRef::Strong(l) => Arc::as_ptr(l).cast::<()>(),
            ListenerRef::Weak(w) => w.as_ptr().cast::<()>(),
        };
        std::ptr::eq(addr, Arc::as_ptr(other).cast::<()>())
    }

    fn is_dead(&self) -> bool {
        match self {
            ListenerRef::Strong(_) => false,
            ListenerRef::Weak(w) => w.strong_count() == 0,
        }
    }
}

struct Registration {
    token: ListenerToken,
    target: ListenerRef,
}

/// Set of observers attached to one entity.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an owning reference. Returns `None` if the listener is
    /// already present (idempotent add).
    pub(crate) fn add(&self, listener: Arc<dyn EventListener>) -> Option<ListenerToken> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|r| !r.target.is_dead());
        if entries.iter().any(|r| r.target.is(&listener)) {
            return None;
        }
        let token = next_token();
        entries.push(Registration {
            token,
            target: ListenerRef::Strong(listener),
        });
        Some(token)
    }

    /// Register without extending the observer's lifetime. The entry is
    /// pruned silently once the observer is dropped.
    pub(crate) fn add_weak(&self, listener: &Arc<dyn EventListener>) -> Option<ListenerToken> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|r| !r.target.is_dead());
        if entries.iter().any(|r| r.target.is(listener)) {
            return None;
        }
        let token = next_token();
        entries.push(Registration {
            token,
            target: ListenerRef::Weak(Arc::downgrade(listener)),
        });
        Some(token)
    }

    /// Remove by identity. Returns false if absent.
    pub(crate) fn remove(&self, listener: &Arc<dyn EventListener>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|r| !r.target.is(listener) && !r.target.is_dead());
        before != entries.len()
    }

    pub(crate) fn remove_token(&self, token: ListenerToken) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|r| r.token != token && !r.target.is_dead());
        before != entries.len()
    }

    /// True if anybody (alive) is listening.
    pub(crate) fn has_listeners(&self) -> bool {
        self.live_count() > 0
    }

    pub(crate) fn live_count(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|r| !r.target.is_dead());
        entries.len()
    }

    /// Snapshot the live targets, optionally restricted to one token.
    /// Dead weak entries are pruned as a side effect.
    pub(crate) fn snapshot(&self, target: Option<ListenerToken>) -> Vec<Arc<dyn EventListener>> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|r| !r.target.is_dead());
        entries
            .iter()
            .filter(|r| target.is_none_or(|t| r.token == t))
            .filter_map(|r| r.target.upgrade())
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

/// Invoke each listener in isolation: a panic is logged and delivery
/// continues with the next one.
pub(crate) fn deliver(listeners: &[Arc<dyn EventListener>], event: &AttrEvent) {
    for l in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| l.on_event(event)));
        if outcome.is_err() {
            tracing::warn!(
                source = %event.source,
                kind = %event.kind,
                "listener panicked during event delivery; skipping it"
            );
        }
    }
}
