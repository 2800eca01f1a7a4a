// ── Event coalescing ──
//
// Optional per-entity rate limiting: within one buffer window, bursts of
// events of the same kind collapse to the latest one. Error events are
// never held back. Coalescing deliberately relaxes strict per-entity
// ordering in exchange for a bounded delivery rate; entities with a zero
// window bypass this module entirely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::event::{AttrEvent, EventKind};

/// Latest-wins holding buffer for one entity's regular events.
pub(crate) struct EventBuffer {
    window: Duration,
    slots: Mutex<HashMap<EventKind, AttrEvent>>,
}

impl EventBuffer {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    /// Stash `event` for the next flush, replacing any pending event of
    /// the same kind. Returns `false` for kinds that must not be held
    /// back; the caller delivers those immediately.
    pub(crate) fn offer(&self, event: AttrEvent) -> bool {
        if !event.kind.is_regular() {
            return false;
        }
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(event.kind, event);
        true
    }

    /// Take everything pending, oldest first.
    pub(crate) fn drain(&self) -> Vec<AttrEvent> {
        let mut out: Vec<AttrEvent> = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, e)| e)
            .collect();
        out.sort_by_key(|e| e.received_at);
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use super::*;
    use crate::event::{AttrValue, EventData};
    use crate::proxy::{FaultReason, ProxyError};

    fn value_event(kind: EventKind, v: i64) -> AttrEvent {
        AttrEvent::new(
            Arc::from("sim://dev/attr"),
            kind,
            EventData::Value(AttrValue::Int(v)),
        )
    }

    #[test]
    fn burst_of_same_kind_collapses_to_latest() {
        let buf = EventBuffer::new(Duration::from_millis(100));
        for i in 0..5 {
            assert!(buf.offer(value_event(EventKind::Change, i)));
        }
        let drained = buf.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].value(), Some(&AttrValue::Int(4)));
        assert!(buf.is_empty());
    }

    #[test]
    fn different_kinds_keep_their_own_slot() {
        let buf = EventBuffer::new(Duration::from_millis(100));
        buf.offer(value_event(EventKind::Change, 1));
        buf.offer(value_event(EventKind::Periodic, 2));
        assert_eq!(buf.drain().len(), 2);
    }

    #[test]
    fn error_events_are_refused() {
        let buf = EventBuffer::new(Duration::from_millis(100));
        let e = AttrEvent::new(
            Arc::from("sim://dev/attr"),
            EventKind::Error,
            EventData::Error(Arc::new(ProxyError::new(
                FaultReason::DeviceUnreachable,
                "down",
            ))),
        );
        assert!(!buf.offer(e));
        assert!(buf.is_empty());
    }
}
