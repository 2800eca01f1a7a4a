// ── Values, events, attribute metadata ──
//
// The value model is deliberately small: scalars plus numeric arrays.
// Backends with richer types map them onto these before handing them to
// the engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proxy::{FaultReason, ProxyError};

// ── AttrValue ────────────────────────────────────────────────────────

/// A device attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

/// The declared type of an attribute, used to encode written values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
    IntArray,
    FloatArray,
}

impl AttrValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            AttrValue::Bool(_) => ValueKind::Bool,
            AttrValue::Int(_) => ValueKind::Int,
            AttrValue::Float(_) => ValueKind::Float,
            AttrValue::Str(_) => ValueKind::Str,
            AttrValue::IntArray(_) => ValueKind::IntArray,
            AttrValue::FloatArray(_) => ValueKind::FloatArray,
        }
    }

    /// Coerce this value to the attribute's declared type.
    ///
    /// Lossless-ish conversions only (int↔float, anything→string,
    /// bool↔int); anything else is an `InvalidValue` fault.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn encode_as(&self, kind: ValueKind) -> Result<AttrValue, ProxyError> {
        if self.kind() == kind {
            return Ok(self.clone());
        }
        let encoded = match (self, kind) {
            (AttrValue::Int(i), ValueKind::Float) => Some(AttrValue::Float(*i as f64)),
            (AttrValue::Float(f), ValueKind::Int) => Some(AttrValue::Int(*f as i64)),
            (AttrValue::Bool(b), ValueKind::Int) => Some(AttrValue::Int(i64::from(*b))),
            (AttrValue::Int(i), ValueKind::Bool) => Some(AttrValue::Bool(*i != 0)),
            (AttrValue::IntArray(v), ValueKind::FloatArray) => Some(AttrValue::FloatArray(
                v.iter().map(|i| *i as f64).collect(),
            )),
            (v, ValueKind::Str) => Some(AttrValue::Str(v.to_string())),
            (AttrValue::Str(s), ValueKind::Float) => s.parse().ok().map(AttrValue::Float),
            (AttrValue::Str(s), ValueKind::Int) => s.parse().ok().map(AttrValue::Int),
            (AttrValue::Str(s), ValueKind::Bool) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(AttrValue::Bool(true)),
                "false" | "0" => Some(AttrValue::Bool(false)),
                _ => None,
            },
            _ => None,
        };
        encoded.ok_or_else(|| {
            ProxyError::new(
                FaultReason::InvalidValue,
                format!("cannot encode {} as {kind}", self.kind()),
            )
        })
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::IntArray(v) => write!(f, "{v:?}"),
            AttrValue::FloatArray(v) => write!(f, "{v:?}"),
        }
    }
}

// ── AttrInfo ─────────────────────────────────────────────────────────

/// Static attribute metadata, as reported by the backend.
///
/// The attribute entity owns its info one-way; the info never holds a
/// reference back to the entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrInfo {
    pub label: Option<String>,
    pub unit: Option<String>,
    /// printf-style display format hint, e.g. `%6.2f`.
    pub format: Option<String>,
    pub writable: bool,
    /// Declared value type; used to encode written values.
    pub kind: Option<ValueKind>,
}

// ── Events ───────────────────────────────────────────────────────────

/// What kind of notification an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum EventKind {
    /// Value changed (push notification or write read-back).
    Change,
    /// Attribute metadata changed.
    Config,
    /// Value refreshed by the polling fallback.
    Periodic,
    /// A backend fault was surfaced.
    Error,
}

impl EventKind {
    /// Regular events may be coalesced; errors always go straight through.
    pub fn is_regular(self) -> bool {
        !matches!(self, EventKind::Error)
    }
}

/// Event payload: a value, metadata, or a backend fault.
#[derive(Debug, Clone)]
pub enum EventData {
    Value(AttrValue),
    Info(AttrInfo),
    Error(Arc<ProxyError>),
}

/// The envelope delivered to listeners.
#[derive(Debug, Clone)]
pub struct AttrEvent {
    /// Canonical full name of the originating attribute.
    pub source: Arc<str>,
    pub kind: EventKind,
    pub data: EventData,
    pub received_at: DateTime<Utc>,
}

impl AttrEvent {
    pub(crate) fn new(source: Arc<str>, kind: EventKind, data: EventData) -> Self {
        Self {
            source,
            kind,
            data,
            received_at: Utc::now(),
        }
    }

    /// The value carried by this event, if any.
    pub fn value(&self) -> Option<&AttrValue> {
        match &self.data {
            EventData::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The fault carried by this event, if any.
    pub fn error(&self) -> Option<&ProxyError> {
        match &self.data {
            EventData::Error(e) => Some(e),
            _ => None,
        }
    }
}
