//! 📦 Common data structures -- the things that ride the channels.
//!
//! 🎬 *[an Event enters. it has a timestamp, a message, and a bag of fields it refuses to explain.]*
//!
//! [`Event`] is owned by the pipeline. We only read it. [`Incoming`] pairs it with the
//! pipeline's [`EventId`] so acknowledgements can find their way home even when batches
//! finish out of order. [`DeliveryReport`] is what goes back upstream, one per event, always.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::FlushError;

/// 🏷️ The pipeline's identity for an event. Opaque to us. Echoed back in every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 📜 One structured log record.
///
/// `extra` is open-ended on purpose: schemas are not known in advance, so values stay as
/// tagged [`Value`]s and get serialized generically. An integer stays an integer.
/// Deserializes from the flat JSON shape the CLI reads (`@timestamp`, `message`, everything else).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(rename = "@timestamp", alias = "timestamp", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
            extra: Map::new(),
        }
    }

    /// 🔧 Builder-style field setter. Handy in tests, harmless elsewhere.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// 🔍 Find a field by exact name, then by dotted path into nested objects.
    ///
    /// `http.status` first looks for a literal key `"http.status"`, then walks `http` → `status`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.extra.get(name) {
            return Some(value);
        }
        let mut parts = name.split('.');
        let mut current = self.extra.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

/// 📥 An event as it arrives from the pipeline, tagged with the pipeline's id.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub id: EventId,
    pub event: Event,
}

/// 📤 The per-event verdict sent back upstream.
///
/// - `Acked`: the backend accepted the document.
/// - `Rejected`: the backend (or the mapper) refused this one document. Retrying won't help.
/// - `Failed`: the whole batch never made it. The pipeline decides whether to requeue.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    Acked {
        id: EventId,
    },
    Rejected {
        id: EventId,
        index: String,
        doc_id: Option<String>,
        /// HTTP status of the bulk item, `0` when we refused it before sending.
        status: u16,
        reason: String,
    },
    Failed {
        id: EventId,
        error: FlushError,
    },
}

impl DeliveryReport {
    pub fn id(&self) -> EventId {
        match self {
            DeliveryReport::Acked { id }
            | DeliveryReport::Rejected { id, .. }
            | DeliveryReport::Failed { id, .. } => *id,
        }
    }

    pub fn is_acked(&self) -> bool {
        matches!(self, DeliveryReport::Acked { .. })
    }
}
