//! Observation record data model.
//!
//! An observation record is one sanitized behavioral event captured from a
//! page context (or synthesized by the coordinator itself). Records only
//! ever carry structural metadata — the sanitizer guarantees no raw content
//! survives into `attributes`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of observation kinds accepted by the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Navigation,
    Interaction,
    Cadence,
    Lifecycle,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Navigation => "navigation",
            RecordKind::Interaction => "interaction",
            RecordKind::Cadence => "cadence",
            RecordKind::Lifecycle => "lifecycle",
        }
    }
}

/// Scalar attribute value. Attributes never nest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Float(f64),
    Flag(bool),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Flag(value)
    }
}

/// Attribute map. BTreeMap keeps iteration order stable so clamping and
/// serialization are deterministic.
pub type AttrMap = BTreeMap<String, AttrValue>;

/// One captured behavioral event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationRecord {
    pub kind: RecordKind,
    pub attributes: AttrMap,
    /// Originating page path/host at capture time.
    pub context: String,
    pub captured_at: DateTime<Utc>,
}

impl ObservationRecord {
    pub fn new(kind: RecordKind, attributes: AttrMap, context: impl Into<String>) -> Self {
        Self {
            kind,
            attributes,
            context: context.into(),
            captured_at: Utc::now(),
        }
    }
}

/// A queued record plus its enqueue-order bookkeeping. Owned exclusively by
/// the durable queue until a batch containing it is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub seq: u64,
    pub record: ObservationRecord,
}

/// Bounded slice of entries taken from the queue head for one transmission
/// attempt. Lives only for the duration of that attempt.
#[derive(Debug)]
pub struct Batch {
    pub token: u64,
    pub entries: Vec<QueueEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
