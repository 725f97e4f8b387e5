//! Batch transmission.
//!
//! Two capabilities, two seams: `ReliableTransport` is the ordinary
//! asynchronous path whose outcome drives requeue/backoff, and
//! `BestEffortTransport` is the fire-and-forget path the unload guard uses
//! when the host is tearing down and nothing can be awaited. They share the
//! wire model but none of the failure handling.

pub mod http;

use async_trait::async_trait;
use serde::Serialize;

use crate::model::{Batch, SessionIdentity};

pub use http::HttpTransport;

/// Classified result of one reliable delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Endpoint acknowledged receipt of `accepted` records.
    Accepted { accepted: u64 },
    /// Network error or retryable server response; the batch requeues.
    TransientFailure { reason: String },
    /// Endpoint rejected the batch itself; retrying cannot succeed.
    PermanentFailure { reason: String },
}

/// One record on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub url: String,
    pub timestamp: String,
}

/// Body of one `POST <endpoint>` call.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPayload {
    pub user_id: String,
    pub session_id: String,
    pub events: Vec<WireEvent>,
}

impl BatchPayload {
    pub fn from_batch(identity: &SessionIdentity, batch: &Batch) -> Self {
        let events = batch
            .entries
            .iter()
            .map(|entry| WireEvent {
                kind: entry.record.kind.as_str().to_string(),
                data: serde_json::to_value(&entry.record.attributes)
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
                url: entry.record.context.clone(),
                timestamp: entry.record.captured_at.to_rfc3339(),
            })
            .collect();

        Self {
            user_id: identity.user_id.clone(),
            session_id: identity.session_id.clone(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Ordinary asynchronous delivery with an observed outcome.
#[async_trait]
pub trait ReliableTransport: Send + Sync {
    async fn deliver(&self, payload: &BatchPayload) -> DeliveryOutcome;
}

/// Non-blocking final-flush delivery. No retry, no outcome: the call must
/// return immediately because the host gives no guarantee anything after it
/// runs.
pub trait BestEffortTransport: Send + Sync {
    fn deliver_detached(&self, payload: BatchPayload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrMap, AttrValue, ObservationRecord, QueueEntry, RecordKind};
    use chrono::{TimeZone, Utc};

    #[test]
    fn payload_carries_identity_and_wire_shape() {
        let identity = SessionIdentity {
            session_id: "sess-1".into(),
            user_id: "user-1".into(),
        };

        let mut attributes = AttrMap::new();
        attributes.insert("tag".into(), AttrValue::from("button"));
        attributes.insert("count".into(), AttrValue::Int(3));

        let captured_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let batch = Batch {
            token: 7,
            entries: vec![QueueEntry {
                seq: 1,
                record: ObservationRecord {
                    kind: RecordKind::Interaction,
                    attributes,
                    context: "/inbox".into(),
                    captured_at,
                },
            }],
        };

        let payload = BatchPayload::from_batch(&identity, &batch);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["user_id"], "user-1");
        assert_eq!(json["session_id"], "sess-1");
        assert_eq!(json["events"][0]["type"], "interaction");
        assert_eq!(json["events"][0]["url"], "/inbox");
        assert_eq!(json["events"][0]["data"]["tag"], "button");
        assert_eq!(json["events"][0]["data"]["count"], 3);
        assert_eq!(json["events"][0]["timestamp"], "2025-06-01T12:00:00+00:00");
    }
}
