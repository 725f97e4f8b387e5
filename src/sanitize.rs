//! Record sanitizer and observation-source adapters.
//!
//! Everything a page context submits passes through `sanitize` before it can
//! touch the queue. The sanitizer is a pure function: it truncates string
//! fields to a hard cap, drops attributes whose keys name sensitive content,
//! and rejects malformed input outright instead of erroring. Applying it
//! twice yields the same record as applying it once.

use chrono::{DateTime, Utc};

use crate::model::{AttrMap, AttrValue, ObservationRecord, RecordKind};

/// Hard cap on every string field in a record's attributes.
pub const MAX_FIELD_CHARS: usize = 80;

/// Cap on the page context string.
pub const MAX_CONTEXT_CHARS: usize = 120;

/// Cap on the number of attributes one record may carry.
pub const MAX_ATTRIBUTES: usize = 16;

/// Class lists on element descriptors get at most this many entries.
const MAX_CLASS_ENTRIES: usize = 4;

/// Attribute keys that could name raw user content. Matched
/// case-insensitively against the full key.
const SENSITIVE_KEYS: &[&str] = &[
    "value",
    "text",
    "content",
    "password",
    "secret",
    "token",
    "clipboard",
    "keystrokes",
    "selection",
];

/// Sanitize a candidate record. Returns `None` for malformed input (the
/// record is dropped, never surfaced to the host page).
pub fn sanitize(raw: ObservationRecord) -> Option<ObservationRecord> {
    let context = truncate_chars(raw.context.trim(), MAX_CONTEXT_CHARS);
    if context.is_empty() {
        return None;
    }

    let mut attributes = AttrMap::new();
    for (key, value) in raw.attributes {
        if attributes.len() >= MAX_ATTRIBUTES {
            break;
        }
        if is_sensitive_key(&key) {
            continue;
        }
        let key = truncate_chars(&key, MAX_FIELD_CHARS);
        let value = match value {
            AttrValue::Text(text) => AttrValue::Text(truncate_chars(&text, MAX_FIELD_CHARS)),
            other => other,
        };
        attributes.insert(key, value);
    }

    Some(ObservationRecord {
        kind: raw.kind,
        attributes,
        context,
        captured_at: raw.captured_at,
    })
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS
        .iter()
        .any(|denied| key.eq_ignore_ascii_case(denied))
}

/// Truncate to at most `cap` characters on a char boundary.
fn truncate_chars(value: &str, cap: usize) -> String {
    value.chars().take(cap).collect()
}

/// Build the structural-only descriptor for an interacted element: tag name,
/// id, truncated class list, input type. Never element content.
pub fn element_descriptor(
    tag: &str,
    id: Option<&str>,
    classes: &[String],
    input_type: Option<&str>,
) -> AttrMap {
    let mut attrs = AttrMap::new();
    attrs.insert("tag".into(), AttrValue::from(tag.to_ascii_lowercase()));
    if let Some(id) = id {
        if !id.is_empty() {
            attrs.insert("id".into(), AttrValue::from(truncate_chars(id, MAX_FIELD_CHARS)));
        }
    }
    if !classes.is_empty() {
        let joined = classes
            .iter()
            .take(MAX_CLASS_ENTRIES)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        attrs.insert("classes".into(), AttrValue::from(truncate_chars(&joined, MAX_FIELD_CHARS)));
    }
    if let Some(input_type) = input_type {
        attrs.insert(
            "input_type".into(),
            AttrValue::from(truncate_chars(input_type, MAX_FIELD_CHARS)),
        );
    }
    attrs
}

/// Collapse a run of raw timing samples into a single cadence record
/// carrying aggregate statistics only. The per-sample values never leave
/// this function, which bounds queue growth and strips the fine-grained
/// signal.
pub fn aggregate_cadence(
    samples: &[f64],
    context: &str,
    captured_at: DateTime<Utc>,
) -> Option<ObservationRecord> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len();
    let sum: f64 = samples.iter().sum();
    let average = sum / count as f64;
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let mut attributes = AttrMap::new();
    attributes.insert("count".into(), AttrValue::Int(count as i64));
    attributes.insert("average".into(), AttrValue::Float(average));
    attributes.insert("min".into(), AttrValue::Float(min));
    attributes.insert("max".into(), AttrValue::Float(max));

    sanitize(ObservationRecord {
        kind: RecordKind::Cadence,
        attributes,
        context: context.to_string(),
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(attrs: AttrMap) -> ObservationRecord {
        ObservationRecord {
            kind: RecordKind::Interaction,
            attributes: attrs,
            context: "/inbox".into(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn strips_sensitive_keys() {
        let mut attrs = AttrMap::new();
        attrs.insert("Password".into(), AttrValue::from("hunter2"));
        attrs.insert("tag".into(), AttrValue::from("input"));

        let clean = sanitize(record_with(attrs)).unwrap();
        assert!(!clean.attributes.contains_key("Password"));
        assert_eq!(clean.attributes.get("tag"), Some(&AttrValue::from("input")));
    }

    #[test]
    fn truncates_long_string_fields() {
        let mut attrs = AttrMap::new();
        attrs.insert("classes".into(), AttrValue::from("x".repeat(500)));

        let clean = sanitize(record_with(attrs)).unwrap();
        match clean.attributes.get("classes").unwrap() {
            AttrValue::Text(text) => assert_eq!(text.chars().count(), MAX_FIELD_CHARS),
            other => panic!("expected text attribute, got {other:?}"),
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut attrs = AttrMap::new();
        attrs.insert("id".into(), AttrValue::from("é".repeat(100)));

        let clean = sanitize(record_with(attrs)).unwrap();
        match clean.attributes.get("id").unwrap() {
            AttrValue::Text(text) => assert_eq!(text.chars().count(), MAX_FIELD_CHARS),
            other => panic!("expected text attribute, got {other:?}"),
        }
    }

    #[test]
    fn clamps_attribute_count() {
        let mut attrs = AttrMap::new();
        for i in 0..40 {
            attrs.insert(format!("attr_{i:02}"), AttrValue::Int(i));
        }

        let clean = sanitize(record_with(attrs)).unwrap();
        assert_eq!(clean.attributes.len(), MAX_ATTRIBUTES);
    }

    #[test]
    fn rejects_empty_context() {
        let raw = ObservationRecord {
            kind: RecordKind::Interaction,
            attributes: AttrMap::new(),
            context: "   ".into(),
            captured_at: Utc::now(),
        };
        assert!(sanitize(raw).is_none());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut attrs = AttrMap::new();
        attrs.insert("tag".into(), AttrValue::from("a"));
        attrs.insert("title".into(), AttrValue::from("y".repeat(300)));
        attrs.insert("token".into(), AttrValue::from("abc123"));

        let once = sanitize(record_with(attrs)).unwrap();
        let twice = sanitize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn element_descriptor_is_structural_only() {
        let classes = vec![
            "btn".to_string(),
            "btn-primary".to_string(),
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ];
        let attrs = element_descriptor("INPUT", Some("login"), &classes, Some("email"));

        assert_eq!(attrs.get("tag"), Some(&AttrValue::from("input")));
        assert_eq!(attrs.get("id"), Some(&AttrValue::from("login")));
        assert_eq!(attrs.get("input_type"), Some(&AttrValue::from("email")));
        match attrs.get("classes").unwrap() {
            AttrValue::Text(joined) => {
                assert_eq!(joined, "btn btn-primary a b");
            }
            other => panic!("expected text attribute, got {other:?}"),
        }
    }

    #[test]
    fn cadence_run_collapses_to_aggregates() {
        let samples: Vec<f64> = (1..=20).map(|n| n as f64 * 10.0).collect();
        let record = aggregate_cadence(&samples, "/compose", Utc::now()).unwrap();

        assert_eq!(record.kind, RecordKind::Cadence);
        assert_eq!(record.attributes.get("count"), Some(&AttrValue::Int(20)));
        assert_eq!(record.attributes.get("min"), Some(&AttrValue::Float(10.0)));
        assert_eq!(record.attributes.get("max"), Some(&AttrValue::Float(200.0)));
        assert_eq!(record.attributes.get("average"), Some(&AttrValue::Float(105.0)));
        assert_eq!(record.attributes.len(), 4);
    }

    #[test]
    fn empty_cadence_run_is_dropped() {
        assert!(aggregate_cadence(&[], "/compose", Utc::now()).is_none());
    }
}
