//! Cross-context navigation correlation.
//!
//! A page context cannot see what it was "before": a full-reload navigation
//! runs in a fresh context with no memory of the previous document. Only
//! the coordinating process observes every tab, so it keeps the
//! `tab id → last observed path` map and synthesizes the navigation records
//! itself.

use std::collections::HashMap;

use chrono::Utc;
use url::Url;

use crate::model::{AttrMap, AttrValue, ObservationRecord, RecordKind};

#[derive(Debug, Clone)]
struct TabView {
    path: String,
    host: String,
}

#[derive(Debug, Default)]
pub struct NavigationTracker {
    tabs: HashMap<i64, TabView>,
}

impl NavigationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a navigation-complete signal for a tab. Returns a synthesized
    /// navigation record when the tab moved to a different path.
    ///
    /// Malformed URLs are skipped. Non-http(s) origins are excluded
    /// entirely: the signal is ignored and the tab's last web page stays on
    /// record, so a later return to the web is attributed to it.
    pub fn navigation_committed(
        &mut self,
        tab_id: i64,
        raw_url: &str,
    ) -> Option<ObservationRecord> {
        let parsed = Url::parse(raw_url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }

        let host = parsed.host_str()?.to_string();
        let path = parsed.path().to_string();

        let previous = self.tabs.insert(
            tab_id,
            TabView {
                path: path.clone(),
                host: host.clone(),
            },
        );

        let previous = previous?;
        if previous.path == path {
            return None;
        }

        let mut attributes = AttrMap::new();
        attributes.insert("from".into(), AttrValue::from(previous.path));
        attributes.insert("to".into(), AttrValue::from(path.clone()));
        attributes.insert("host".into(), AttrValue::from(host));

        Some(ObservationRecord {
            kind: RecordKind::Navigation,
            attributes,
            context: path,
            captured_at: Utc::now(),
        })
    }

    /// Forget a closed tab.
    pub fn tab_closed(&mut self, tab_id: i64) {
        self.tabs.remove(&tab_id);
    }

    pub fn tracked_tabs(&self) -> usize {
        self.tabs.len()
    }
}
