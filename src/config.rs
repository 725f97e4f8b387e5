//! Agent configuration.
//!
//! Loaded from a JSON file when one exists; every option has a safe default
//! for local operation, and a malformed file falls back to defaults rather
//! than failing the agent.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::flush::BackoffPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Collection endpoint receiving batch POSTs.
    pub endpoint: String,
    /// Fixed user identifier. When absent a pseudonymous id is generated
    /// once and persisted in the store.
    pub user_id: Option<String>,
    /// Optional API key sent with every batch.
    pub api_key: Option<String>,
    /// Scheduled flush interval while deliveries succeed; also the backoff
    /// base.
    pub batch_interval_secs: u64,
    /// Hard cap on records per transmitted batch.
    pub max_batch_size: usize,
    /// Interval between lifecycle heartbeat records.
    pub heartbeat_interval_secs: u64,
    /// Mirror retention cap; oldest pending records beyond it are dropped.
    pub retention_cap: usize,
    /// Ceiling for the backoff interval.
    pub backoff_max_secs: u64,
    /// Retry batches the endpoint permanently rejected (4xx) instead of
    /// dropping them.
    pub retry_rejected_batches: bool,
    /// Directory holding the SQLite store.
    pub data_dir: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/api/events/collect".into(),
            user_id: None,
            api_key: None,
            batch_interval_secs: 30,
            max_batch_size: 50,
            heartbeat_interval_secs: 60,
            retention_cap: 200,
            backoff_max_secs: 300,
            retry_rejected_batches: false,
            data_dir: PathBuf::from("beacon-data"),
        }
    }
}

impl CollectorConfig {
    /// Read configuration from `path`. A missing or unparsable file yields
    /// the defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring malformed config at {}: {err}",
                    path.display()
                );
                Self::default()
            }),
            Err(err) => {
                log::warn!("Failed to read config at {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("beacon.sqlite3")
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.batch_interval(),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}
