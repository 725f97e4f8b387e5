//! Delivery diagnostics.
//!
//! Best-effort observability for the pipeline: counters plus a short ring of
//! recent delivery attempts and a process CPU/RSS sample. Nothing here is
//! surfaced to the host page; the coordinator logs a snapshot line on each
//! heartbeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_ATTEMPTS: usize = 20;

/// One reliable-path delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptMetrics {
    pub timestamp: DateTime<Utc>,
    pub batch_token: u64,
    pub record_count: usize,
    pub duration_ms: u64,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub system: SystemSample,
    pub recent_attempts: Vec<AttemptMetrics>,
    pub submitted: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
}

pub struct DeliveryStats {
    inner: Arc<Mutex<StatsState>>,
}

struct StatsState {
    recent_attempts: Vec<AttemptMetrics>,
    submitted: u64,
    rejected: u64,
    delivered: u64,
    dropped: u64,
    transient_failures: u64,
    permanent_failures: u64,
    system: System,
    pid: Pid,
}

impl DeliveryStats {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(StatsState {
                recent_attempts: Vec::with_capacity(MAX_RECENT_ATTEMPTS),
                submitted: 0,
                rejected: 0,
                delivered: 0,
                dropped: 0,
                transient_failures: 0,
                permanent_failures: 0,
                system,
                pid,
            })),
        }
    }

    pub async fn record_submitted(&self) {
        self.inner.lock().await.submitted += 1;
    }

    pub async fn record_rejected(&self) {
        self.inner.lock().await.rejected += 1;
    }

    pub async fn record_delivered(&self, count: u64) {
        self.inner.lock().await.delivered += count;
    }

    pub async fn record_dropped(&self, count: u64) {
        self.inner.lock().await.dropped += count;
    }

    pub async fn record_transient_failure(&self) {
        self.inner.lock().await.transient_failures += 1;
    }

    pub async fn record_permanent_failure(&self) {
        self.inner.lock().await.permanent_failures += 1;
    }

    pub async fn record_attempt(&self, attempt: AttemptMetrics) {
        let mut state = self.inner.lock().await;
        state.recent_attempts.push(attempt);
        if state.recent_attempts.len() > MAX_RECENT_ATTEMPTS {
            state.recent_attempts.remove(0);
        }
    }

    pub async fn get_snapshot(&self) -> StatsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = if let Some(process) = state.system.process(pid) {
            SystemSample {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            }
        } else {
            SystemSample {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            }
        };

        StatsSnapshot {
            system,
            recent_attempts: state.recent_attempts.clone(),
            submitted: state.submitted,
            rejected: state.rejected,
            delivered: state.delivered,
            dropped: state.dropped,
            transient_failures: state.transient_failures,
            permanent_failures: state.permanent_failures,
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DeliveryStats {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
