//! Durable flush scheduling.
//!
//! The coordinating process can be evicted between any two callbacks, so an
//! ordinary in-process timer is not enough: the armed deadline has to
//! survive the process. `DurableScheduler` is the seam; `TokioScheduler`
//! implements it with a tokio sleep task plus a deadline persisted in the
//! store's identity table, resumed on the next process start.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::store::{QueueStore, IDENTITY_FLUSH_DEADLINE};

/// Timer abstraction the flush logic is written against. `arm` replaces any
/// previously armed deadline.
#[async_trait]
pub trait DurableScheduler: Send + Sync {
    /// Resume a deadline persisted by a previous incarnation. Returns the
    /// remaining delay when one was re-armed.
    async fn resume(&self) -> Option<Duration>;

    async fn arm(&self, delay: Duration);

    async fn cancel(&self);
}

/// Real scheduler: one sleeping task at a time; expiry pushes a tick into
/// the coordinator's signal channel.
pub struct TokioScheduler {
    store: QueueStore,
    tick_tx: mpsc::Sender<()>,
    armed: Mutex<Option<JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(store: QueueStore, tick_tx: mpsc::Sender<()>) -> Self {
        Self {
            store,
            tick_tx,
            armed: Mutex::new(None),
        }
    }

    async fn spawn_alarm(&self, delay: Duration) {
        let mut guard = self.armed.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let tick_tx = self.tick_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tick_tx.send(()).await.is_err() {
                debug!("Flush tick receiver dropped; coordinator is gone");
            }
        });

        *guard = Some(handle);
    }
}

#[async_trait]
impl DurableScheduler for TokioScheduler {
    async fn resume(&self) -> Option<Duration> {
        let persisted = match self.store.get_identity(IDENTITY_FLUSH_DEADLINE).await {
            Ok(value) => value?,
            Err(err) => {
                error!("Failed to read persisted flush deadline: {err:?}");
                return None;
            }
        };

        let deadline = match DateTime::parse_from_rfc3339(&persisted) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(err) => {
                warn!("Discarding unparsable flush deadline '{persisted}': {err}");
                return None;
            }
        };

        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.spawn_alarm(remaining).await;
        Some(remaining)
    }

    async fn arm(&self, delay: Duration) {
        let deadline = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(err) = self
            .store
            .set_identity(IDENTITY_FLUSH_DEADLINE, deadline.to_rfc3339())
            .await
        {
            // The in-process alarm still fires; only restart recovery degrades.
            error!("Failed to persist flush deadline: {err:?}");
        }

        self.spawn_alarm(delay).await;
    }

    async fn cancel(&self) {
        let mut guard = self.armed.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        if let Err(err) = self.store.clear_identity(IDENTITY_FLUSH_DEADLINE).await {
            error!("Failed to clear persisted flush deadline: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> QueueStore {
        let path = std::env::temp_dir()
            .join(format!("beacon-sched-test-{}.sqlite3", uuid::Uuid::new_v4()));
        QueueStore::new(path).expect("store should initialize")
    }

    #[tokio::test]
    async fn armed_alarm_ticks_after_delay() {
        let store = temp_store();
        let (tick_tx, mut tick_rx) = mpsc::channel(4);
        let scheduler = TokioScheduler::new(store, tick_tx);

        scheduler.arm(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), tick_rx.recv())
            .await
            .expect("alarm should fire")
            .expect("tick channel should stay open");
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_alarm() {
        let store = temp_store();
        let (tick_tx, mut tick_rx) = mpsc::channel(4);
        let scheduler = TokioScheduler::new(store, tick_tx);

        scheduler.arm(Duration::from_secs(60)).await;
        scheduler.arm(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), tick_rx.recv())
            .await
            .expect("replacement alarm should fire")
            .expect("tick channel should stay open");

        // Nothing further queued: the 60s alarm was aborted.
        assert!(tick_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deadline_survives_into_a_new_scheduler() {
        let path = std::env::temp_dir()
            .join(format!("beacon-sched-test-{}.sqlite3", uuid::Uuid::new_v4()));

        {
            let store = QueueStore::new(path.clone()).unwrap();
            let (tick_tx, _tick_rx) = mpsc::channel(4);
            let scheduler = TokioScheduler::new(store, tick_tx);
            scheduler.arm(Duration::from_secs(120)).await;
        }

        let store = QueueStore::new(path).unwrap();
        let (tick_tx, _tick_rx) = mpsc::channel(4);
        let scheduler = TokioScheduler::new(store, tick_tx);

        let remaining = scheduler
            .resume()
            .await
            .expect("persisted deadline should resume");
        assert!(remaining <= Duration::from_secs(120));
        assert!(remaining > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn expired_deadline_fires_immediately_on_resume() {
        let path = std::env::temp_dir()
            .join(format!("beacon-sched-test-{}.sqlite3", uuid::Uuid::new_v4()));

        {
            let store = QueueStore::new(path.clone()).unwrap();
            store
                .set_identity(
                    IDENTITY_FLUSH_DEADLINE,
                    (Utc::now() - chrono::Duration::seconds(30)).to_rfc3339(),
                )
                .await
                .unwrap();
        }

        let store = QueueStore::new(path).unwrap();
        let (tick_tx, mut tick_rx) = mpsc::channel(4);
        let scheduler = TokioScheduler::new(store, tick_tx);

        let remaining = scheduler.resume().await.unwrap();
        assert_eq!(remaining, Duration::ZERO);

        tokio::time::timeout(Duration::from_secs(1), tick_rx.recv())
            .await
            .expect("expired deadline should tick immediately")
            .expect("tick channel should stay open");
    }
}
