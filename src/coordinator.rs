//! The coordinating process.
//!
//! One task owns the durable queue, backoff state and navigation tracker.
//! Every mutation flows through a single `tokio::select!` loop: host
//! signals (submissions, tab navigation, teardown), scheduler ticks and the
//! heartbeat ticker never interleave, so no locking is needed within one
//! incarnation. The process itself can still be torn down between any two
//! callbacks; the durable mirror carries recovery.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;
use crate::correlate::NavigationTracker;
use crate::flush::{BackoffPolicy, BackoffState, DurableScheduler};
use crate::model::{AttrMap, AttrValue, ObservationRecord, RecordKind, SessionIdentity};
use crate::queue::DurableQueue;
use crate::sanitize::sanitize;
use crate::stats::{AttemptMetrics, DeliveryStats, StatsSnapshot};
use crate::store::QueueStore;
use crate::transmit::{BatchPayload, BestEffortTransport, DeliveryOutcome, ReliableTransport};

const SIGNAL_BUFFER: usize = 256;

/// Context string stamped on records the coordinator synthesizes itself.
const AGENT_CONTEXT: &str = "agent";

/// Inbound host signals. All queue mutation is serialized through these.
#[derive(Debug)]
pub enum HostSignal {
    Submit(ObservationRecord),
    NavigationCommitted { tab_id: i64, url: String },
    TabClosed { tab_id: i64 },
    Teardown,
    Snapshot(oneshot::Sender<PipelineSnapshot>),
}

/// Point-in-time view of the pipeline, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub session_id: String,
    pub queued: usize,
    pub consecutive_failures: u32,
    pub stats: StatsSnapshot,
}

/// Cheap, cloneable ingress for observation sources. Every method is
/// non-blocking: a saturated coordinator drops the signal rather than ever
/// stalling the host page.
#[derive(Clone)]
pub struct CollectorHandle {
    signal_tx: mpsc::Sender<HostSignal>,
}

impl CollectorHandle {
    pub fn submit(&self, record: ObservationRecord) {
        self.send(HostSignal::Submit(record));
    }

    pub fn navigation_committed(&self, tab_id: i64, url: impl Into<String>) {
        self.send(HostSignal::NavigationCommitted {
            tab_id,
            url: url.into(),
        });
    }

    pub fn tab_closed(&self, tab_id: i64) {
        self.send(HostSignal::TabClosed { tab_id });
    }

    /// Signal imminent host teardown. Triggers the unload guard.
    pub fn teardown(&self) {
        self.send(HostSignal::Teardown);
    }

    pub async fn snapshot(&self) -> Option<PipelineSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HostSignal::Snapshot(reply_tx));
        reply_rx.await.ok()
    }

    fn send(&self, signal: HostSignal) {
        if let Err(err) = self.signal_tx.try_send(signal) {
            warn!("Coordinator signal dropped: {err}");
        }
    }
}

pub struct Coordinator {
    config: CollectorConfig,
    identity: SessionIdentity,
    queue: DurableQueue,
    backoff: BackoffState,
    policy: BackoffPolicy,
    tracker: NavigationTracker,
    transport: Arc<dyn ReliableTransport>,
    unload_transport: Arc<dyn BestEffortTransport>,
    scheduler: Arc<dyn DurableScheduler>,
    stats: DeliveryStats,
}

impl Coordinator {
    /// Restore state from the store and spawn the event loop. `tick_rx` is
    /// the scheduler's fire channel. The returned token models unilateral
    /// host eviction: cancelling it kills the loop with no unload flush.
    pub async fn start(
        config: CollectorConfig,
        store: QueueStore,
        transport: Arc<dyn ReliableTransport>,
        unload_transport: Arc<dyn BestEffortTransport>,
        scheduler: Arc<dyn DurableScheduler>,
        tick_rx: mpsc::Receiver<()>,
    ) -> Result<(CollectorHandle, CancellationToken, JoinHandle<()>)> {
        let user_id = match &config.user_id {
            Some(user_id) => user_id.clone(),
            None => store.load_or_create_user_id().await?,
        };
        let identity = SessionIdentity::new(user_id);
        info!(
            "Coordinator starting: session {} for user {}",
            identity.session_id, identity.user_id
        );

        let queue = DurableQueue::restore(store, config.retention_cap).await?;
        let policy = config.backoff_policy();

        let coordinator = Self {
            identity,
            queue,
            backoff: BackoffState::new(),
            policy,
            tracker: NavigationTracker::new(),
            transport,
            unload_transport,
            scheduler,
            stats: DeliveryStats::new(),
            config,
        };

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel_token = CancellationToken::new();
        let loop_token = cancel_token.clone();
        let handle = tokio::spawn(coordinator.run(signal_rx, tick_rx, loop_token));

        Ok((CollectorHandle { signal_tx }, cancel_token, handle))
    }

    async fn run(
        mut self,
        mut signal_rx: mpsc::Receiver<HostSignal>,
        mut tick_rx: mpsc::Receiver<()>,
        cancel_token: CancellationToken,
    ) {
        let restored = self.queue.len();

        // Pick up a deadline armed by a previous incarnation; records left
        // over from it flush right away rather than waiting for the tick.
        let resumed = self.scheduler.resume().await;
        if let Some(remaining) = resumed {
            info!("Resumed flush deadline ({}s remaining)", remaining.as_secs());
        }

        if restored > 0 {
            info!("{restored} pending record(s) survived a restart; flushing immediately");
            self.flush().await;
        } else if resumed.is_none() {
            self.scheduler.arm(self.policy.base).await;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick

        let mut ticks_alive = true;
        loop {
            tokio::select! {
                signal = signal_rx.recv() => {
                    match signal {
                        Some(HostSignal::Submit(record)) => self.on_submit(record).await,
                        Some(HostSignal::NavigationCommitted { tab_id, url }) => {
                            self.on_navigation(tab_id, &url).await;
                        }
                        Some(HostSignal::TabClosed { tab_id }) => {
                            self.tracker.tab_closed(tab_id);
                        }
                        Some(HostSignal::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot().await);
                        }
                        Some(HostSignal::Teardown) => {
                            self.on_teardown().await;
                            break;
                        }
                        None => {
                            info!("All collector handles dropped; coordinator exiting");
                            break;
                        }
                    }
                }
                tick = tick_rx.recv(), if ticks_alive => {
                    match tick {
                        Some(()) => self.flush().await,
                        None => {
                            warn!("Scheduler tick channel closed");
                            ticks_alive = false;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                }
                _ = cancel_token.cancelled() => {
                    info!("Coordinator evicted");
                    break;
                }
            }
        }
    }

    async fn on_submit(&mut self, record: ObservationRecord) {
        self.stats.record_submitted().await;
        match sanitize(record) {
            Some(clean) => self.accept(clean).await,
            None => {
                self.stats.record_rejected().await;
                debug!("Dropped malformed submission");
            }
        }
    }

    async fn on_navigation(&mut self, tab_id: i64, url: &str) {
        if let Some(record) = self.tracker.navigation_committed(tab_id, url) {
            // Synthesized records take the same path as submissions.
            match sanitize(record) {
                Some(clean) => self.accept(clean).await,
                None => self.stats.record_rejected().await,
            }
        }
    }

    /// Enqueue a sanitized record; reaching the batch threshold flushes
    /// eagerly instead of waiting for the timer.
    async fn accept(&mut self, record: ObservationRecord) {
        let queued = self.queue.enqueue(record).await;
        if queued >= self.config.max_batch_size {
            self.flush().await;
        }
    }

    /// One flush attempt: at most one batch per invocation, then re-arm.
    async fn flush(&mut self) {
        let Some(batch) = self.queue.take_batch(self.config.max_batch_size) else {
            // Nothing queued: a no-op tick with no failure penalty.
            self.scheduler.arm(self.backoff.next_interval(&self.policy)).await;
            return;
        };

        let payload = BatchPayload::from_batch(&self.identity, &batch);
        let token = batch.token;
        let count = batch.len();
        let started = Instant::now();
        let outcome = self.transport.deliver(&payload).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            DeliveryOutcome::Accepted { accepted } => {
                debug!("Batch {token} delivered ({accepted} accepted) in {duration_ms}ms");
                self.queue.settle_delivered(&batch).await;
                self.backoff.record_success();
                self.stats.record_delivered(count as u64).await;
                self.record_attempt(token, count, duration_ms, true).await;
            }
            DeliveryOutcome::TransientFailure { reason } => {
                warn!(
                    "Batch {token} failed transiently ({reason}); requeued, {} consecutive failure(s)",
                    self.backoff.failures() + 1
                );
                self.queue.requeue_front(batch);
                self.backoff.record_failure();
                self.stats.record_transient_failure().await;
                self.record_attempt(token, count, duration_ms, false).await;
            }
            DeliveryOutcome::PermanentFailure { reason } => {
                if self.config.retry_rejected_batches {
                    warn!("Batch {token} rejected ({reason}); retrying per configuration");
                    self.queue.requeue_front(batch);
                    self.backoff.record_failure();
                    self.stats.record_transient_failure().await;
                } else {
                    error!("Batch {token} rejected by endpoint ({reason}); dropping {count} record(s)");
                    self.queue.settle_delivered(&batch).await;
                    // The endpoint is reachable; only this payload was refused.
                    self.backoff.record_success();
                    self.stats.record_dropped(count as u64).await;
                    self.stats.record_permanent_failure().await;
                }
                self.record_attempt(token, count, duration_ms, false).await;
            }
        }

        self.scheduler.arm(self.backoff.next_interval(&self.policy)).await;
    }

    /// Unload guard: final lifecycle record, then hand everything queued to
    /// the fire-and-forget path. No retries, no re-arming — teardown is not
    /// a retryable condition. Mirror rows stay for the next incarnation.
    async fn on_teardown(&mut self) {
        info!("Teardown signaled; best-effort final flush");
        self.queue.enqueue(lifecycle_record("session_end")).await;

        for batch in self.queue.drain_for_unload(self.config.max_batch_size) {
            let payload = BatchPayload::from_batch(&self.identity, &batch);
            self.unload_transport.deliver_detached(payload);
        }

        self.scheduler.cancel().await;
    }

    async fn on_heartbeat(&mut self) {
        self.accept(lifecycle_record("heartbeat")).await;

        let snapshot = self.stats.get_snapshot().await;
        debug!(
            "Pipeline: {} queued, {} delivered, {} dropped, {} transient failure(s), cpu {:.1}%, mem {:.1}MB",
            self.queue.len(),
            snapshot.delivered,
            snapshot.dropped,
            snapshot.transient_failures,
            snapshot.system.cpu_percent,
            snapshot.system.memory_mb,
        );
    }

    async fn record_attempt(&self, batch_token: u64, count: usize, duration_ms: u64, delivered: bool) {
        self.stats
            .record_attempt(AttemptMetrics {
                timestamp: Utc::now(),
                batch_token,
                record_count: count,
                duration_ms,
                delivered,
            })
            .await;
    }

    async fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            session_id: self.identity.session_id.clone(),
            queued: self.queue.len(),
            consecutive_failures: self.backoff.failures(),
            stats: self.stats.get_snapshot().await,
        }
    }
}

fn lifecycle_record(marker: &str) -> ObservationRecord {
    let mut attributes = AttrMap::new();
    attributes.insert("marker".into(), AttrValue::from(marker));
    ObservationRecord::new(RecordKind::Lifecycle, attributes, AGENT_CONTEXT)
}
