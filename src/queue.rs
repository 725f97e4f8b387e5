//! Durable pending-record queue.
//!
//! In-memory FIFO of sanitized records, mirrored row-by-row into the SQLite
//! store so a torn-down process can rebuild it on respawn. The mirror is
//! best-effort (storage failures are logged, never propagated) and capped:
//! once the retention cap is reached the oldest entry is dropped, which is
//! the documented data-loss boundary when the endpoint stays unreachable.
//!
//! Mirror rows for a batch are deleted only after the transmitter reports a
//! successful acknowledgment. A crash while a batch is in flight therefore
//! resends on the next incarnation instead of losing records.

use std::collections::VecDeque;

use crate::model::{Batch, ObservationRecord, QueueEntry};
use crate::store::QueueStore;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub struct DurableQueue {
    entries: VecDeque<QueueEntry>,
    store: QueueStore,
    retention_cap: usize,
    next_seq: u64,
    next_batch_token: u64,
}

impl DurableQueue {
    /// Rebuild the queue from the durable mirror. Runs once at process
    /// start, before any other queue operation.
    pub async fn restore(store: QueueStore, retention_cap: usize) -> anyhow::Result<Self> {
        let restored = store.load_pending(retention_cap).await?;
        if let Err(err) = store.prune_pending(retention_cap).await {
            log_error!("failed to prune mirror on restore: {err:?}");
        }

        let next_seq = restored.last().map(|entry| entry.seq + 1).unwrap_or(1);
        if !restored.is_empty() {
            log_info!(
                "Restored {} pending record(s) from mirror (next seq {})",
                restored.len(),
                next_seq
            );
        }

        Ok(Self {
            entries: VecDeque::from(restored),
            store,
            retention_cap,
            next_seq,
            next_batch_token: 1,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a record at the tail and mirror it. Returns the queue length
    /// after the append. A full queue drops its oldest entry first.
    pub async fn enqueue(&mut self, record: ObservationRecord) -> usize {
        if self.entries.len() >= self.retention_cap {
            if let Some(dropped) = self.entries.pop_front() {
                log_warn!(
                    "queue at retention cap ({}); dropping oldest record seq {}",
                    self.retention_cap,
                    dropped.seq
                );
                if let Err(err) = self
                    .store
                    .delete_pending_range(dropped.seq, dropped.seq)
                    .await
                {
                    log_error!("failed to drop mirrored record seq {}: {err:?}", dropped.seq);
                }
            }
        }

        let entry = QueueEntry {
            seq: self.next_seq,
            record,
        };
        self.next_seq += 1;

        if let Err(err) = self.store.append_pending(&entry).await {
            // Durability degrades to best-effort; in-memory delivery still runs.
            log_error!("failed to mirror record seq {}: {err:?}", entry.seq);
        }

        self.entries.push_back(entry);
        self.entries.len()
    }

    /// Atomically remove up to `max_size` entries from the head, paired with
    /// a monotonically-assigned batch token. Mirror rows stay in place until
    /// the batch settles.
    pub fn take_batch(&mut self, max_size: usize) -> Option<Batch> {
        if self.entries.is_empty() || max_size == 0 {
            return None;
        }

        let count = max_size.min(self.entries.len());
        let entries: Vec<QueueEntry> = self.entries.drain(..count).collect();
        let token = self.next_batch_token;
        self.next_batch_token += 1;

        Some(Batch { token, entries })
    }

    /// The batch was acknowledged: drop its mirror rows. Batches come off
    /// the queue head, so their seqs form a contiguous range.
    pub async fn settle_delivered(&mut self, batch: &Batch) {
        let (Some(first), Some(last)) = (batch.entries.first(), batch.entries.last()) else {
            return;
        };

        if let Err(err) = self
            .store
            .delete_pending_range(first.seq, last.seq)
            .await
        {
            log_error!(
                "failed to clear mirror for batch {} (seq {}..={}): {err:?}",
                batch.token,
                first.seq,
                last.seq
            );
        }
    }

    /// The batch failed transiently: return its entries to the queue head so
    /// retries stay ahead of newer records. Mirror rows were never removed.
    pub fn requeue_front(&mut self, batch: Batch) {
        for entry in batch.entries.into_iter().rev() {
            self.entries.push_front(entry);
        }

        // Requeueing can exceed the cap when fresh records arrived while the
        // batch was in flight; the overflow resolves on the next enqueue.
    }

    /// Drain everything queued into cap-sized batches for the unload path.
    /// Mirror rows are left intact: no outcome will be observed, so the
    /// durable mirror stays authoritative for the next incarnation.
    pub fn drain_for_unload(&mut self, chunk_size: usize) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Some(batch) = self.take_batch(chunk_size) {
            batches.push(batch);
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrMap, RecordKind};
    use crate::store::QueueStore;
    use chrono::Utc;

    fn temp_store() -> QueueStore {
        let path = std::env::temp_dir()
            .join(format!("beacon-queue-test-{}.sqlite3", uuid::Uuid::new_v4()));
        QueueStore::new(path).expect("store should initialize")
    }

    fn record(context: &str) -> ObservationRecord {
        ObservationRecord {
            kind: RecordKind::Interaction,
            attributes: AttrMap::new(),
            context: context.into(),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batch_never_exceeds_max_size() {
        let store = temp_store();
        let mut queue = DurableQueue::restore(store, 200).await.unwrap();
        for i in 0..7 {
            queue.enqueue(record(&format!("/page/{i}"))).await;
        }

        let batch = queue.take_batch(5).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(queue.len(), 2);

        let rest = queue.take_batch(5).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(queue.take_batch(5).is_none());
    }

    #[tokio::test]
    async fn batch_tokens_are_monotonic() {
        let store = temp_store();
        let mut queue = DurableQueue::restore(store, 200).await.unwrap();
        queue.enqueue(record("/a")).await;
        queue.enqueue(record("/b")).await;

        let first = queue.take_batch(1).unwrap();
        let second = queue.take_batch(1).unwrap();
        assert!(second.token > first.token);
    }

    #[tokio::test]
    async fn requeued_batch_goes_ahead_of_newer_records() {
        let store = temp_store();
        let mut queue = DurableQueue::restore(store, 200).await.unwrap();
        queue.enqueue(record("/old-1")).await;
        queue.enqueue(record("/old-2")).await;

        let batch = queue.take_batch(2).unwrap();
        queue.enqueue(record("/new")).await;
        queue.requeue_front(batch);

        let next = queue.take_batch(3).unwrap();
        let contexts: Vec<&str> = next
            .entries
            .iter()
            .map(|e| e.record.context.as_str())
            .collect();
        assert_eq!(contexts, vec!["/old-1", "/old-2", "/new"]);
    }

    #[tokio::test]
    async fn restore_recovers_unacknowledged_records() {
        let path = std::env::temp_dir()
            .join(format!("beacon-queue-test-{}.sqlite3", uuid::Uuid::new_v4()));
        {
            let store = QueueStore::new(path.clone()).unwrap();
            let mut queue = DurableQueue::restore(store, 200).await.unwrap();
            queue.enqueue(record("/before-crash")).await;
            // Take a batch but never settle it: the process "dies" here with
            // the batch in flight.
            let _in_flight = queue.take_batch(10).unwrap();
        }

        let store = QueueStore::new(path).unwrap();
        let mut queue = DurableQueue::restore(store, 200).await.unwrap();
        assert_eq!(queue.len(), 1);
        let batch = queue.take_batch(10).unwrap();
        assert_eq!(batch.entries[0].record.context, "/before-crash");
    }

    #[tokio::test]
    async fn acknowledged_batch_leaves_no_mirror_rows() {
        let path = std::env::temp_dir()
            .join(format!("beacon-queue-test-{}.sqlite3", uuid::Uuid::new_v4()));
        {
            let store = QueueStore::new(path.clone()).unwrap();
            let mut queue = DurableQueue::restore(store, 200).await.unwrap();
            queue.enqueue(record("/delivered")).await;
            let batch = queue.take_batch(10).unwrap();
            queue.settle_delivered(&batch).await;
        }

        let store = QueueStore::new(path).unwrap();
        let queue = DurableQueue::restore(store, 200).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn oldest_entry_drops_at_retention_cap() {
        let store = temp_store();
        let mut queue = DurableQueue::restore(store, 3).await.unwrap();
        for i in 0..5 {
            queue.enqueue(record(&format!("/page/{i}"))).await;
        }

        assert_eq!(queue.len(), 3);
        let batch = queue.take_batch(10).unwrap();
        let contexts: Vec<&str> = batch
            .entries
            .iter()
            .map(|e| e.record.context.as_str())
            .collect();
        assert_eq!(contexts, vec!["/page/2", "/page/3", "/page/4"]);
    }
}
