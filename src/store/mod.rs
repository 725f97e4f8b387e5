//! Durable local storage for the coordinating process.
//!
//! One SQLite file holds the mirror of the pending-record queue plus the
//! small identity table (persisted user id, armed flush deadline). All
//! access goes through a dedicated worker thread that owns the connection;
//! callers submit closures and await the reply, so the async side never
//! blocks on disk.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

mod migrations;

use migrations::run_migrations;

use crate::model::{generate_user_id, AttrMap, ObservationRecord, QueueEntry, RecordKind};

/// Identity-table key for the persisted pseudonymous user id.
pub const IDENTITY_USER_ID: &str = "user_id";

/// Identity-table key for the armed flush deadline (RFC 3339).
pub const IDENTITY_FLUSH_DEADLINE: &str = "flush_deadline";

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn kind_from_str(value: &str) -> Result<RecordKind> {
    match value {
        "navigation" => Ok(RecordKind::Navigation),
        "interaction" => Ok(RecordKind::Interaction),
        "cadence" => Ok(RecordKind::Cadence),
        "lifecycle" => Ok(RecordKind::Lifecycle),
        _ => Err(anyhow!("unknown record kind '{value}'")),
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

#[derive(Clone)]
pub struct QueueStore {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
}

impl QueueStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("beacon-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite store")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run store migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("Store initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }

    /// Mirror one queue entry. The seq from the in-memory queue is the row
    /// key, so restore preserves enqueue order.
    pub async fn append_pending(&self, entry: &QueueEntry) -> Result<()> {
        let seq = to_i64(entry.seq)?;
        let record = entry.record.clone();
        self.execute(move |conn| {
            let attributes_json = serde_json::to_string(&record.attributes)
                .context("failed to serialize record attributes")?;
            conn.execute(
                "INSERT OR REPLACE INTO pending_records (seq, kind, attributes_json, context, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    seq,
                    record.kind.as_str(),
                    attributes_json,
                    record.context,
                    record.captured_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to mirror pending record")?;
            Ok(())
        })
        .await
    }

    /// Remove acknowledged entries. Batches are always taken from the queue
    /// head, so the seqs form a contiguous range.
    pub async fn delete_pending_range(&self, min_seq: u64, max_seq: u64) -> Result<()> {
        let min_seq = to_i64(min_seq)?;
        let max_seq = to_i64(max_seq)?;
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM pending_records WHERE seq >= ?1 AND seq <= ?2",
                params![min_seq, max_seq],
            )
            .with_context(|| "failed to delete acknowledged records")?;
            Ok(())
        })
        .await
    }

    /// Drop everything but the newest `cap` mirrored entries. Returns the
    /// number of rows discarded.
    pub async fn prune_pending(&self, cap: usize) -> Result<usize> {
        let cap = cap as i64;
        self.execute(move |conn| {
            let dropped = conn
                .execute(
                    "DELETE FROM pending_records
                     WHERE seq NOT IN (
                         SELECT seq FROM pending_records ORDER BY seq DESC LIMIT ?1
                     )",
                    params![cap],
                )
                .with_context(|| "failed to prune pending records")?;
            Ok(dropped)
        })
        .await
    }

    /// Load the newest `cap` mirrored entries in enqueue order. Called once
    /// at startup before any other queue operation.
    pub async fn load_pending(&self, cap: usize) -> Result<Vec<QueueEntry>> {
        let cap = cap as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, kind, attributes_json, context, captured_at
                 FROM pending_records
                 ORDER BY seq DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![cap])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let seq: i64 = row.get(0)?;
                let kind = kind_from_str(&row.get::<_, String>(1)?)?;
                let attributes: AttrMap = serde_json::from_str(&row.get::<_, String>(2)?)
                    .context("failed to parse mirrored attributes")?;
                let context: String = row.get(3)?;
                let captured_at = parse_datetime(&row.get::<_, String>(4)?)?;

                entries.push(QueueEntry {
                    seq: seq as u64,
                    record: ObservationRecord {
                        kind,
                        attributes,
                        context,
                        captured_at,
                    },
                });
            }

            entries.reverse();
            Ok(entries)
        })
        .await
    }

    pub async fn get_identity(&self, key: &'static str) -> Result<Option<String>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM identity WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn set_identity(&self, key: &'static str, value: String) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO identity (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .with_context(|| format!("failed to persist identity key {key}"))?;
            Ok(())
        })
        .await
    }

    pub async fn clear_identity(&self, key: &'static str) -> Result<()> {
        self.execute(move |conn| {
            conn.execute("DELETE FROM identity WHERE key = ?1", params![key])
                .with_context(|| format!("failed to clear identity key {key}"))?;
            Ok(())
        })
        .await
    }

    /// Return the persisted pseudonymous user id, generating and persisting
    /// one on first run so it stays stable across restarts.
    pub async fn load_or_create_user_id(&self) -> Result<String> {
        if let Some(existing) = self.get_identity(IDENTITY_USER_ID).await? {
            return Ok(existing);
        }

        let fresh = generate_user_id();
        self.set_identity(IDENTITY_USER_ID, fresh.clone()).await?;
        info!("Generated pseudonymous user id {fresh}");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrValue;

    fn temp_store() -> QueueStore {
        let path = std::env::temp_dir()
            .join(format!("beacon-store-test-{}.sqlite3", uuid::Uuid::new_v4()));
        QueueStore::new(path).expect("store should initialize")
    }

    fn entry(seq: u64) -> QueueEntry {
        let mut attributes = AttrMap::new();
        attributes.insert("tag".into(), AttrValue::from("a"));
        QueueEntry {
            seq,
            record: ObservationRecord {
                kind: RecordKind::Interaction,
                attributes,
                context: "/inbox".into(),
                captured_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn mirrored_entries_survive_round_trip() {
        let store = temp_store();
        for seq in 1..=3 {
            store.append_pending(&entry(seq)).await.unwrap();
        }

        let loaded = store.load_pending(200).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].seq, 1);
        assert_eq!(loaded[2].seq, 3);
        assert_eq!(loaded[0].record.context, "/inbox");
    }

    #[tokio::test]
    async fn delete_range_removes_acknowledged_rows() {
        let store = temp_store();
        for seq in 1..=5 {
            store.append_pending(&entry(seq)).await.unwrap();
        }

        store.delete_pending_range(1, 3).await.unwrap();
        let loaded = store.load_pending(200).await.unwrap();
        assert_eq!(loaded.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn prune_keeps_newest_entries() {
        let store = temp_store();
        for seq in 1..=10 {
            store.append_pending(&entry(seq)).await.unwrap();
        }

        let dropped = store.prune_pending(4).await.unwrap();
        assert_eq!(dropped, 6);

        let loaded = store.load_pending(200).await.unwrap();
        assert_eq!(
            loaded.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![7, 8, 9, 10]
        );
    }

    #[tokio::test]
    async fn user_id_is_stable_across_instances() {
        let store = temp_store();
        let first = store.load_or_create_user_id().await.unwrap();
        let second = store.load_or_create_user_id().await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("user-"));
    }
}
