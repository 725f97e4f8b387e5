pub mod config;
pub mod coordinator;
pub mod correlate;
pub mod flush;
pub mod model;
pub mod queue;
pub mod sanitize;
pub mod stats;
pub mod store;
pub mod transmit;
mod utils;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

pub use config::CollectorConfig;
pub use coordinator::{CollectorHandle, Coordinator, HostSignal, PipelineSnapshot};
pub use model::{AttrMap, AttrValue, ObservationRecord, RecordKind};

use flush::{DurableScheduler, TokioScheduler};
use store::QueueStore;
use transmit::{BestEffortTransport, HttpTransport, ReliableTransport};

/// Wire up the full pipeline against the real HTTP transport and run until
/// the process receives SIGINT, which is forwarded as the teardown signal.
pub async fn run(config: CollectorConfig) -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("beacon starting up...");

    let store = QueueStore::new(config.store_path())?;

    let transport = Arc::new(HttpTransport::new(&config.endpoint, config.api_key.clone())?);
    let reliable: Arc<dyn ReliableTransport> = transport.clone();
    let best_effort: Arc<dyn BestEffortTransport> = transport;

    let (tick_tx, tick_rx) = mpsc::channel(8);
    let scheduler: Arc<dyn DurableScheduler> =
        Arc::new(TokioScheduler::new(store.clone(), tick_tx));

    let (handle, _cancel_token, join) =
        Coordinator::start(config, store, reliable, best_effort, scheduler, tick_rx).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    log::info!("Shutdown requested; signaling teardown");
    handle.teardown();

    join.await.context("coordinator task failed to join")?;
    Ok(())
}
