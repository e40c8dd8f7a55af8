//! Votestream counter - message bus to poll storage.
//!
//! Reads vote events through a consumer group, tallies them in memory and
//! flushes the per-option deltas into poll storage on a fixed period.
//!
//! ## Configuration
//!
//! - `VOTESTREAM_CONFIG`: path of the TOML config (default: `config/votestream.toml`)
//! - `RUST_LOG`: logging level (default: "info")

use std::error::Error;
use std::sync::Arc;
use tracing::{error, info};

use votestream::bus::{self, GroupConsumer, RedisStreamSubscriber};
use votestream::lifecycle::{init_tracing, run_counter, StartupError};
use votestream::poll::RedisPollStore;
use votestream::shutdown::ShutdownSignal;
use votestream::{Flusher, TallyMap, VoteCounter, VotesConfig};

async fn start() -> Result<(), StartupError> {
    let config = VotesConfig::load()?;

    let store = RedisPollStore::connect(&config.storage.url, &config.storage.key_prefix).await?;
    info!(url = %config.storage.url, "Connected to poll storage");

    let bus_pool = bus::connect_pool(&config.bus.url).await?;
    let subscriber = RedisStreamSubscriber::new(bus_pool, &config.bus);
    subscriber.subscribe().await?;
    info!(
        topic = %config.bus.topic,
        consumer_group = %config.bus.consumer_group,
        consumer = %subscriber.consumer(),
        "Subscribed to message bus"
    );

    let shutdown = ShutdownSignal::new();
    let listener = shutdown.clone();
    tokio::spawn(async move { listener.wait().await });

    let tally = TallyMap::new();
    let report = run_counter(
        Arc::new(GroupConsumer::new(
            Arc::new(subscriber),
            config.bus.max_in_flight,
        )),
        Arc::new(VoteCounter::new(tally.clone())),
        Flusher::new(tally, Arc::new(store)),
        config.counter.flush_interval(),
        shutdown.token(),
    )
    .await?;

    info!(
        delivered = report.delivered,
        acked = report.acked,
        flushed = report.flushed,
        failed_writes = report.failed_writes,
        stranded = report.stranded,
        "Votestream counter shutdown complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Votestream counter starting");

    if let Err(e) = start().await {
        error!(error = %e, "Counter failed");
        return Err(e.into());
    }
    Ok(())
}
