//! Votestream producer - live stream to message bus.
//!
//! Tracks every option of every poll on the filtered live stream and
//! publishes one vote event per match onto the bus.
//!
//! ## Configuration
//!
//! - `VOTESTREAM_CONFIG`: path of the TOML config (default: `config/votestream.toml`)
//! - `VOTESTREAM_BEARER_TOKEN`: stream credentials, when not set in the config
//! - `RUST_LOG`: logging level (default: "info")

use std::error::Error;
use std::sync::Arc;
use tracing::{error, info};

use votestream::bus::{self, RedisStreamPublisher};
use votestream::lifecycle::{init_tracing, run_producer, StartupError};
use votestream::poll::RedisPollStore;
use votestream::shutdown::ShutdownSignal;
use votestream::stream::{HttpTransport, ReaderSettings, StreamCredentials, StreamReader};
use votestream::{VotePublisher, VotesConfig};

async fn start() -> Result<(), StartupError> {
    let config = VotesConfig::load()?;

    let credentials = StreamCredentials::from_config(&config.stream)?;
    let transport = HttpTransport::new(&config.stream, credentials)?;

    let store = RedisPollStore::connect(&config.storage.url, &config.storage.key_prefix).await?;
    info!(url = %config.storage.url, "Connected to poll storage");

    let bus_pool = bus::connect_pool(&config.bus.url).await?;
    info!(url = %config.bus.url, topic = %config.bus.topic, "Connected to message bus");

    let shutdown = ShutdownSignal::new();
    let listener = shutdown.clone();
    tokio::spawn(async move { listener.wait().await });

    let reader = StreamReader::new(
        Arc::new(store),
        Arc::new(transport),
        ReaderSettings::from(&config.stream),
    );
    let publisher = VotePublisher::new(
        Arc::new(RedisStreamPublisher::new(bus_pool, config.bus.max_len)),
        config.bus.topic.clone(),
    );

    let report = run_producer(
        reader,
        publisher,
        shutdown.token(),
        config.stream.handoff_capacity,
    )
    .await;

    info!(
        sessions = report.sessions,
        votes = report.votes,
        published = report.published,
        dropped = report.dropped,
        "Votestream producer shutdown complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Votestream producer starting");

    if let Err(e) = start().await {
        error!(error = %e, "Startup failed");
        return Err(e.into());
    }
    Ok(())
}
