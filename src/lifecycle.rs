//! Process lifecycles of the producer and the counter.
//!
//! Both processes follow the same rule on shutdown: stop the source first,
//! wait until it confirms it has exited, and only then stop what consumes it.
//!
//! ```text
//! producer: signal -> reader drains session -> hand-off closes -> publisher stops bus client
//! counter:  signal -> subscriber stops reading -> in-flight handlers acked -> tick loop stops -> final flush
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::bus::{BusError, MessageHandler, VoteSubscriber};
use crate::config::ConfigError;
use crate::flusher::{FlushStats, Flusher};
use crate::poll::StorageError;
use crate::publisher::VotePublisher;
use crate::stream::{StreamError, StreamReader};

/// Failures acquiring resources at startup. These are the only errors that
/// end a process.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("poll storage: {0}")]
    Storage(#[from] StorageError),

    #[error("message bus: {0}")]
    Bus(#[from] BusError),

    #[error("live stream: {0}")]
    Stream(#[from] StreamError),
}

/// Install the global `tracing` subscriber, honouring `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Summary of a producer run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerReport {
    pub cycles: u64,
    pub sessions: u64,
    /// Votes handed to the publisher
    pub votes: u64,
    pub published: u64,
    pub dropped: u64,
}

/// Summary of a counter run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterReport {
    pub delivered: u64,
    pub acked: u64,
    pub recovered: u64,
    pub ticks: u64,
    /// Deltas durably written
    pub flushed: u64,
    pub failed_writes: u64,
    /// Votes still unwritten after the final flush
    pub stranded: u64,
}

/// Run the stream reader and the publisher until `cancel` fires and both
/// have wound down.
///
/// The reader owns the only sender of the hand-off, so the publisher sees the
/// hand-off close only after the reader's last session has exited.
pub async fn run_producer(
    reader: StreamReader,
    publisher: VotePublisher,
    cancel: CancellationToken,
    handoff_capacity: usize,
) -> ProducerReport {
    let (votes_tx, votes_rx) = mpsc::channel(handoff_capacity.max(1));

    info!(topic = %publisher.topic(), "Starting producer");
    let reader_task = tokio::spawn(reader.run(cancel, votes_tx));
    let published = publisher.run(votes_rx).await;

    let read = match reader_task.await {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "Stream reader task failed");
            Default::default()
        }
    };

    let report = ProducerReport {
        cycles: read.cycles,
        sessions: read.sessions,
        votes: read.votes,
        published: published.published,
        dropped: published.dropped,
    };
    info!(?report, "Producer stopped");
    report
}

/// Deliver bus messages to `handler` and flush `flusher` every `period`
/// until `cancel` fires.
///
/// The tick loop keeps running while the subscriber drains; it is stopped
/// only once the subscriber returns, followed by one final tick.
pub async fn run_counter(
    subscriber: Arc<dyn VoteSubscriber>,
    handler: Arc<dyn MessageHandler>,
    flusher: Flusher,
    period: Duration,
    cancel: CancellationToken,
) -> Result<CounterReport, BusError> {
    let ticks_stop = CancellationToken::new();
    let ticks = tokio::spawn({
        let flusher = flusher.clone();
        let stop = ticks_stop.clone();
        async move { flusher.run(period, stop).await }
    });

    info!(period_ms = period.as_millis() as u64, "Starting counter");
    let delivery = subscriber.run(handler, cancel).await;
    info!("Bus drained, stopping tick loop");

    ticks_stop.cancel();
    let mut flushed = match ticks.await {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "Tick loop task failed");
            FlushStats::default()
        }
    };

    info!("Running final flush");
    flushed.record(flusher.tick().await);

    // acknowledged on the bus already, nothing will write these
    let mut stranded = 0;
    for (option, delta) in flusher.pending_deltas().await {
        error!(option = %option, delta, "Votes not persisted at shutdown");
        stranded += delta;
    }

    let delivery = delivery?;
    let report = CounterReport {
        delivered: delivery.delivered,
        acked: delivery.acked,
        recovered: delivery.recovered,
        ticks: flushed.ticks,
        flushed: flushed.written,
        failed_writes: flushed.failed_writes,
        stranded,
    };
    info!(?report, "Counter stopped");
    Ok(report)
}
