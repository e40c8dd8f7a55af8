//! Periodic flush of pending tallies into poll storage.
//!
//! Each tick captures and zeroes the pending deltas under the tally lock,
//! releases it, then writes every captured delta. A failed write is merged
//! back into the live delta and retried on a later tick. Errors never stop
//! the loop.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::poll::PollStore;
use crate::tally::TallyMap;

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The tally had no entries; storage was not contacted
    Skipped,

    Flushed {
        /// Deltas durably applied
        written: usize,
        /// Deltas merged back for retry
        failed: usize,
    },
}

/// Counters accumulated over the tick loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub ticks: u64,
    pub skipped: u64,
    pub written: u64,
    pub failed_writes: u64,
}

impl FlushStats {
    pub fn record(&mut self, outcome: FlushOutcome) {
        self.ticks += 1;
        match outcome {
            FlushOutcome::Skipped => self.skipped += 1,
            FlushOutcome::Flushed { written, failed } => {
                self.written += written as u64;
                self.failed_writes += failed as u64;
            }
        }
    }
}

/// Moves pending deltas from a [`TallyMap`] into a [`PollStore`].
#[derive(Clone)]
pub struct Flusher {
    tally: TallyMap,
    store: Arc<dyn PollStore>,
}

impl Flusher {
    pub fn new(tally: TallyMap, store: Arc<dyn PollStore>) -> Self {
        Self { tally, store }
    }

    /// Run one flush.
    pub async fn tick(&self) -> FlushOutcome {
        let Some(captured) = self.tally.capture().await else {
            debug!("Tally empty, flush skipped");
            return FlushOutcome::Skipped;
        };

        if captured.is_empty() {
            debug!("No pending votes");
            return FlushOutcome::Flushed {
                written: 0,
                failed: 0,
            };
        }

        let writes = captured.into_iter().map(|(option, delta)| async move {
            let result = self.store.increment_result(&option, delta).await;
            (option, delta, result)
        });

        let mut written = 0;
        let mut failed = 0;
        for (option, delta, result) in join_all(writes).await {
            match result {
                Ok(0) => {
                    warn!(option = %option, delta, "Vote for option not in any poll");
                    written += 1;
                }
                Ok(polls) => {
                    debug!(option = %option, delta, polls, "Delta written");
                    written += 1;
                }
                Err(e) => {
                    warn!(option = %option, delta, error = %e, "Delta write failed, kept pending");
                    self.tally.merge_back(&option, delta).await;
                    failed += 1;
                }
            }
        }

        if failed == 0 {
            info!(written, "Flushed votes");
        } else {
            warn!(written, failed, "Partial flush failure");
        }

        FlushOutcome::Flushed { written, failed }
    }

    /// Non-zero deltas not yet written.
    pub async fn pending_deltas(&self) -> Vec<(String, u64)> {
        let mut pending: Vec<_> = self
            .tally
            .snapshot()
            .await
            .into_iter()
            .filter(|(_, delta)| *delta > 0)
            .collect();
        pending.sort();
        pending
    }

    /// Tick every `period` until `stop` fires. The tick in progress when
    /// `stop` fires runs to completion.
    pub async fn run(&self, period: Duration, stop: CancellationToken) -> FlushStats {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = FlushStats::default();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    stats.record(outcome);
                }
            }
        }

        debug!(ticks = stats.ticks, "Tick loop stopped");
        stats
    }
}
