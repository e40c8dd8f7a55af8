//! Forwards vote events from the hand-off onto the message bus.
//!
//! Publishing is best-effort: a vote the bus refuses is logged and dropped,
//! never retried. The loop ends when the hand-off closes, then stops the bus
//! client.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::VoteSink;
use crate::vote::VoteEvent;

/// Counters of one publisher run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub dropped: u64,
}

pub struct VotePublisher {
    sink: Arc<dyn VoteSink>,
    topic: String,
}

impl VotePublisher {
    pub fn new(sink: Arc<dyn VoteSink>, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish every vote received until all senders are gone.
    pub async fn run(self, mut votes: mpsc::Receiver<VoteEvent>) -> PublishStats {
        let mut stats = PublishStats::default();

        while let Some(vote) = votes.recv().await {
            match self.sink.publish(&self.topic, &vote).await {
                Ok(()) => {
                    debug!(option = %vote.option, topic = %self.topic, "Vote published");
                    stats.published += 1;
                }
                Err(e) => {
                    warn!(option = %vote.option, error = %e, "Dropping vote, publish failed");
                    stats.dropped += 1;
                }
            }
        }

        info!("Vote hand-off closed, stopping bus client");
        self.sink.stop().await;
        info!(
            published = stats.published,
            dropped = stats.dropped,
            "Bus client stopped"
        );
        stats
    }
}
