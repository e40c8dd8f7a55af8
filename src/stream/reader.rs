//! Stream Reader - resilient, time-bounded sessions against the live stream.
//!
//! # State Machine
//!
//! ```text
//!            options loaded        handshake ok
//!   Idle ─────────────────▶ Connecting ─────────▶ Streaming
//!    ▲ │                        │                    │ cancel / decode failure /
//!    │ │ cancelled at           │ connect failure,   │ session timeout
//!    │ │ cycle start            │ bad status         ▼
//!    │ ▼                        │               Draining
//!  Closed                       │                    │ decode loop confirmed exited
//!    ▲                          ▼                    ▼
//!    └───────────────────────  Idle ◀────────────────┘
//! ```
//!
//! Every cycle reloads the option list, so a session never outlives
//! `session_timeout` and option changes are picked up on the next cycle.
//! Cycles are separated by `retry_delay`.
//!
//! The decode loop runs as its own task. The reader only leaves `Draining`
//! after joining it, which guarantees no send into the vote hand-off is in
//! flight when the reader finally drops its sender and closes the hand-off.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::decode::{DecodeError, RecordDecoder};
use super::matcher::OptionSet;
use super::transport::{StreamConnection, StreamTransport};
use super::StreamError;
use crate::config::StreamConfig;
use crate::poll::PollStore;
use crate::vote::VoteEvent;

/// Lifecycle state of the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Connecting,
    Streaming,
    Draining,
    Closed,
}

/// Timing knobs for the reader.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub session_timeout: Duration,
    pub retry_delay: Duration,
    pub max_record_bytes: usize,
}

impl From<&StreamConfig> for ReaderSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            session_timeout: config.session_timeout(),
            retry_delay: config.retry_delay(),
            max_record_bytes: config.max_record_bytes,
        }
    }
}

/// Why a streaming session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The reader was cancelled
    Cancelled,

    /// The session reached its hard deadline
    TimedOut,

    /// A record could not be decoded, or the stream ended
    Decode(DecodeError),

    /// The vote hand-off has no receiver anymore
    HandoffClosed,

    /// The decode loop task panicked
    Aborted(String),
}

/// What the decode loop reports when it exits.
#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub records: u64,
    pub votes: u64,
}

/// Result of one full cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The option list could not be loaded; nothing was contacted
    LoadFailed(StreamError),

    /// No option is configured; nothing was contacted
    NoOptions,

    /// Cancelled before a session started
    Cancelled,

    /// The connection was not established or was refused
    ConnectFailed(StreamError),

    /// A session ran and ended
    Session(SessionReport),
}

/// Counters accumulated over the reader's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub cycles: u64,
    pub sessions: u64,
    pub failed_cycles: u64,
    pub votes: u64,
}

impl ReaderStats {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Session(report) => {
                self.sessions += 1;
                self.votes += report.votes;
            }
            CycleOutcome::LoadFailed(_) | CycleOutcome::ConnectFailed(_) => {
                self.failed_cycles += 1
            }
            CycleOutcome::NoOptions | CycleOutcome::Cancelled => {}
        }
    }
}

/// Owns one connection at a time to the filtered stream and turns matching
/// posts into [`VoteEvent`]s.
pub struct StreamReader {
    store: Arc<dyn PollStore>,
    transport: Arc<dyn StreamTransport>,
    settings: ReaderSettings,
    state: watch::Sender<ReaderState>,
}

impl StreamReader {
    pub fn new(
        store: Arc<dyn PollStore>,
        transport: Arc<dyn StreamTransport>,
        settings: ReaderSettings,
    ) -> Self {
        let (state, _) = watch::channel(ReaderState::Idle);
        Self {
            store,
            transport,
            settings,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ReaderState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ReaderState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "Reader state transition");
    }

    /// Load the current option list from poll storage.
    pub async fn refresh_options(&self) -> Result<OptionSet, StreamError> {
        let polls = self.store.list_polls().await?;
        Ok(OptionSet::from_polls(&polls))
    }

    /// Open one connection tracking `options`.
    pub async fn open_stream(
        &self,
        options: &OptionSet,
        timeout: Duration,
    ) -> Result<StreamConnection, StreamError> {
        self.transport.open(options, timeout).await
    }

    /// Run cycles until `cancel` fires, emitting votes into `votes`.
    ///
    /// Consumes the sender: the hand-off closes when this returns, which is
    /// only after the last session's decode loop has exited.
    pub async fn run(self, cancel: CancellationToken, votes: mpsc::Sender<VoteEvent>) -> ReaderStats {
        let mut stats = ReaderStats::default();

        loop {
            if cancel.is_cancelled() {
                self.transition(ReaderState::Closed);
                break;
            }

            info!("Querying live stream...");
            let outcome = self.run_cycle(&cancel, &votes).await;
            log_outcome(&outcome);
            stats.record(&outcome);

            debug!(
                delay_secs = self.settings.retry_delay.as_secs(),
                "Waiting before next cycle"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(ReaderState::Closed);
                    break;
                }
                _ = sleep(self.settings.retry_delay) => {}
            }
        }

        drop(votes);
        info!(
            cycles = stats.cycles,
            sessions = stats.sessions,
            votes = stats.votes,
            "Stopped querying live stream"
        );
        stats
    }

    /// One refresh → connect → stream → drain pass. Always ends in `Idle`.
    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        votes: &mpsc::Sender<VoteEvent>,
    ) -> CycleOutcome {
        let options = match self.refresh_options().await {
            Ok(options) => options,
            Err(e) => return CycleOutcome::LoadFailed(e),
        };
        if options.is_empty() {
            return CycleOutcome::NoOptions;
        }

        let timeout = self.settings.session_timeout;
        let deadline = Instant::now() + timeout;

        self.transition(ReaderState::Connecting);
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.transition(ReaderState::Idle);
                return CycleOutcome::Cancelled;
            }
            _ = sleep_until(deadline) => Err(StreamError::Connect(format!(
                "no response within {}s",
                timeout.as_secs()
            ))),
            result = self.open_stream(&options, timeout) => result,
        };

        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                self.transition(ReaderState::Idle);
                return CycleOutcome::ConnectFailed(e);
            }
        };

        info!(status = connection.status, options = options.len(), "Stream responded");
        if !connection.is_success() {
            let status = connection.status;
            let error = if connection.is_auth_failure() {
                StreamError::Auth(format!("status {}", status))
            } else {
                StreamError::Status(status)
            };

            let mut body = RecordDecoder::new(connection.body, self.settings.max_record_bytes);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep_until(deadline) => {}
                discarded = body.drain() => debug!(status, discarded, "Discarded error response body"),
            }

            self.transition(ReaderState::Idle);
            return CycleOutcome::ConnectFailed(error);
        }

        self.transition(ReaderState::Streaming);
        let session_cancel = cancel.child_token();
        let decoder = RecordDecoder::new(connection.body, self.settings.max_record_bytes);
        let mut session = tokio::spawn(run_session(
            decoder,
            options,
            session_cancel.clone(),
            votes.clone(),
        ));

        let mut timed_out = false;
        let finished = tokio::select! {
            result = &mut session => Some(result),
            _ = cancel.cancelled() => None,
            _ = sleep_until(deadline) => {
                timed_out = true;
                None
            }
        };

        self.transition(ReaderState::Draining);
        session_cancel.cancel();
        let joined = match finished {
            Some(result) => result,
            None => session.await,
        };

        let mut report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Decode loop task failed");
                SessionReport {
                    end: SessionEnd::Aborted(e.to_string()),
                    records: 0,
                    votes: 0,
                }
            }
        };
        if timed_out && matches!(report.end, SessionEnd::Cancelled) {
            report.end = SessionEnd::TimedOut;
        }

        self.transition(ReaderState::Idle);
        CycleOutcome::Session(report)
    }
}

/// Decode records one at a time and emit one vote per matched option.
///
/// Each send waits while the hand-off is full. Cancellation is observed both
/// while waiting for the next record and while a send is waiting, so a
/// stalled consumer never holds the session past its deadline. Votes of a
/// record not yet sent when cancellation fires are discarded.
pub async fn run_session(
    mut decoder: RecordDecoder,
    options: OptionSet,
    cancel: CancellationToken,
    votes: mpsc::Sender<VoteEvent>,
) -> SessionReport {
    let mut records = 0;
    let mut emitted = 0;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            next = decoder.next_record() => next,
        };

        let post = match next {
            Ok(post) => post,
            Err(e) => break SessionEnd::Decode(e),
        };
        records += 1;

        let mut interrupted = None;
        for option in options.matches(post.text()) {
            debug!(option = %option, "Vote");
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = Some(SessionEnd::Cancelled);
                    break;
                }
                sent = votes.send(VoteEvent::new(option)) => sent,
            };
            if sent.is_err() {
                interrupted = Some(SessionEnd::HandoffClosed);
                break;
            }
            emitted += 1;
        }
        if let Some(end) = interrupted {
            break end;
        }
    };

    SessionReport {
        end,
        records,
        votes: emitted,
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::LoadFailed(e) => warn!(error = %e, "Failed to load options"),
        CycleOutcome::NoOptions => info!("No options configured, skipping stream"),
        CycleOutcome::Cancelled => debug!("Cycle cancelled before streaming"),
        CycleOutcome::ConnectFailed(e) => warn!(error = %e, "Stream connection failed"),
        CycleOutcome::Session(report) => match &report.end {
            SessionEnd::Decode(DecodeError::EndOfStream) => info!(
                records = report.records,
                votes = report.votes,
                "Session ended: stream closed"
            ),
            SessionEnd::Decode(e) => warn!(
                error = %e,
                records = report.records,
                votes = report.votes,
                "Session ended: decode failure"
            ),
            SessionEnd::Aborted(e) => error!(error = %e, "Session aborted"),
            end => info!(
                reason = ?end,
                records = report.records,
                votes = report.votes,
                "Session ended"
            ),
        },
    }
}
