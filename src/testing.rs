//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bus::{BusError, Delivery, DeliverySource, VoteSink};
use crate::poll::{Poll, PollStore, StorageError};
use crate::stream::transport::{BodyStream, StreamConnection, StreamTransport};
use crate::stream::{OptionSet, StreamError};
use crate::vote::VoteEvent;

/// Poll storage held in memory, with switchable failures.
#[derive(Default)]
pub struct MemoryPollStore {
    polls: Mutex<Vec<Poll>>,
    results: Mutex<HashMap<String, u64>>,
    writes: Mutex<Vec<(String, u64)>>,
    fail_reads: AtomicBool,
    failing_options: Mutex<HashSet<String>>,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryPollStore {
    /// One poll listing `options`.
    pub fn with_options(options: &[&str]) -> Self {
        let store = Self::default();
        store.set_options(options);
        store
    }

    pub fn set_options(&self, options: &[&str]) {
        *self.polls.lock().unwrap() = vec![Poll {
            id: "poll".to_string(),
            title: "Test poll".to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }];
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make writes for `option` fail (or succeed again).
    pub fn fail_writes_for(&self, option: &str, fail: bool) {
        let mut failing = self.failing_options.lock().unwrap();
        if fail {
            failing.insert(option.to_string());
        } else {
            failing.remove(option);
        }
    }

    /// Suspend every write for `delay` before applying it.
    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    /// Persisted totals per option.
    pub fn result(&self, option: &str) -> u64 {
        self.results.lock().unwrap().get(option).copied().unwrap_or(0)
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(String, u64)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn list_polls(&self) -> Result<Vec<Poll>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Read("storage unreachable".to_string()));
        }
        Ok(self.polls.lock().unwrap().clone())
    }

    async fn increment_result(&self, option: &str, delta: u64) -> Result<u64, StorageError> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing_options.lock().unwrap().contains(option) {
            return Err(StorageError::Write(format!("write for '{}' refused", option)));
        }

        *self
            .results
            .lock()
            .unwrap()
            .entry(option.to_string())
            .or_default() += delta;
        self.writes.lock().unwrap().push((option.to_string(), delta));
        Ok(1)
    }
}

/// One scripted answer of [`ScriptedTransport`].
pub struct ScriptedResponse {
    result: Result<(u16, Vec<String>), StreamError>,
    hang: bool,
}

impl ScriptedResponse {
    /// A 200 response whose body is `records`, one per line.
    pub fn ok(records: &[&str]) -> Self {
        Self::status(200, records)
    }

    pub fn status(status: u16, lines: &[&str]) -> Self {
        Self {
            result: Ok((status, lines.iter().map(|l| format!("{}\r\n", l)).collect())),
            hang: false,
        }
    }

    pub fn fail(error: StreamError) -> Self {
        Self {
            result: Err(error),
            hang: false,
        }
    }

    /// Keep the body open after the scripted lines instead of ending it.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Transport replaying scripted responses in order.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedResponse>>,
    opened: Mutex<Vec<Vec<String>>>,
    drained: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            opened: Mutex::new(Vec::new()),
            drained: Mutex::new(Vec::new()),
        }
    }

    /// Option lists of every open attempt.
    pub fn opened(&self) -> Vec<Vec<String>> {
        self.opened.lock().unwrap().clone()
    }

    /// Whether the body of the `index`-th connection was read to its end.
    pub fn body_drained(&self, index: usize) -> bool {
        self.drained.lock().unwrap()[index].load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(
        &self,
        options: &OptionSet,
        _timeout: Duration,
    ) -> Result<StreamConnection, StreamError> {
        self.opened.lock().unwrap().push(options.as_slice().to_vec());

        let Some(next) = self.script.lock().unwrap().pop_front() else {
            return Err(StreamError::Connect("script exhausted".to_string()));
        };
        let (status, lines) = next.result?;

        let drained = Arc::new(AtomicBool::new(false));
        self.drained.lock().unwrap().push(drained.clone());

        let chunks = stream::iter(
            lines
                .into_iter()
                .map(|line| Ok::<_, std::io::Error>(Bytes::from(line))),
        );
        let end_marker = stream::once(async move {
            drained.store(true, Ordering::SeqCst);
        })
        .filter_map(|_| async { None::<Result<Bytes, std::io::Error>> });

        let body: BodyStream = if next.hang {
            Box::pin(chunks.chain(stream::pending()))
        } else {
            Box::pin(chunks.chain(end_marker))
        };

        Ok(StreamConnection { status, body })
    }
}

/// Sink recording published votes, optionally refusing some.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, String)>>,
    failing_options: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

impl RecordingSink {
    pub fn fail_for(&self, option: &str) {
        self.failing_options
            .lock()
            .unwrap()
            .insert(option.to_string());
    }

    /// (topic, option) of every accepted vote.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoteSink for RecordingSink {
    async fn publish(&self, topic: &str, vote: &VoteEvent) -> Result<(), BusError> {
        if self.failing_options.lock().unwrap().contains(&vote.option) {
            return Err(BusError::Publish("bus unavailable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), vote.option.clone()));
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Bus entries fed through a channel, for running a
/// [`GroupConsumer`](crate::bus::GroupConsumer) in tests.
pub struct MemorySource {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    pending: Mutex<Vec<Delivery>>,
    next_id: AtomicUsize,
    acked: Mutex<Vec<String>>,
    failing_acks: Mutex<HashSet<String>>,
    failing_reads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> (Self, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            incoming: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            acked: Mutex::new(Vec::new()),
            failing_acks: Mutex::new(HashSet::new()),
            failing_reads: AtomicUsize::new(0),
        };
        (source, tx)
    }

    /// Entries left unacknowledged by an earlier consumer, ids `pending-<n>`.
    pub fn with_pending(self, payloads: &[&str]) -> Self {
        *self.pending.lock().unwrap() = payloads
            .iter()
            .enumerate()
            .map(|(n, payload)| Delivery {
                id: format!("pending-{}", n),
                payload: payload.as_bytes().to_vec(),
            })
            .collect();
        self
    }

    /// Make the ack of entry `id` fail. New entries get ids `1-0`, `2-0`, ...
    pub fn fail_ack(&self, id: &str) {
        self.failing_acks.lock().unwrap().insert(id.to_string());
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Ids acknowledged so far, in order.
    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySource for MemorySource {
    async fn recover(&self) -> Result<Vec<Delivery>, BusError> {
        Ok(std::mem::take(&mut *self.pending.lock().unwrap()))
    }

    async fn next_batch(&self) -> Result<Vec<Delivery>, BusError> {
        let failing = self.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(BusError::Connection("bus unreachable".to_string()));
        }

        let mut incoming = self.incoming.lock().await;
        let Some(first) = incoming.recv().await else {
            return std::future::pending().await;
        };

        let mut payloads = vec![first];
        while let Ok(payload) = incoming.try_recv() {
            payloads.push(payload);
        }
        Ok(payloads
            .into_iter()
            .map(|payload| Delivery {
                id: format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst)),
                payload,
            })
            .collect())
    }

    async fn ack(&self, id: &str) -> Result<(), BusError> {
        if self.failing_acks.lock().unwrap().contains(id) {
            return Err(BusError::Connection(format!("ack {} refused", id)));
        }
        self.acked.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
