//! In-memory vote tallies.
//!
//! [`TallyMap`] holds, per option, the delta accumulated since its last
//! confirmed write. All access goes through one mutex, shared between the
//! bus handlers that increment and the flusher that captures.
//!
//! A delta leaves the map only through [`TallyMap::capture`], which reads and
//! zeroes it in one critical section. If the write of a captured delta fails,
//! [`TallyMap::merge_back`] adds it onto whatever arrived in the meantime.
//! Nothing ever resets a delta unconditionally.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::MessageHandler;

/// Pending per-option deltas.
#[derive(Debug, Clone, Default)]
pub struct TallyMap {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl TallyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one vote for `option`, creating its entry if needed.
    pub async fn increment(&self, option: &str) {
        let mut counts = self.inner.lock().await;
        match counts.get_mut(option) {
            Some(count) => *count += 1,
            None => {
                counts.insert(option.to_string(), 1);
            }
        }
    }

    /// Read and zero every non-zero delta.
    ///
    /// Returns `None` when the map has no entries at all. Entries stay in the
    /// map at zero, so later increments start a fresh delta.
    pub async fn capture(&self) -> Option<Vec<(String, u64)>> {
        let mut counts = self.inner.lock().await;
        if counts.is_empty() {
            return None;
        }

        let captured = counts
            .iter_mut()
            .filter(|(_, count)| **count > 0)
            .map(|(option, count)| (option.clone(), std::mem::take(count)))
            .collect();
        Some(captured)
    }

    /// Return a captured delta whose write failed.
    pub async fn merge_back(&self, option: &str, amount: u64) {
        let mut counts = self.inner.lock().await;
        *counts.entry(option.to_string()).or_default() += amount;
    }

    /// Pending delta for `option`.
    pub async fn pending(&self, option: &str) -> u64 {
        self.inner.lock().await.get(option).copied().unwrap_or(0)
    }

    /// Copy of every entry, zeros included.
    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().await.clone()
    }
}

/// Bus handler turning each delivered message into one increment.
///
/// Messages are always acknowledged. Whether the option belongs to a poll is
/// decided by storage when the delta is written.
#[derive(Debug, Clone)]
pub struct VoteCounter {
    tally: TallyMap,
}

impl VoteCounter {
    pub fn new(tally: TallyMap) -> Self {
        Self { tally }
    }

    pub async fn on_message(&self, payload: &[u8]) {
        let option = String::from_utf8_lossy(payload);
        if option.is_empty() {
            warn!("Ignoring vote message with empty payload");
            return;
        }

        debug!(option = %option, "Vote received");
        self.tally.increment(&option).await;
    }
}

#[async_trait]
impl MessageHandler for VoteCounter {
    async fn on_message(&self, payload: &[u8]) {
        VoteCounter::on_message(self, payload).await
    }
}
