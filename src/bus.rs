//! Message bus between the producer and counter processes.
//!
//! The bus is a Redis Stream. The producer appends one entry per vote with
//! [`RedisStreamPublisher`]; the counter reads through a consumer group with
//! [`RedisStreamSubscriber`], which gives at-least-once delivery: an entry is
//! acknowledged only after its handler returns, and entries left pending by a
//! crashed consumer are reclaimed on startup.
//!
//! ```text
//! VotePublisher -> XADD <topic> -> XREADGROUP <group> -> MessageHandler -> XACK
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, from_redis_value, AsyncCommands, RedisResult, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::vote::{VoteEvent, OPTION_FIELD};

/// Idle time threshold for claiming pending messages (in milliseconds)
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// Pause before retrying after the pool fails to hand out a connection
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Errors raised by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Producer side of the bus.
#[async_trait]
pub trait VoteSink: Send + Sync {
    /// Append one vote to `topic`. Fire-and-forget: no retry on error.
    async fn publish(&self, topic: &str, vote: &VoteEvent) -> Result<(), BusError>;

    /// Release the client once no more votes will be published.
    async fn stop(&self);
}

/// Callback invoked once per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, payload: &[u8]);
}

/// Counts reported by a subscriber when it stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Messages handed to the handler
    pub delivered: u64,

    /// Messages acknowledged back to the bus
    pub acked: u64,

    /// Messages reclaimed from a previous consumer
    pub recovered: u64,
}

/// Consumer side of the bus.
#[async_trait]
pub trait VoteSubscriber: Send + Sync {
    /// Deliver messages to `handler` until `stop` is cancelled.
    ///
    /// After `stop` fires no new message is accepted. The call returns only
    /// once every handler already started has finished; that return is the
    /// drain acknowledgement the lifecycle waits for.
    async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        stop: CancellationToken,
    ) -> Result<DeliveryStats, BusError>;
}

/// Create a pool for `url` and check it answers PING.
pub async fn connect_pool(url: &str) -> Result<Pool, BusError> {
    let pool = Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| BusError::Connection(e.to_string()))?;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;
    let _: String = cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;

    Ok(pool)
}

/// Publishes votes with XADD, capping the stream at roughly `max_len` entries.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    pool: Pool,
    max_len: usize,
}

impl RedisStreamPublisher {
    pub fn new(pool: Pool, max_len: usize) -> Self {
        Self { pool, max_len }
    }
}

#[async_trait]
impl VoteSink for RedisStreamPublisher {
    async fn publish(&self, topic: &str, vote: &VoteEvent) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let mut xadd = cmd("XADD");
        xadd.arg(topic).arg("MAXLEN").arg("~").arg(self.max_len).arg("*");
        for (field, value) in vote.fields() {
            xadd.arg(field).arg(value);
        }

        let id: String = xadd
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!(id = %id, option = %vote.option, "Vote published");
        Ok(())
    }

    async fn stop(&self) {
        info!("Publisher: stopping bus client");
        self.pool.close();
        info!("Publisher: bus client stopped");
    }
}

/// One entry handed out by a [`DeliverySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Where a [`GroupConsumer`] reads entries from and acknowledges them to.
#[async_trait]
pub trait DeliverySource: Send + Sync + 'static {
    /// Entries left unacknowledged by earlier consumers.
    async fn recover(&self) -> Result<Vec<Delivery>, BusError>;

    /// Wait for new entries. An empty batch means nothing arrived in time.
    ///
    /// Must be cancel safe: entries read by a dropped call stay pending and
    /// come back through [`DeliverySource::recover`].
    async fn next_batch(&self) -> Result<Vec<Delivery>, BusError>;

    async fn ack(&self, id: &str) -> Result<(), BusError>;
}

/// Runs handlers for a [`DeliverySource`] with bounded concurrency,
/// acknowledging each entry once its handler returns.
pub struct GroupConsumer<S> {
    source: Arc<S>,
    max_in_flight: usize,
}

impl<S: DeliverySource> GroupConsumer<S> {
    pub fn new(source: Arc<S>, max_in_flight: usize) -> Self {
        Self {
            source,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Start the handler for one entry, waiting for a free slot first.
    async fn dispatch(
        &self,
        delivery: Delivery,
        handler: &Arc<dyn MessageHandler>,
        limiter: &Arc<Semaphore>,
        in_flight: &mut JoinSet<Result<(), BusError>>,
    ) {
        let Ok(permit) = limiter.clone().acquire_owned().await else {
            return;
        };

        let handler = handler.clone();
        let source = self.source.clone();
        in_flight.spawn(async move {
            handler.on_message(&delivery.payload).await;
            drop(permit);
            source.ack(&delivery.id).await
        });
    }
}

/// Fold one finished handler task into the stats.
fn settle(result: Result<Result<(), BusError>, JoinError>, stats: &mut DeliveryStats) {
    match result {
        Ok(Ok(())) => stats.acked += 1,
        Ok(Err(e)) => warn!(error = %e, "Failed to ACK message, it will be redelivered"),
        Err(e) => error!(error = %e, "Message handler task failed"),
    }
}

#[async_trait]
impl<S: DeliverySource> VoteSubscriber for GroupConsumer<S> {
    async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        stop: CancellationToken,
    ) -> Result<DeliveryStats, BusError> {
        let limiter = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();
        let mut stats = DeliveryStats::default();

        match self.source.recover().await {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(
                        count = entries.len(),
                        "Claimed pending messages from previous consumers"
                    );
                }
                for entry in entries {
                    stats.recovered += 1;
                    stats.delivered += 1;
                    self.dispatch(entry, &handler, &limiter, &mut in_flight).await;
                }
            }
            Err(e) => debug!(error = %e, "Pending recovery failed, skipping"),
        }

        info!(max_in_flight = self.max_in_flight, "Listening for votes");

        loop {
            while let Some(result) = in_flight.try_join_next() {
                settle(result, &mut stats);
            }

            let batch = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                batch = self.source.next_batch() => batch,
            };

            match batch {
                Ok(batch) => {
                    for entry in batch {
                        stats.delivered += 1;
                        self.dispatch(entry, &handler, &limiter, &mut in_flight).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Bus read failed, retrying");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        info!(
            in_flight = in_flight.len(),
            "Stopped accepting messages, draining in-flight handlers"
        );
        while let Some(result) = in_flight.join_next().await {
            settle(result, &mut stats);
        }

        info!(
            delivered = stats.delivered,
            acked = stats.acked,
            recovered = stats.recovered,
            "Subscriber drained"
        );
        Ok(stats)
    }
}

/// Reads a stream through a consumer group.
///
/// Run it through a [`GroupConsumer`] to deliver entries to a handler.
pub struct RedisStreamSubscriber {
    pool: Pool,
    topic: String,
    group: String,
    consumer: String,
    block_ms: u64,
    batch_size: usize,
}

impl RedisStreamSubscriber {
    pub fn new(pool: Pool, config: &BusConfig) -> Self {
        Self {
            pool,
            topic: config.topic.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name(),
            block_ms: config.block_ms,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Create the consumer group (and the stream) if they do not exist yet.
    ///
    /// A new group starts at the beginning of the stream, so votes published
    /// before the first counter came up are still counted.
    pub async fn subscribe(&self) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let create_group_result: RedisResult<()> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.topic)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match create_group_result {
            Ok(_) => info!(
                topic = %self.topic,
                consumer_group = %self.group,
                "Created consumer group"
            ),
            Err(e) if e.to_string().contains("BUSYGROUP") => info!(
                topic = %self.topic,
                consumer_group = %self.group,
                "Consumer group already exists"
            ),
            Err(e) => {
                error!(error = %e, "Failed to create consumer group");
                return Err(BusError::Subscribe(e.to_string()));
            }
        }

        Ok(())
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, BusError> {
        self.pool
            .get()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    /// Claim entries idle in other consumers' pending lists.
    async fn claim_pending(&self) -> RedisResult<Vec<StreamId>> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "No connection for pending recovery");
                return Ok(Vec::new());
            }
        };

        let mut claimed = Vec::new();
        let mut cursor = "0-0".to_string();
        loop {
            // XAUTOCLAIM key group consumer min-idle-time start [COUNT count]
            let reply: RedisValue = cmd("XAUTOCLAIM")
                .arg(&self.topic)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(PENDING_IDLE_THRESHOLD_MS)
                .arg(&cursor)
                .arg("COUNT")
                .arg(self.batch_size)
                .query_async(&mut conn)
                .await?;

            let RedisValue::Array(parts) = reply else {
                break;
            };
            if parts.len() < 2 {
                break;
            }

            let next: String = from_redis_value(&parts[0])?;
            let batch: StreamRangeReply = from_redis_value(&parts[1])?;
            let empty = batch.ids.is_empty();
            claimed.extend(batch.ids);

            if next == "0-0" || empty {
                break;
            }
            cursor = next;
        }

        Ok(claimed)
    }
}

#[async_trait]
impl DeliverySource for RedisStreamSubscriber {
    async fn recover(&self) -> Result<Vec<Delivery>, BusError> {
        // XAUTOCLAIM might not be available in older Redis versions
        let claimed = self
            .claim_pending()
            .await
            .map_err(|e| BusError::Subscribe(format!("XAUTOCLAIM: {}", e)))?;
        Ok(claimed.into_iter().map(to_delivery).collect())
    }

    async fn next_batch(&self) -> Result<Vec<Delivery>, BusError> {
        let mut conn = self.connection().await?;

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(self.block_ms as usize)
            .count(self.batch_size);
        let keys = [&self.topic];
        let ids = [">"];

        let result: RedisResult<StreamReadReply> = conn.xread_options(&keys, &ids, &opts).await;
        match result {
            Ok(reply) => Ok(reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids)
                .map(to_delivery)
                .collect()),
            Err(e) => {
                let err_str = e.to_string();
                // Timeout/nil replies are normal when no messages arrived
                if err_str.contains("timed out") || err_str.contains("response was nil") {
                    Ok(Vec::new())
                } else {
                    Err(BusError::Subscribe(err_str))
                }
            }
        }
    }

    async fn ack(&self, id: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .xack(&self.topic, &self.group, &[id])
            .await
            .map_err(|e| BusError::Connection(format!("ack {}: {}", id, e)))?;
        Ok(())
    }
}

fn to_delivery(entry: StreamId) -> Delivery {
    Delivery {
        payload: entry_field(&entry.map, OPTION_FIELD)
            .unwrap_or_default()
            .into_bytes(),
        id: entry.id,
    }
}

/// Extract a string field from Redis stream data.
fn entry_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Records payloads after a pause and tracks how many run at once.
    #[derive(Default)]
    struct SlowRecorder {
        delay: Duration,
        seen: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowRecorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for SlowRecorder {
        async fn on_message(&self, payload: &[u8]) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.seen
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(payload).to_string());
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_follows_handler_and_stop_drains() {
        let (source, bus) = MemorySource::new();
        let source = Arc::new(source);
        let consumer = GroupConsumer::new(source.clone(), 4);
        let handler = SlowRecorder::new(Duration::from_secs(5));
        let stop = CancellationToken::new();

        bus.send(b"cats".to_vec()).unwrap();
        let task = tokio::spawn({
            let handler: Arc<dyn MessageHandler> = handler.clone();
            let stop = stop.clone();
            async move { consumer.run(handler, stop).await }
        });

        sleep(Duration::from_secs(1)).await;
        assert!(source.acked().is_empty());

        stop.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(handler.seen(), vec!["cats"]);
        assert_eq!(source.acked(), vec!["1-0"]);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_is_not_counted() {
        let (source, bus) = MemorySource::new();
        source.fail_ack("1-0");
        let source = Arc::new(source);
        let handler = SlowRecorder::new(Duration::ZERO);
        let stop = CancellationToken::new();

        bus.send(b"cats".to_vec()).unwrap();
        bus.send(b"dogs".to_vec()).unwrap();
        let task = tokio::spawn({
            let consumer = GroupConsumer::new(source.clone(), 4);
            let handler: Arc<dyn MessageHandler> = handler.clone();
            let stop = stop.clone();
            async move { consumer.run(handler, stop).await }
        });

        sleep(Duration::from_millis(100)).await;
        stop.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(handler.seen().len(), 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.acked, 1);
        assert_eq!(source.acked(), vec!["2-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_retries_after_delay() {
        let (source, bus) = MemorySource::new();
        source.fail_next_reads(1);
        let source = Arc::new(source);
        let handler = SlowRecorder::new(Duration::ZERO);
        let stop = CancellationToken::new();

        bus.send(b"cats".to_vec()).unwrap();
        let task = tokio::spawn({
            let consumer = GroupConsumer::new(source.clone(), 4);
            let handler: Arc<dyn MessageHandler> = handler.clone();
            let stop = stop.clone();
            async move { consumer.run(handler, stop).await }
        });

        sleep(RECONNECT_DELAY / 2).await;
        assert!(handler.seen().is_empty());

        sleep(RECONNECT_DELAY).await;
        assert_eq!(handler.seen(), vec!["cats"]);

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_handlers_are_bounded() {
        let (source, bus) = MemorySource::new();
        let source = Arc::new(source);
        let handler = SlowRecorder::new(Duration::from_secs(1));
        let stop = CancellationToken::new();

        for _ in 0..5 {
            bus.send(b"cats".to_vec()).unwrap();
        }
        let task = tokio::spawn({
            let consumer = GroupConsumer::new(source.clone(), 2);
            let handler: Arc<dyn MessageHandler> = handler.clone();
            let stop = stop.clone();
            async move { consumer.run(handler, stop).await }
        });

        sleep(Duration::from_secs(10)).await;
        stop.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.acked, 5);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_entry_field_bulk_string() {
        let mut map = HashMap::new();
        map.insert(
            OPTION_FIELD.to_string(),
            RedisValue::BulkString(b"cats".to_vec()),
        );
        assert_eq!(entry_field(&map, OPTION_FIELD), Some("cats".to_string()));
    }

    #[test]
    fn test_entry_field_simple_string() {
        let mut map = HashMap::new();
        map.insert(
            OPTION_FIELD.to_string(),
            RedisValue::SimpleString("dogs".to_string()),
        );
        assert_eq!(entry_field(&map, OPTION_FIELD), Some("dogs".to_string()));
    }

    #[test]
    fn test_entry_field_missing_or_unexpected() {
        let mut map = HashMap::new();
        map.insert(OPTION_FIELD.to_string(), RedisValue::Int(3));
        assert_eq!(entry_field(&map, OPTION_FIELD), None);
        assert_eq!(entry_field(&HashMap::new(), OPTION_FIELD), None);
    }

    #[test]
    fn test_settle_counts_acks_only() {
        let mut stats = DeliveryStats::default();
        settle(Ok(Ok(())), &mut stats);
        settle(Ok(Err(BusError::Connection("down".into()))), &mut stats);
        assert_eq!(stats.acked, 1);
    }
}
