//! Poll storage.
//!
//! Polls are owned outside this system. The core only reads their option
//! lists and writes result increments through the [`PollStore`] trait.
//! [`RedisPollStore`] keeps polls in Redis hashes:
//!
//! ```text
//! <prefix>:polls              SET   poll ids
//! <prefix>:poll:<id>          HASH  title, options (JSON array)
//! <prefix>:poll:<id>:results  HASH  option -> count
//! ```
//!
//! The store does no retrying of its own. Retry of failed writes belongs to
//! the flusher.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, Script};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by poll storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),

    /// The option list could not be read
    #[error("storage read failed: {0}")]
    Read(String),

    /// A result increment was not applied
    #[error("storage write failed: {0}")]
    Write(String),

    #[error("malformed poll '{poll_id}': {reason}")]
    Decode { poll_id: String, reason: String },
}

/// A named ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    pub id: String,

    pub title: String,

    /// Ordered option keywords
    pub options: Vec<String>,
}

/// Storage collaborator for polls and their results.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Read every poll.
    async fn list_polls(&self) -> Result<Vec<Poll>, StorageError>;

    /// Add `delta` to the result of `option` in every poll listing it.
    ///
    /// The write is atomic: either every matching poll is incremented or none
    /// is. Returns the number of polls updated; zero means no poll knows the
    /// option.
    async fn increment_result(&self, option: &str, delta: u64) -> Result<u64, StorageError>;
}

/// Increments `option` in every poll listing it, in one atomic step.
const INCREMENT_SCRIPT: &str = r#"
local ids = redis.call('SMEMBERS', KEYS[1])
local updated = 0
for _, id in ipairs(ids) do
  local poll_key = ARGV[3] .. id
  local raw = redis.call('HGET', poll_key, 'options')
  if raw then
    for _, opt in ipairs(cjson.decode(raw)) do
      if opt == ARGV[1] then
        redis.call('HINCRBY', poll_key .. ':results', ARGV[1], ARGV[2])
        updated = updated + 1
        break
      end
    end
  end
end
return updated
"#;

/// Redis-backed [`PollStore`].
#[derive(Clone)]
pub struct RedisPollStore {
    pool: Pool,
    key_prefix: String,
    increment: Script,
}

impl RedisPollStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            increment: Script::new(INCREMENT_SCRIPT),
        }
    }

    /// Build a pool for `url` and verify it answers PING.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, StorageError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self::new(pool, key_prefix);
        store.ping().await?;
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    fn polls_key(&self) -> String {
        format!("{}:polls", self.key_prefix)
    }

    fn poll_key_prefix(&self) -> String {
        format!("{}:poll:", self.key_prefix)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

/// Build a [`Poll`] from its stored hash fields.
fn decode_poll(id: String, fields: HashMap<String, String>) -> Result<Poll, StorageError> {
    let options = match fields.get("options") {
        Some(raw) => serde_json::from_str::<Vec<String>>(raw).map_err(|e| StorageError::Decode {
            poll_id: id.clone(),
            reason: e.to_string(),
        })?,
        None => {
            return Err(StorageError::Decode {
                poll_id: id,
                reason: "missing options field".to_string(),
            })
        }
    };

    Ok(Poll {
        title: fields.get("title").cloned().unwrap_or_default(),
        id,
        options,
    })
}

#[async_trait]
impl PollStore for RedisPollStore {
    async fn list_polls(&self) -> Result<Vec<Poll>, StorageError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;

        let ids: Vec<String> = cmd("SMEMBERS")
            .arg(self.polls_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;

        let mut polls = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = cmd("HGETALL")
                .arg(format!("{}{}", self.poll_key_prefix(), id))
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Read(e.to_string()))?;

            if fields.is_empty() {
                debug!(poll_id = %id, "Poll listed but has no hash, skipping");
                continue;
            }

            match decode_poll(id, fields) {
                Ok(poll) => polls.push(poll),
                Err(e) => warn!(error = %e, "Skipping malformed poll"),
            }
        }

        debug!(count = polls.len(), "Loaded polls");
        Ok(polls)
    }

    async fn increment_result(&self, option: &str, delta: u64) -> Result<u64, StorageError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;

        let updated: u64 = self
            .increment
            .key(self.polls_key())
            .arg(option)
            .arg(delta)
            .arg(self.poll_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;

        Ok(updated)
    }
}
