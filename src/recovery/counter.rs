//! Error-frequency counters keyed by `(context, error kind)`.
//!
//! The in-memory store lives for the process and resets on restart. The Redis
//! store keeps counts across restarts and across processes sharing a server.

use super::classify::ErrorKind;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

const KEY_PREFIX: &str = "trendforge:errors:";

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter backend unavailable: {0}")]
    Backend(String),
}

#[async_trait]
pub trait FrequencyStore: Send + Sync {
    /// Adds one occurrence and returns the new total.
    async fn increment(&self, context: &str, kind: ErrorKind) -> Result<u64, CounterError>;
    async fn get(&self, context: &str, kind: ErrorKind) -> Result<u64, CounterError>;
    async fn reset(&self, context: &str, kind: ErrorKind) -> Result<(), CounterError>;
}

#[derive(Default)]
pub struct MemoryFrequencyStore {
    counts: Mutex<HashMap<(String, ErrorKind), u64>>,
}

impl MemoryFrequencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FrequencyStore for MemoryFrequencyStore {
    async fn increment(&self, context: &str, kind: ErrorKind) -> Result<u64, CounterError> {
        let mut guard = self.counts.lock().await;
        let entry = guard.entry((context.to_string(), kind)).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn get(&self, context: &str, kind: ErrorKind) -> Result<u64, CounterError> {
        let guard = self.counts.lock().await;
        Ok(guard
            .get(&(context.to_string(), kind))
            .copied()
            .unwrap_or(0))
    }

    async fn reset(&self, context: &str, kind: ErrorKind) -> Result<(), CounterError> {
        self.counts.lock().await.remove(&(context.to_string(), kind));
        Ok(())
    }
}

pub struct RedisFrequencyStore {
    client: redis::Client,
}

impl RedisFrequencyStore {
    pub fn open(redis_url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| CounterError::Backend(format!("redis connection error: {err}")))?;
        Ok(Self { client })
    }

    fn key(context: &str, kind: ErrorKind) -> String {
        format!("{KEY_PREFIX}{context}:{}", kind.as_str())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CounterError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CounterError::Backend(err.to_string()))
    }
}

#[async_trait]
impl FrequencyStore for RedisFrequencyStore {
    async fn increment(&self, context: &str, kind: ErrorKind) -> Result<u64, CounterError> {
        let mut conn = self.connection().await?;
        let total: u64 = conn
            .incr(Self::key(context, kind), 1u64)
            .await
            .map_err(|err| CounterError::Backend(err.to_string()))?;
        Ok(total)
    }

    async fn get(&self, context: &str, kind: ErrorKind) -> Result<u64, CounterError> {
        let mut conn = self.connection().await?;
        let total: Option<u64> = conn
            .get(Self::key(context, kind))
            .await
            .map_err(|err| CounterError::Backend(err.to_string()))?;
        Ok(total.unwrap_or(0))
    }

    async fn reset(&self, context: &str, kind: ErrorKind) -> Result<(), CounterError> {
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .del(Self::key(context, kind))
            .await
            .map_err(|err| CounterError::Backend(err.to_string()))?;
        Ok(())
    }
}
