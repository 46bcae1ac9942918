//! Storage backend contract.
//!
//! The request log and the response/zone stores sit on this trait rather
//! than a concrete backend: anything offering expirable keys, ordered
//! lists, and a publish channel satisfies it. Two implementations ship:
//! an in-memory store (default, and the test backend) and a Redis store.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::config::Config;
use trapline_shared::{Error, Result};

/// Every storage operation is bounded by this before it can stall a
/// capture handler.
pub const STORAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// A message observed on the publish channel.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub topic: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe; used at startup and by `/health`.
    async fn ping(&self) -> Result<()>;

    async fn kv_set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn kv_del(&self, key: &str) -> Result<()>;
    /// Atomic increment of a numeric key; missing keys start at 0.
    async fn kv_incr(&self, key: &str, ttl: Duration) -> Result<u64>;
    /// Renew a key's TTL without touching its value.
    async fn kv_expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Append to an ordered list; returns the new length.
    async fn list_append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64>;
    /// Inclusive range, negative indices count from the tail.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;
    async fn list_len(&self, key: &str) -> Result<u64>;
    /// Keep only the last `keep` entries, dropping the oldest.
    async fn list_trim_last(&self, key: &str, keep: usize) -> Result<()>;
    /// Remove the first occurrence of `value`; returns removed count.
    async fn list_remove(&self, key: &str, value: &[u8]) -> Result<u64>;
    /// Drop an entire list.
    async fn list_del(&self, key: &str) -> Result<()>;

    /// Publish on a topic. Delivery is at-least-once while a subscriber
    /// is connected; gaps are not replayed (the log provides replay).
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
    /// Process-wide stream of published events across all topics.
    fn events(&self) -> broadcast::Receiver<PublishedEvent>;
}

pub type SharedStore = Arc<dyn Store>;

/// Pick a backend from config: `redis_url` selects Redis, otherwise the
/// in-memory store.
pub async fn connect(cfg: &Config) -> Result<SharedStore> {
    let store: SharedStore = match &cfg.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url, cfg.ws_send_queue).await?),
        None => {
            let memory = Arc::new(MemoryStore::new(cfg.ws_send_queue));
            MemoryStore::start_sweeper(memory.clone());
            memory
        }
    };
    store.ping().await?;
    Ok(store)
}

/// Bound a storage future by [`STORAGE_TIMEOUT`].
pub(crate) async fn timed<T, F>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(STORAGE_TIMEOUT, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::StorageUnavailable("operation timed out".to_string())),
    }
}
