//! Redis storage backend.
//!
//! Key/value entries use SET with EX, logs are Redis lists, and the
//! publish channel is Redis pub/sub. A dedicated subscriber connection
//! psubscribes to the capture topics and pumps messages into the same
//! process-wide broadcast the in-memory store uses, so the subscription
//! bus is backend-agnostic.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Client;
use fred::interfaces::*;
use fred::types::{config::Config as RedisConfig, Expiration};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{timed, PublishedEvent, Store};
use trapline_shared::{Error, Result};

/// Pattern covering every per-subdomain publish topic.
const TOPIC_PATTERN: &str = "req:*";

pub struct RedisStore {
    client: Client,
    events: broadcast::Sender<PublishedEvent>,
}

fn storage_err(e: fred::error::Error) -> Error {
    Error::StorageUnavailable(e.to_string())
}

impl RedisStore {
    pub async fn connect(url: &str, event_capacity: usize) -> Result<Self> {
        let config = RedisConfig::from_url(url).map_err(storage_err)?;
        let client = Client::new(config, None, None, None);
        client.init().await.map_err(storage_err)?;

        let subscriber = client.clone_new();
        subscriber.init().await.map_err(storage_err)?;
        subscriber
            .psubscribe(TOPIC_PATTERN)
            .await
            .map_err(storage_err)?;

        let (events, _) = broadcast::channel(event_capacity.max(16));
        let tx = events.clone();
        let mut message_rx = subscriber.message_rx();
        tokio::spawn(async move {
            loop {
                match message_rx.recv().await {
                    Ok(msg) => {
                        let topic = msg.channel.to_string();
                        let payload: Vec<u8> = match msg.value.convert() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("unreadable pubsub payload on {topic}: {e}");
                                continue;
                            }
                        };
                        let _ = tx.send(PublishedEvent {
                            topic,
                            payload: Bytes::from(payload),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("pubsub pump lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { client, events })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<()> {
        timed(async {
            self.client.ping::<()>(None).await.map_err(storage_err)
        })
        .await
    }

    async fn kv_set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        timed(async {
            let _: () = self
                .client
                .set(
                    key,
                    value.to_vec(),
                    Some(Expiration::EX(ttl.as_secs() as i64)),
                    None,
                    false,
                )
                .await
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        timed(async {
            let value: Option<Vec<u8>> = self.client.get(key).await.map_err(storage_err)?;
            Ok(value)
        })
        .await
    }

    async fn kv_del(&self, key: &str) -> Result<()> {
        timed(async {
            let _: i64 = self.client.del(key).await.map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn kv_incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        timed(async {
            let next: u64 = self.client.incr(key).await.map_err(storage_err)?;
            let _: i64 = self
                .client
                .expire(key, ttl.as_secs() as i64, None)
                .await
                .map_err(storage_err)?;
            Ok(next)
        })
        .await
    }

    async fn kv_expire(&self, key: &str, ttl: Duration) -> Result<()> {
        timed(async {
            let _: i64 = self
                .client
                .expire(key, ttl.as_secs() as i64, None)
                .await
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn list_append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64> {
        timed(async {
            let len: u64 = self.client.rpush(key, value.to_vec()).await.map_err(storage_err)?;
            let _: i64 = self
                .client
                .expire(key, ttl.as_secs() as i64, None)
                .await
                .map_err(storage_err)?;
            Ok(len)
        })
        .await
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        timed(async {
            let items: Vec<Vec<u8>> = self
                .client
                .lrange(key, start, stop)
                .await
                .map_err(storage_err)?;
            Ok(items)
        })
        .await
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        timed(async {
            let len: u64 = self.client.llen(key).await.map_err(storage_err)?;
            Ok(len)
        })
        .await
    }

    async fn list_trim_last(&self, key: &str, keep: usize) -> Result<()> {
        timed(async {
            let _: () = self
                .client
                .ltrim(key, -(keep as i64), -1)
                .await
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn list_remove(&self, key: &str, value: &[u8]) -> Result<u64> {
        timed(async {
            let removed: u64 = self
                .client
                .lrem(key, 1, value.to_vec())
                .await
                .map_err(storage_err)?;
            Ok(removed)
        })
        .await
    }

    async fn list_del(&self, key: &str) -> Result<()> {
        timed(async {
            let _: i64 = self.client.del(key).await.map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        timed(async {
            let _: i64 = self
                .client
                .publish(topic, payload.to_vec())
                .await
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    fn events(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }
}
