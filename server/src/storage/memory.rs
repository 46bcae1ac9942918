//! In-memory storage backend.
//!
//! DashMap-backed key/value and list tables with lazy TTL expiry plus a
//! periodic sweep, and a broadcast channel standing in for the publish
//! side of the contract. This is the default backend and the one the
//! test suite runs against.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{PublishedEvent, Store};
use trapline_shared::{Error, Result};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

struct ListEntry {
    items: VecDeque<Vec<u8>>,
    expires_at: Instant,
}

pub struct MemoryStore {
    kv: DashMap<String, Entry>,
    lists: DashMap<String, ListEntry>,
    events: broadcast::Sender<PublishedEvent>,
}

impl MemoryStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(16));
        Self {
            kv: DashMap::new(),
            lists: DashMap::new(),
            events,
        }
    }

    /// Spawn the background sweep for a shared store.
    pub fn start_sweeper(store: std::sync::Arc<Self>) {
        let weak = std::sync::Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(s) => s.sweep(),
                    None => break,
                }
            }
        });
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.kv.retain(|_, e| e.expires_at > now);
        self.lists.retain(|_, e| e.expires_at > now);
    }

    fn kv_live(&self, key: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Entry>> {
        let entry = self.kv.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.kv.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn kv_set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv_live(key).map(|e| e.value.clone()))
    }

    async fn kv_del(&self, key: &str) -> Result<()> {
        self.kv.remove(key);
        Ok(())
    }

    async fn kv_incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entry = self.kv.entry(key.to_string()).or_insert_with(|| Entry {
            value: b"0".to_vec(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = b"0".to_vec();
        }
        let current: u64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::StorageUnavailable("counter is not numeric".to_string()))?;
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        entry.expires_at = now + ttl;
        Ok(next)
    }

    async fn kv_expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut e) = self.kv.get_mut(key) {
            e.expires_at = Instant::now() + ttl;
        }
        if let Some(mut e) = self.lists.get_mut(key) {
            e.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn list_append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entry = self.lists.entry(key.to_string()).or_insert_with(|| ListEntry {
            items: VecDeque::new(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.items.clear();
        }
        entry.items.push_back(value.to_vec());
        entry.expires_at = now + ttl;
        Ok(entry.items.len() as u64)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        if entry.expires_at <= Instant::now() {
            return Ok(Vec::new());
        }
        let len = entry.items.len() as i64;
        let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
        let (start, stop) = (norm(start), norm(stop));
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(entry
            .items
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self
            .lists
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.items.len() as u64)
            .unwrap_or(0))
    }

    async fn list_trim_last(&self, key: &str, keep: usize) -> Result<()> {
        if let Some(mut entry) = self.lists.get_mut(key) {
            while entry.items.len() > keep {
                entry.items.pop_front();
            }
        }
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &[u8]) -> Result<u64> {
        if let Some(mut entry) = self.lists.get_mut(key) {
            if let Some(pos) = entry.items.iter().position(|v| v == value) {
                entry.items.remove(pos);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn list_del(&self, key: &str) -> Result<()> {
        self.lists.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        // No subscribers is not an error; captures happen regardless.
        let _ = self.events.send(PublishedEvent {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }
}
