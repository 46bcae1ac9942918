//! Per-subdomain request log.
//!
//! An append-only list of serialised interactions per subdomain
//! (`req:<s>`), a monotonic id counter (`req:<s>:cap`), and position
//! hints (`req:<s>:idx:<id>`). Appends trim to the retention cap and
//! publish a `request` envelope on the subdomain's topic; deletions and
//! clears publish their mirrors. Ordering inside one subdomain is
//! serialised by a per-subdomain mutex so id order equals publish order.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::storage::SharedStore;
use crate::token;
use trapline_shared::protocol::{DeletedId, ServerMessage};
use trapline_shared::{Error, Interaction, Result};

#[derive(Debug, Serialize)]
pub struct Page {
    pub items: Vec<Interaction>,
    pub total: u64,
    pub has_more: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShareDoc {
    subdomain: String,
    #[serde(rename = "_id")]
    id: u64,
}

#[derive(Clone)]
pub struct RequestLog {
    store: SharedStore,
    metrics: Metrics,
    retention: std::time::Duration,
    share_ttl: std::time::Duration,
    cap: usize,
    /// Serialises append→publish per subdomain.
    append_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

fn req_key(sub: &str) -> String {
    format!("req:{sub}")
}
fn cap_key(sub: &str) -> String {
    format!("req:{sub}:cap")
}
fn idx_key(sub: &str, id: u64) -> String {
    format!("req:{sub}:idx:{id}")
}
fn share_key(token: &str) -> String {
    format!("share:{token}")
}
fn topic(sub: &str) -> String {
    format!("req:{sub}")
}

impl RequestLog {
    pub fn new(store: SharedStore, metrics: Metrics, cfg: &Config) -> Self {
        Self {
            store,
            metrics,
            retention: cfg.retention(),
            share_ttl: cfg.share_ttl(),
            cap: cfg.max_log_per_subdomain,
            append_locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, sub: &str) -> Arc<Mutex<()>> {
        self.append_locks
            .entry(sub.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Mint an id and date, append, trim, publish. Returns the stored
    /// interaction. A storage failure surfaces `storage_unavailable` and
    /// is not retried; the wire has already been answered by the caller.
    pub async fn append(&self, mut interaction: Interaction) -> Result<Interaction> {
        let sub = interaction.uid.clone();
        let lock = self.lock_for(&sub);
        let _guard = lock.lock().await;

        interaction.id = self.store.kv_incr(&cap_key(&sub), self.retention).await?;
        interaction.date = chrono::Utc::now().timestamp();

        let payload = serde_json::to_vec(&interaction)?;
        let len = self
            .store
            .list_append(&req_key(&sub), &payload, self.retention)
            .await?;
        let _ = self
            .store
            .kv_set(
                &idx_key(&sub, interaction.id),
                (len - 1).to_string().as_bytes(),
                self.retention,
            )
            .await;
        if len > self.cap as u64 {
            self.store.list_trim_last(&req_key(&sub), self.cap).await?;
        }

        self.metrics.capture(interaction.kind());
        self.publish(
            &sub,
            &ServerMessage::Request {
                subdomain: sub.clone(),
                data: Box::new(interaction.clone()),
            },
        )
        .await;
        Ok(interaction)
    }

    /// Oldest-first page of the log.
    pub async fn list(&self, sub: &str, limit: usize, offset: usize) -> Result<Page> {
        let total = self.store.list_len(&req_key(sub)).await?;
        let start = offset as i64;
        let stop = (offset + limit) as i64 - 1;
        let items = if limit == 0 {
            Vec::new()
        } else {
            self.store
                .list_range(&req_key(sub), start, stop)
                .await?
                .iter()
                .filter_map(|raw| serde_json::from_slice(raw).ok())
                .collect()
        };
        Ok(Page {
            items,
            total,
            has_more: (offset + limit) < total as usize,
        })
    }

    /// Most recent `n` interactions, oldest-first.
    pub async fn recent(&self, sub: &str, n: usize) -> Result<Vec<Interaction>> {
        Ok(self
            .store
            .list_range(&req_key(sub), -(n as i64), -1)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_slice(raw).ok())
            .collect())
    }

    pub async fn get(&self, sub: &str, id: u64) -> Result<Interaction> {
        // Fast path: the position hint, verified against the id since
        // trims and deletes shift positions.
        if let Some(pos) = self.position_hint(sub, id).await {
            if let Some(raw) = self
                .store
                .list_range(&req_key(sub), pos, pos)
                .await?
                .first()
            {
                if let Ok(found) = serde_json::from_slice::<Interaction>(raw) {
                    if found.id == id {
                        return Ok(found);
                    }
                }
            }
        }
        self.scan(sub, id).await.map(|(i, _)| i)
    }

    pub async fn delete(&self, sub: &str, id: u64) -> Result<()> {
        let (_, raw) = self.scan(sub, id).await?;
        let removed = self.store.list_remove(&req_key(sub), &raw).await?;
        if removed == 0 {
            return Err(Error::NotFound);
        }
        let _ = self.store.kv_del(&idx_key(sub, id)).await;

        self.publish(
            sub,
            &ServerMessage::Deleted {
                subdomain: sub.to_string(),
                data: DeletedId { id },
            },
        )
        .await;
        Ok(())
    }

    pub async fn delete_all(&self, sub: &str) -> Result<()> {
        // Drop the position hints alongside the entries they point at.
        // The id counter survives a clear: ids stay monotone per
        // subdomain, so an old share token can never alias a new entry.
        for raw in self.store.list_range(&req_key(sub), 0, -1).await? {
            if let Ok(found) = serde_json::from_slice::<Interaction>(&raw) {
                let _ = self.store.kv_del(&idx_key(sub, found.id)).await;
            }
        }
        self.store.list_del(&req_key(sub)).await?;
        self.publish(
            sub,
            &ServerMessage::Cleared {
                subdomain: sub.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Mint a read-only share token for one interaction.
    pub async fn share(&self, sub: &str, id: u64) -> Result<String> {
        self.get(sub, id).await?;
        let token = token::random_share_token();
        let doc = ShareDoc {
            subdomain: sub.to_string(),
            id,
        };
        self.store
            .kv_set(&share_key(&token), &serde_json::to_vec(&doc)?, self.share_ttl)
            .await?;
        Ok(token)
    }

    /// Dereference a share token; needs no session token.
    pub async fn get_shared(&self, share_token: &str) -> Result<Interaction> {
        let raw = self
            .store
            .kv_get(&share_key(share_token))
            .await?
            .ok_or(Error::NotFound)?;
        let doc: ShareDoc = serde_json::from_slice(&raw).map_err(|_| Error::NotFound)?;
        self.get(&doc.subdomain, doc.id).await
    }

    async fn position_hint(&self, sub: &str, id: u64) -> Option<i64> {
        let raw = self.store.kv_get(&idx_key(sub, id)).await.ok()??;
        std::str::from_utf8(&raw).ok()?.parse().ok()
    }

    /// Full scan for an id; returns the interaction and its stored bytes.
    async fn scan(&self, sub: &str, id: u64) -> Result<(Interaction, Vec<u8>)> {
        for raw in self.store.list_range(&req_key(sub), 0, -1).await? {
            if let Ok(found) = serde_json::from_slice::<Interaction>(&raw) {
                if found.id == id {
                    return Ok((found, raw));
                }
            }
        }
        Err(Error::NotFound)
    }

    async fn publish(&self, sub: &str, msg: &ServerMessage) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("bus envelope serialisation failed: {e}");
                return;
            }
        };
        // A failed publish is counted and ignored; subscribers reconnect
        // and replay through `list`.
        if let Err(e) = self.store.publish(&topic(sub), &payload).await {
            self.metrics.storage_error();
            warn!("publish on {} failed: {e}", topic(sub));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Store};
    use trapline_shared::InteractionDetail;

    fn log_with(cap: usize) -> (RequestLog, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(64));
        let mut cfg = Config::default();
        cfg.max_log_per_subdomain = cap;
        let log = RequestLog::new(store.clone(), Metrics::new(), &cfg);
        (log, store)
    }

    fn tcp_interaction(sub: &str, data: &[u8]) -> Interaction {
        Interaction::new(
            sub,
            data,
            "1.2.3.4",
            4444,
            None,
            InteractionDetail::Tcp {
                data: trapline_shared::interaction::encode_body(data),
                truncated: false,
            },
        )
    }

    #[tokio::test]
    async fn test_append_mints_monotone_ids() {
        let (log, _) = log_with(100);
        let a = log.append(tcp_interaction("abc123", b"a")).await.unwrap();
        let b = log.append(tcp_interaction("abc123", b"b")).await.unwrap();
        let c = log.append(tcp_interaction("abc123", b"c")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);
        assert!(a.date <= b.date && b.date <= c.date);

        // different subdomains get independent counters
        let x = log.append(tcp_interaction("zzz999", b"x")).await.unwrap();
        assert_eq!(x.id, 1);
    }

    #[tokio::test]
    async fn test_trim_drops_oldest_and_404s() {
        let (log, _) = log_with(3);
        let i1 = log.append(tcp_interaction("abc123", b"1")).await.unwrap();
        let i2 = log.append(tcp_interaction("abc123", b"2")).await.unwrap();
        let i3 = log.append(tcp_interaction("abc123", b"3")).await.unwrap();
        let i4 = log.append(tcp_interaction("abc123", b"4")).await.unwrap();

        let page = log.list("abc123", 10, 0).await.unwrap();
        assert_eq!(
            page.items.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![i2.id, i3.id, i4.id]
        );
        assert!(matches!(
            log.get("abc123", i1.id).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_pagination_oldest_first() {
        let (log, _) = log_with(100);
        for i in 0..5u8 {
            log.append(tcp_interaction("abc123", &[i])).await.unwrap();
        }
        let page = log.list("abc123", 2, 0).await.unwrap();
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, 1);

        let page = log.list("abc123", 2, 4).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_get_after_delete_uses_scan_fallback() {
        let (log, _) = log_with(100);
        let i1 = log.append(tcp_interaction("abc123", b"1")).await.unwrap();
        let i2 = log.append(tcp_interaction("abc123", b"2")).await.unwrap();

        log.delete("abc123", i1.id).await.unwrap();
        // i2's position hint is now stale; get must still find it
        assert_eq!(log.get("abc123", i2.id).await.unwrap().id, i2.id);
        assert!(matches!(
            log.get("abc123", i1.id).await,
            Err(Error::NotFound)
        ));
        assert!(matches!(
            log.delete("abc123", i1.id).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_all_clears() {
        let (log, store) = log_with(100);
        log.append(tcp_interaction("abc123", b"1")).await.unwrap();
        let i2 = log.append(tcp_interaction("abc123", b"2")).await.unwrap();
        log.delete_all("abc123").await.unwrap();

        let page = log.list("abc123", 10, 0).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
        assert!(matches!(
            log.get("abc123", i2.id).await,
            Err(Error::NotFound)
        ));
        // position hints were dropped with their entries
        let hint = store
            .kv_get(&idx_key("abc123", i2.id))
            .await
            .unwrap();
        assert!(hint.is_none());

        // the counter survives the clear: ids never restart
        let next = log.append(tcp_interaction("abc123", b"3")).await.unwrap();
        assert!(next.id > i2.id);
    }

    #[tokio::test]
    async fn test_share_roundtrip_and_scope() {
        let (log, _) = log_with(100);
        let i = log.append(tcp_interaction("abc123", b"1")).await.unwrap();
        let token = log.share("abc123", i.id).await.unwrap();
        let shared = log.get_shared(&token).await.unwrap();
        assert_eq!(shared.id, i.id);
        assert_eq!(shared.uid, "abc123");

        assert!(matches!(
            log.get_shared("nonexistent").await,
            Err(Error::NotFound)
        ));
        assert!(matches!(
            log.share("abc123", 999).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_token_expires() {
        let (log, _) = log_with(100);
        let i = log.append(tcp_interaction("abc123", b"1")).await.unwrap();
        let token = log.share("abc123", i.id).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(25 * 3600)).await;
        assert!(matches!(
            log.get_shared(&token).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_append_publishes_envelope() {
        let (log, store) = log_with(100);
        let mut rx = store.events();
        let i = log.append(tcp_interaction("abc123", b"1")).await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.topic, "req:abc123");
        let v: serde_json::Value = serde_json::from_slice(&ev.payload).unwrap();
        assert_eq!(v["cmd"], "request");
        assert_eq!(v["subdomain"], "abc123");
        assert_eq!(v["data"]["_id"], i.id);

        log.delete("abc123", i.id).await.unwrap();
        let ev = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&ev.payload).unwrap();
        assert_eq!(v["cmd"], "deleted");
        assert_eq!(v["data"]["_id"], i.id);

        log.delete_all("abc123").await.unwrap();
        let ev = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&ev.payload).unwrap();
        assert_eq!(v["cmd"], "cleared");
    }
}
