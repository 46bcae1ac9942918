//! Subdomain session registry.
//!
//! A session is a `sess:<subdomain>` document holding its creation time.
//! Subdomain labels are generated (or supplied through the admin gate)
//! and collision-checked against live sessions; when every entry for a
//! subdomain has expired the label is free for reuse.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::storage::SharedStore;
use crate::token;
use trapline_shared::{Error, Result};

const CREATE_ATTEMPTS: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct SessionDoc {
    created_at: i64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: SharedStore,
    retention: std::time::Duration,
    subdomain_length: usize,
}

fn sess_key(subdomain: &str) -> String {
    format!("sess:{subdomain}")
}

impl SessionRegistry {
    pub fn new(store: SharedStore, cfg: &Config) -> Self {
        Self {
            store,
            retention: cfg.retention(),
            subdomain_length: cfg.subdomain_length,
        }
    }

    /// Mint a fresh subdomain and record its session document.
    ///
    /// `requested` bypasses generation (admin-supplied labels); it is
    /// still rejected when the label is malformed or alive.
    pub async fn create(&self, requested: Option<&str>) -> Result<String> {
        if let Some(label) = requested {
            if !token::is_valid_subdomain(label, label.len()) || label.len() < 6 {
                return Err(Error::validation("subdomain", "must be ≥6 lower-case alphanumerics"));
            }
            if self.exists(label).await? {
                return Err(Error::validation("subdomain", "already in use"));
            }
            self.write_session(label).await?;
            return Ok(label.to_string());
        }

        for _ in 0..CREATE_ATTEMPTS {
            let label = token::random_subdomain(self.subdomain_length);
            if !self.exists(&label).await? {
                self.write_session(&label).await?;
                return Ok(label);
            }
            warn!("subdomain collision on '{label}', regenerating");
        }
        Err(Error::StorageUnavailable(
            "could not allocate a free subdomain".to_string(),
        ))
    }

    pub async fn exists(&self, subdomain: &str) -> Result<bool> {
        Ok(self.store.kv_get(&sess_key(subdomain)).await?.is_some())
    }

    async fn write_session(&self, subdomain: &str) -> Result<()> {
        let doc = SessionDoc {
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store
            .kv_set(&sess_key(subdomain), &serde_json::to_vec(&doc)?, self.retention)
            .await
    }

    /// Renew the session document alone; capture appends refresh their
    /// own keys, so this keeps the token-backing entry alive too.
    pub async fn renew(&self, subdomain: &str) {
        if let Err(e) = self
            .store
            .kv_expire(&sess_key(subdomain), self.retention)
            .await
        {
            warn!("session ttl refresh failed for {subdomain}: {e}");
        }
    }

    /// Renew retention on every key owned by `subdomain`. Called on any
    /// write touching the subdomain.
    pub async fn touch(&self, subdomain: &str) {
        for key in [
            sess_key(subdomain),
            format!("req:{subdomain}"),
            format!("req:{subdomain}:cap"),
            format!("files:{subdomain}"),
            format!("dns:{subdomain}"),
        ] {
            if let Err(e) = self.store.kv_expire(&key, self.retention).await {
                warn!("ttl refresh failed for {key}: {e}");
            }
        }
    }
}
