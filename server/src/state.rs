//! Shared service state passed through every handler chain.

use std::sync::Arc;

use crate::config::Config;
use crate::files::FileStore;
use crate::geoip::GeoIp;
use crate::log::RequestLog;
use crate::metrics::Metrics;
use crate::session::SessionRegistry;
use crate::storage::SharedStore;
use crate::token::TokenService;
use crate::zone::ZoneStore;
use trapline_shared::Result;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: SharedStore,
    pub tokens: Arc<TokenService>,
    pub sessions: SessionRegistry,
    pub log: RequestLog,
    pub files: FileStore,
    pub zone: ZoneStore,
    pub metrics: Metrics,
    pub geoip: Arc<GeoIp>,
}

impl AppState {
    pub fn new(cfg: Config, store: SharedStore) -> Result<Self> {
        let geoip = match &cfg.geoip_db {
            Some(path) => GeoIp::from_file(path)?,
            None => GeoIp::disabled(),
        };
        let metrics = Metrics::new();
        Ok(Self {
            tokens: Arc::new(TokenService::new(&cfg.signing)?),
            sessions: SessionRegistry::new(store.clone(), &cfg),
            log: RequestLog::new(store.clone(), metrics.clone(), &cfg),
            files: FileStore::new(store.clone(), &cfg),
            zone: ZoneStore::new(store.clone(), &cfg),
            metrics,
            geoip: Arc::new(geoip),
            store,
            cfg: Arc::new(cfg),
        })
    }

    pub fn country_for(&self, ip: &str) -> Option<String> {
        self.geoip.lookup_str(ip)
    }

    /// Append a capture after the wire has been answered. Failures are
    /// logged and counted, never propagated back toward the socket.
    pub async fn record(&self, interaction: trapline_shared::Interaction) {
        let sub = interaction.uid.clone();
        if let Err(e) = self.log.append(interaction).await {
            self.metrics.storage_error();
            tracing::warn!("capture append for {sub} failed: {e}");
        }
        self.sessions.renew(&sub).await;
    }
}
