//! Configuration for the Trapline server.
//!
//! Loaded from a YAML file (`TRAPLINE_CONFIG`, default `trapline.yml` when
//! present) with env-var overrides for the deploy-critical options. Every
//! field has a serde default so an empty file is a valid config.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trapline_shared::{Error, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Public service domain; the label immediately to its left selects
    /// the subdomain on every capture front-end.
    #[serde(default = "default_service_domain")]
    pub service_domain: String,

    /// Address all listeners bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Control API (HTTP + WebSocket) port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Capture listener ports.
    #[serde(default = "default_http_ports")]
    pub http_ports: Vec<u16>,
    #[serde(default = "default_dns_ports")]
    pub dns_ports: Vec<u16>,
    #[serde(default = "default_smtp_ports")]
    pub smtp_ports: Vec<u16>,
    #[serde(default)]
    pub tcp_ports: Vec<u16>,

    /// Optional TLS for the HTTP capture listeners.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Retention for sess/req/files/dns entries, in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Share-token lifetime, in hours.
    #[serde(default = "default_share_ttl_hours")]
    pub share_ttl_hours: u64,

    /// Truncation cap for bodies and raw blobs.
    #[serde(default = "default_body_cap_bytes")]
    pub body_cap_bytes: usize,

    /// Oldest entries beyond this are trimmed from each subdomain log.
    #[serde(default = "default_max_log")]
    pub max_log_per_subdomain: usize,

    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_conn: usize,

    /// Per-connection send queue; drop-oldest on overflow.
    #[serde(default = "default_ws_send_queue")]
    pub ws_send_queue: usize,

    /// When set, session creation requires this secret.
    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default)]
    pub signing: SigningConfig,

    /// Redis URL; absent selects the in-memory store.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional IP-range CSV database for country lookups.
    #[serde(default)]
    pub geoip_db: Option<PathBuf>,

    /// TTL stamped on DNS answers.
    #[serde(default = "default_dns_ttl")]
    pub dns_default_ttl: u32,

    /// Generated subdomain label length.
    #[serde(default = "default_subdomain_length")]
    pub subdomain_length: usize,

    /// Session creations allowed per client IP per window; 0 disables.
    #[serde(default = "default_session_rate_limit")]
    pub session_rate_limit: u32,
    #[serde(default = "default_session_rate_window")]
    pub session_rate_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Token signing keys. `active` names the key new tokens are signed with;
/// every entry verifies, so rotation keeps old tokens valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default)]
    pub active: String,
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

fn default_service_domain() -> String {
    "trapline.test".to_string()
}
fn default_bind_addr() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}
fn default_api_port() -> u16 {
    8080
}
fn default_http_ports() -> Vec<u16> {
    vec![80]
}
fn default_dns_ports() -> Vec<u16> {
    vec![53]
}
fn default_smtp_ports() -> Vec<u16> {
    vec![25]
}
fn default_retention_days() -> u64 {
    7
}
fn default_share_ttl_hours() -> u64 {
    24
}
fn default_body_cap_bytes() -> usize {
    1024 * 1024
}
fn default_max_log() -> usize {
    10_000
}
fn default_max_subscriptions() -> usize {
    5
}
fn default_ws_send_queue() -> usize {
    512
}
fn default_dns_ttl() -> u32 {
    60
}
fn default_subdomain_length() -> usize {
    6
}
fn default_session_rate_limit() -> u32 {
    60
}
fn default_session_rate_window() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config is valid")
    }
}

impl Config {
    /// Load from `TRAPLINE_CONFIG` (or `./trapline.yml` when it exists),
    /// apply env overrides, then validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("TRAPLINE_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let p = PathBuf::from("trapline.yml");
                p.exists().then_some(p)
            });

        let mut cfg = match path {
            Some(p) => Self::from_file(&p)?,
            None => Config::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TRAPLINE_DOMAIN") {
            self.service_domain = v;
        }
        if let Ok(v) = std::env::var("TRAPLINE_REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("TRAPLINE_ADMIN_TOKEN") {
            self.admin_token = Some(v);
        }
        if let Ok(v) = std::env::var("TRAPLINE_SIGNING_KEY") {
            self.signing.active = "env".to_string();
            self.signing.keys.insert("env".to_string(), v);
        }
        if let Ok(v) = std::env::var("TRAPLINE_API_PORT") {
            if let Ok(p) = v.parse() {
                self.api_port = p;
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.service_domain.is_empty() || self.service_domain.contains('/') {
            return Err(Error::Config(format!(
                "invalid service_domain '{}'",
                self.service_domain
            )));
        }
        if self.subdomain_length < 6 {
            return Err(Error::Config(
                "subdomain_length must be at least 6".to_string(),
            ));
        }
        if self.body_cap_bytes == 0 || self.max_log_per_subdomain == 0 {
            return Err(Error::Config(
                "body_cap_bytes and max_log_per_subdomain must be nonzero".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(Error::Config("retention_days must be nonzero".to_string()));
        }
        if let Some(tls) = &self.tls {
            for p in [&tls.cert, &tls.key] {
                if !p.exists() {
                    return Err(Error::Config(format!("TLS file missing: {}", p.display())));
                }
            }
        }

        // No signing key configured: generate an ephemeral one. Tokens die
        // with the process, which is fine for dev setups.
        if self.signing.keys.is_empty() {
            let key = crate::token::random_secret();
            tracing::warn!("no signing key configured, generated an ephemeral one");
            self.signing.active = "ephemeral".to_string();
            self.signing.keys.insert("ephemeral".to_string(), key);
        }
        if !self.signing.keys.contains_key(&self.signing.active) {
            return Err(Error::Config(format!(
                "signing.active '{}' is not in signing.keys",
                self.signing.active
            )));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }

    pub fn share_ttl(&self) -> Duration {
        Duration::from_secs(self.share_ttl_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.share_ttl_hours, 24);
        assert_eq!(cfg.body_cap_bytes, 1024 * 1024);
        assert_eq!(cfg.max_log_per_subdomain, 10_000);
        assert_eq!(cfg.max_subscriptions_per_conn, 5);
        assert_eq!(cfg.ws_send_queue, 512);
        assert_eq!(cfg.http_ports, vec![80]);
        assert!(cfg.tcp_ports.is_empty());
        assert!(cfg.admin_token.is_none());
    }

    #[test]
    fn test_yaml_overrides() {
        let cfg: Config = serde_yaml::from_str(
            r#"
service_domain: capture.example.com
http_ports: [8000, 8443]
tcp_ports: [9000]
retention_days: 2
admin_token: hunter2
signing:
  active: k1
  keys:
    k1: super-secret
"#,
        )
        .unwrap();
        assert_eq!(cfg.service_domain, "capture.example.com");
        assert_eq!(cfg.http_ports, vec![8000, 8443]);
        assert_eq!(cfg.retention_days, 2);
        assert_eq!(cfg.admin_token.as_deref(), Some("hunter2"));
        assert_eq!(cfg.signing.active, "k1");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.subdomain_length = 4;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.signing.active = "missing".into();
        cfg.signing.keys.insert("other".into(), "k".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_generates_ephemeral_key() {
        let mut cfg = Config::default();
        assert!(cfg.signing.keys.is_empty());
        cfg.validate().unwrap();
        assert!(cfg.signing.keys.contains_key(&cfg.signing.active));
    }

    #[test]
    fn test_durations() {
        let cfg = Config::default();
        assert_eq!(cfg.retention(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(cfg.share_ttl(), Duration::from_secs(24 * 3600));
    }
}
