//! Per-subdomain DNS zone.
//!
//! An ordered record list stored whole as `dns:<subdomain>`. Labels are
//! relative to the subdomain root: "" is the subdomain itself, "*" is a
//! wildcard matching any prefix. A `%` in a value selects a random
//! sibling record at query time (and `%` octets in A values randomise).

use std::net::{Ipv4Addr, Ipv6Addr};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::storage::SharedStore;
use trapline_shared::{Error, Result};

const MAX_RECORDS: usize = 128;
const MAX_VALUE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    AAAA,
    CNAME,
    TXT,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::A => "A",
            RecordKind::AAAA => "AAAA",
            RecordKind::CNAME => "CNAME",
            RecordKind::TXT => "TXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Label relative to the subdomain root; "" is the root, "*" wildcard.
    pub domain: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub value: String,
    #[serde(default = "default_record_ttl")]
    pub ttl: u32,
}

fn default_record_ttl() -> u32 {
    60
}

#[derive(Clone)]
pub struct ZoneStore {
    store: SharedStore,
    retention: std::time::Duration,
}

fn dns_key(sub: &str) -> String {
    format!("dns:{sub}")
}

impl ZoneStore {
    pub fn new(store: SharedStore, cfg: &Config) -> Self {
        Self {
            store,
            retention: cfg.retention(),
        }
    }

    pub async fn get(&self, sub: &str) -> Result<Vec<DnsRecord>> {
        match self.store.kv_get(&dns_key(sub)).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the zone. Order is preserved; first match wins at query
    /// time.
    pub async fn put(&self, sub: &str, records: &[DnsRecord]) -> Result<()> {
        if records.len() > MAX_RECORDS {
            return Err(Error::validation("records", "too many records"));
        }
        for r in records {
            validate_record(r)?;
        }
        self.store
            .kv_set(&dns_key(sub), &serde_json::to_vec(records)?, self.retention)
            .await
    }

    pub async fn append(&self, sub: &str, record: DnsRecord) -> Result<()> {
        validate_record(&record)?;
        let mut records = self.get(sub).await?;
        if records.len() >= MAX_RECORDS {
            return Err(Error::validation("records", "too many records"));
        }
        records.push(record);
        self.store
            .kv_set(&dns_key(sub), &serde_json::to_vec(&records)?, self.retention)
            .await
    }

    /// Remove every record matching (domain, type).
    pub async fn remove(&self, sub: &str, domain: &str, kind: RecordKind) -> Result<()> {
        let mut records = self.get(sub).await?;
        let before = records.len();
        records.retain(|r| !(r.domain.eq_ignore_ascii_case(domain) && r.kind == kind));
        if records.len() == before {
            return Err(Error::NotFound);
        }
        self.store
            .kv_set(&dns_key(sub), &serde_json::to_vec(&records)?, self.retention)
            .await
    }
}

pub fn validate_record(r: &DnsRecord) -> Result<()> {
    let domain = r.domain.to_lowercase();
    if domain.len() > 253 {
        return Err(Error::validation("domain", "too long"));
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '*' || c == '_')
    {
        return Err(Error::validation(
            "domain",
            format!("invalid characters in '{domain}'"),
        ));
    }
    if r.value.len() > MAX_VALUE_LEN {
        return Err(Error::validation("value", "too long"));
    }

    // "%" alone defers to sibling records at query time, any type.
    if r.value == "%" {
        return Ok(());
    }

    match r.kind {
        RecordKind::A => {
            let ok = r.value.parse::<Ipv4Addr>().is_ok() || is_placeholder_v4(&r.value);
            if !ok {
                return Err(Error::validation(
                    "value",
                    format!("'{}' is not an IPv4 address", r.value),
                ));
            }
        }
        RecordKind::AAAA => {
            if r.value.parse::<Ipv6Addr>().is_err() {
                return Err(Error::validation(
                    "value",
                    format!("'{}' is not an IPv6 address", r.value),
                ));
            }
        }
        RecordKind::CNAME => {
            let name = r.value.trim_end_matches('.');
            let ok = !name.is_empty()
                && name.split('.').all(|l| {
                    !l.is_empty()
                        && l.chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                });
            if !ok {
                return Err(Error::validation(
                    "value",
                    format!("'{}' is not a DNS name", r.value),
                ));
            }
        }
        // Long TXT values are chunked into 255-byte strings on the wire.
        RecordKind::TXT => {}
    }
    Ok(())
}

/// IPv4 with `%` placeholder octets, e.g. "10.0.0.%".
fn is_placeholder_v4(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 4
        && value.contains('%')
        && parts
            .iter()
            .all(|p| *p == "%" || p.parse::<u8>().is_ok())
}

/// A matched record with its value expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub value: String,
    pub ttl: u32,
}

/// Find the answer for (`label`, `kind`) in a zone.
///
/// `label` is relative to the subdomain root ("" for the apex). Exact
/// matches are preferred over the "*" wildcard; within each, zone order
/// wins. `%` values expand per the zone's sibling records.
pub fn resolve(records: &[DnsRecord], label: &str, kind: RecordKind) -> Option<Answer> {
    let label = label.to_lowercase();
    let exact = records
        .iter()
        .find(|r| r.kind == kind && r.domain.eq_ignore_ascii_case(&label));
    let chosen = exact.or_else(|| {
        records
            .iter()
            .find(|r| r.kind == kind && r.domain == "*" && !label.is_empty())
    })?;

    expand_value(records, chosen, kind).map(|value| Answer {
        value,
        ttl: chosen.ttl,
    })
}

fn expand_value(records: &[DnsRecord], chosen: &DnsRecord, kind: RecordKind) -> Option<String> {
    if chosen.value == "%" {
        // Random pick among literal-valued siblings: same label first,
        // then anywhere in the zone with the same type.
        let same_label: Vec<&DnsRecord> = records
            .iter()
            .filter(|r| {
                r.kind == kind && r.domain == chosen.domain && !r.value.contains('%')
            })
            .collect();
        let pool = if same_label.is_empty() {
            records
                .iter()
                .filter(|r| r.kind == kind && !r.value.contains('%'))
                .collect()
        } else {
            same_label
        };
        if pool.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..pool.len());
        return Some(pool[pick].value.clone());
    }

    if kind == RecordKind::A && chosen.value.contains('%') {
        let mut rng = rand::thread_rng();
        let octets: Vec<String> = chosen
            .value
            .split('.')
            .map(|p| {
                if p == "%" {
                    rng.gen_range(0u16..256).to_string()
                } else {
                    p.to_string()
                }
            })
            .collect();
        return Some(octets.join("."));
    }

    Some(chosen.value.clone())
}
