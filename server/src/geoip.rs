//! Country lookup for captured peers.
//!
//! Reads an IP-range CSV database (`start,end,CC` per line, ranges as
//! dotted quads or plain integers, sorted or not) and answers lookups by
//! binary search. Without a configured database every lookup is `None`.

use std::net::IpAddr;
use std::path::Path;

use trapline_shared::{Error, Result};

pub struct GeoIp {
    /// (start, end, country), sorted by start; IPv4 only.
    ranges: Vec<(u32, u32, String)>,
}

impl GeoIp {
    pub fn disabled() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("geoip db {}: {e}", path.display())))?;

        let mut ranges = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split(',');
            let (start, end, cc) = match (parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), Some(c)) => (a.trim(), b.trim(), c.trim()),
                _ => {
                    return Err(Error::Config(format!(
                        "geoip db line {}: expected start,end,country",
                        lineno + 1
                    )))
                }
            };
            let (start, end) = (parse_v4(start), parse_v4(end));
            match (start, end) {
                (Some(s), Some(e)) if s <= e && cc.len() == 2 => {
                    ranges.push((s, e, cc.to_ascii_uppercase()))
                }
                _ => {
                    return Err(Error::Config(format!(
                        "geoip db line {}: bad range or country",
                        lineno + 1
                    )))
                }
            }
        }
        ranges.sort_by_key(|r| r.0);
        Ok(Self { ranges })
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip else { return None };
        let needle = u32::from(v4);
        let idx = self.ranges.partition_point(|r| r.0 <= needle);
        if idx == 0 {
            return None;
        }
        let (start, end, cc) = &self.ranges[idx - 1];
        (*start <= needle && needle <= *end).then(|| cc.clone())
    }

    /// Convenience for handlers that only hold a textual peer address.
    pub fn lookup_str(&self, ip: &str) -> Option<String> {
        ip.parse().ok().and_then(|ip| self.lookup(ip))
    }
}

fn parse_v4(s: &str) -> Option<u32> {
    if let Ok(n) = s.parse::<u32>() {
        return Some(n);
    }
    s.parse::<std::net::Ipv4Addr>().ok().map(u32::from)
}
