//! The canonical captured-interaction model.
//!
//! Every wire-level event a capture front-end sees is normalised into an
//! [`Interaction`]: a common header (id, owner, date, peer, raw rendering)
//! plus one protocol-specific variant tagged by `type` on the wire.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// A single captured network interaction.
///
/// `id` is minted by the request log and is strictly monotone per
/// subdomain; `date` is seconds since epoch and non-decreasing with `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    #[serde(rename = "_id")]
    pub id: u64,
    /// Owning subdomain.
    pub uid: String,
    /// Insertion time, seconds since epoch.
    pub date: i64,
    /// Compact base64 rendering of the wire event, for search/display.
    pub raw: String,
    /// Peer address.
    pub ip: String,
    pub port: u16,
    /// Two-letter country code, when geo lookup is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(flatten)]
    pub detail: InteractionDetail,
}

/// Protocol-specific payload, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InteractionDetail {
    Http {
        method: String,
        /// Raw request-target, query string included.
        path: String,
        protocol: String,
        /// Ordered multimap, preserved as received.
        headers: Vec<(String, String)>,
        /// Body bytes, base64, truncated to the configured cap.
        body: String,
        #[serde(default, skip_serializing_if = "is_false")]
        truncated: bool,
    },
    Dns {
        query_type: String,
        /// Full query name as asked.
        domain: String,
        /// The answer served, or the textual rcode when none was.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
    },
    Smtp {
        /// Concatenated command/data transcript of the session.
        frame: String,
    },
    Tcp {
        /// Captured bytes, base64, truncated to the configured cap.
        data: String,
        #[serde(default, skip_serializing_if = "is_false")]
        truncated: bool,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Interaction {
    /// Build an interaction with an unminted id/date; the request log
    /// fills both at append time.
    pub fn new(
        uid: impl Into<String>,
        raw: &[u8],
        ip: impl Into<String>,
        port: u16,
        country: Option<String>,
        detail: InteractionDetail,
    ) -> Self {
        Self {
            id: 0,
            uid: uid.into(),
            date: 0,
            raw: base64::engine::general_purpose::STANDARD.encode(raw),
            ip: ip.into(),
            port,
            country,
            detail,
        }
    }

    /// Protocol tag, as serialised in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self.detail {
            InteractionDetail::Http { .. } => "http",
            InteractionDetail::Dns { .. } => "dns",
            InteractionDetail::Smtp { .. } => "smtp",
            InteractionDetail::Tcp { .. } => "tcp",
        }
    }
}

/// Truncate `data` to `cap` bytes. Returns the kept prefix and whether
/// anything was cut.
pub fn truncate_to_cap(data: &[u8], cap: usize) -> (&[u8], bool) {
    if data.len() > cap {
        (&data[..cap], true)
    } else {
        (data, false)
    }
}

/// Base64-encode a body for storage.
pub fn encode_body(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a stored base64 body.
pub fn decode_body(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}
