//! WebSocket wire protocol for the subscription bus.
//!
//! One JSON message per frame, tagged by `cmd`. A single connection may
//! hold several subdomain subscriptions, each authorised by its own token
//! in a `connect` message.

use serde::{Deserialize, Serialize};

use crate::interaction::Interaction;

/// Messages a dashboard client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to the subdomain this token authorises.
    Connect { token: String },
    /// Heartbeat; the server answers `pong`.
    Ping,
    /// Drop one subscription, or all when `subdomain` is absent.
    Disconnect {
        #[serde(default)]
        subdomain: Option<String>,
    },
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Subscription accepted.
    Connected { subdomain: String },
    /// A newly captured interaction on a subscribed subdomain.
    Request {
        subdomain: String,
        data: Box<Interaction>,
    },
    /// Bulk backlog sent when a subscription first succeeds.
    Requests {
        subdomain: String,
        data: Vec<Interaction>,
    },
    /// Mirror of a log deletion.
    Deleted { subdomain: String, data: DeletedId },
    /// Mirror of a log clear.
    Cleared { subdomain: String },
    Pong,
    Error { code: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedId {
    #[serde(rename = "_id")]
    pub id: u64,
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Subdomain this message concerns, when it concerns one.
    pub fn subdomain(&self) -> Option<&str> {
        match self {
            ServerMessage::Connected { subdomain }
            | ServerMessage::Request { subdomain, .. }
            | ServerMessage::Requests { subdomain, .. }
            | ServerMessage::Deleted { subdomain, .. }
            | ServerMessage::Cleared { subdomain } => Some(subdomain),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parse() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"cmd":"connect","token":"abc"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Connect { token } if token == "abc"));

        let m: ClientMessage = serde_json::from_str(r#"{"cmd":"ping"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Ping));

        let m: ClientMessage = serde_json::from_str(r#"{"cmd":"disconnect"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Disconnect { subdomain: None }));
    }

    #[test]
    fn test_server_message_wire_shape() {
        let m = ServerMessage::Cleared {
            subdomain: "abc123".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(v["cmd"], "cleared");
        assert_eq!(v["subdomain"], "abc123");

        let m = ServerMessage::Deleted {
            subdomain: "abc123".into(),
            data: DeletedId { id: 42 },
        };
        let v: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(v["cmd"], "deleted");
        assert_eq!(v["data"]["_id"], 42);
    }

    #[test]
    fn test_error_without_close_semantics() {
        let m = ServerMessage::error("invalid_token", "bad signature");
        assert!(m.subdomain().is_none());
        let v: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(v["cmd"], "error");
        assert_eq!(v["code"], "invalid_token");
    }
}
