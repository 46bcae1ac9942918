//! Subscription bus: the WebSocket side of the control API.
//!
//! A connection holds up to `max_subscriptions_per_conn` subdomain
//! memberships, each authorised by its own token in a `connect` frame.
//! Delivery rides the storage publish channel; a connection that cannot
//! keep up observes the broadcast lag as dropped-oldest messages and
//! stays open. 90 seconds of silence closes the connection with 1001.

use std::collections::HashSet;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::state::AppState;
use trapline_shared::protocol::{ClientMessage, ServerMessage};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
const HEARTBEAT_CHECK: Duration = Duration::from_secs(15);
/// Backlog size pushed when a subscription first succeeds.
const BULK_RECENT: usize = 100;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    state.metrics.subscriber_connected();
    run_connection(socket, &state).await;
    state.metrics.subscriber_disconnected();
}

async fn run_connection(socket: WebSocket, state: &AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.store.events();
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut last_activity = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_CHECK);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if handle_client_frame(&text, state, &mut subscribed, &mut sender)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        last_activity = Instant::now();
                    }
                    Some(Err(e)) => {
                        debug!("ws receive error: {e}");
                        break;
                    }
                }
            }
            ev = events.recv() => {
                match ev {
                    Ok(ev) => {
                        let concerned = ev
                            .topic
                            .strip_prefix("req:")
                            .map(|sub| subscribed.contains(sub))
                            .unwrap_or(false);
                        if concerned {
                            let text = String::from_utf8_lossy(&ev.payload).into_owned();
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // drop-oldest policy: count it, stay connected
                        state.metrics.ws_dropped(n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > HEARTBEAT_TIMEOUT {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;

/// Process one client frame. `Err(())` means the socket is gone.
async fn handle_client_frame(
    text: &str,
    state: &AppState,
    subscribed: &mut HashSet<String>,
    sender: &mut WsSender,
) -> std::result::Result<(), ()> {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => {
            // a malformed frame is answered, never fatal
            return send(sender, &ServerMessage::error("bad_message", "unparseable frame")).await;
        }
    };

    match parsed {
        ClientMessage::Connect { token } => {
            let sub = match state.tokens.verify(&token) {
                Ok(sub) => sub,
                Err(e) => {
                    return send(sender, &ServerMessage::error(e.code(), e.to_string())).await;
                }
            };
            // a token whose subdomain state has expired is as good as no token
            if !state.sessions.exists(&sub).await.unwrap_or(false) {
                return send(
                    sender,
                    &ServerMessage::error("invalid_token", "subdomain no longer exists"),
                )
                .await;
            }
            if !subscribed.contains(&sub)
                && subscribed.len() >= state.cfg.max_subscriptions_per_conn
            {
                return send(
                    sender,
                    &ServerMessage::error("subscription_limit", "too many subscriptions"),
                )
                .await;
            }

            subscribed.insert(sub.clone());
            send(
                sender,
                &ServerMessage::Connected {
                    subdomain: sub.clone(),
                },
            )
            .await?;

            // backlog so the dashboard renders without a separate fetch
            match state.log.recent(&sub, BULK_RECENT).await {
                Ok(items) if !items.is_empty() => {
                    send(
                        sender,
                        &ServerMessage::Requests {
                            subdomain: sub,
                            data: items,
                        },
                    )
                    .await
                }
                _ => Ok(()),
            }
        }
        ClientMessage::Ping => send(sender, &ServerMessage::Pong).await,
        ClientMessage::Disconnect { subdomain } => {
            match subdomain {
                Some(sub) => {
                    subscribed.remove(&sub);
                }
                None => subscribed.clear(),
            }
            Ok(())
        }
    }
}

async fn send(sender: &mut WsSender, msg: &ServerMessage) -> std::result::Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
