//! Control API.
//!
//! The JSON surface the dashboard talks to: sessions, DNS records, the
//! response file tree, the request log, share tokens, and the WebSocket
//! subscription bus. Tokens arrive as `?token=` or `Authorization:
//! Bearer`; errors are `{code, message}` with a matching status.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::files::FileTree;
use crate::state::AppState;
use crate::token;
use crate::ws::ws_handler;
use crate::zone::DnsRecord;
use trapline_shared::{Error, Result};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v2/sessions", post(create_session))
        .route("/api/v2/dns", get(get_dns).put(put_dns))
        .route("/api/v2/files", get(get_files).put(put_files))
        .route("/api/v2/files/*path", get(get_file).delete(delete_file))
        .route(
            "/api/v2/requests",
            get(list_requests).delete(delete_all_requests),
        )
        .route(
            "/api/v2/requests/:id",
            get(get_request).delete(delete_request),
        )
        .route("/api/v2/requests/:id/share", post(share_request))
        .route("/api/v2/requests/shared/:token", get(get_shared_request))
        .route("/api/v2/ws", get(ws_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the control API until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = build_router(state);
    info!("control API listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}

// ---------------------------------------------------------------------------
// Error plumbing

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        if let Error::RateLimited { retry_after } = &self.0 {
            body["retry_after"] = json!(retry_after.max(&1));
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Auth helpers

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Verify the session token and confirm the subdomain is still alive.
async fn authorize(state: &AppState, query: &TokenQuery, headers: &HeaderMap) -> Result<String> {
    let token = query
        .token
        .clone()
        .or_else(|| bearer_token(headers))
        .ok_or(Error::InvalidToken)?;
    let sub = state.tokens.verify(&token)?;
    if !state.sessions.exists(&sub).await? {
        return Err(Error::InvalidToken);
    }
    Ok(sub)
}

// ---------------------------------------------------------------------------
// Sessions

#[derive(Debug, Deserialize, Default)]
struct CreateSessionRequest {
    admin_token: Option<String>,
    subdomain: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    subdomain: String,
    token: String,
}

async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    cookies: CookieJar,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<Response> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    check_session_rate_limit(&state, &addr.ip().to_string()).await?;

    // body takes precedence over a previously set cookie
    let provided = body
        .admin_token
        .clone()
        .or_else(|| cookies.get("admin_token").map(|c| c.value().to_string()));
    token::check_admin_gate(&state.cfg, provided.as_deref())?;

    // only the admin gate may pick its own label
    let requested = match (&state.cfg.admin_token, &body.subdomain) {
        (Some(_), Some(label)) => Some(label.as_str()),
        _ => None,
    };

    let subdomain = state.sessions.create(requested).await?;
    let token = state.tokens.issue(&subdomain)?;
    state.files.seed_default(&subdomain).await?;
    state.metrics.session_created();

    let mut response = (
        StatusCode::CREATED,
        Json(SessionResponse {
            subdomain,
            token,
        }),
    )
        .into_response();

    // first-time body auth persists the admin secret for the browser
    if let (Some(secret), Some(_)) = (&body.admin_token, &state.cfg.admin_token) {
        if let Ok(cookie) = HeaderValue::from_str(&admin_cookie(&state, secret)) {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
    }
    Ok(response)
}

fn admin_cookie(state: &AppState, secret: &str) -> String {
    let secure = if state.cfg.tls.is_some() { "; Secure" } else { "" };
    format!(
        "admin_token={secret}; Path=/api/; Domain={}; HttpOnly; SameSite=Strict; Max-Age=2592000{secure}",
        state.cfg.service_domain
    )
}

/// Sliding-window counter per client IP, stored as "count:window_start".
async fn check_session_rate_limit(state: &AppState, ip: &str) -> Result<()> {
    let limit = state.cfg.session_rate_limit;
    if limit == 0 {
        return Ok(());
    }
    let window = state.cfg.session_rate_window_secs as i64;
    let now = chrono::Utc::now().timestamp();
    let key = format!("ratelimit:session:{ip}");

    let (count, window_start) = match state.store.kv_get(&key).await? {
        Some(raw) => {
            let text = String::from_utf8_lossy(&raw).into_owned();
            match text.split_once(':') {
                Some((c, t)) => (
                    c.parse::<u32>().unwrap_or(0),
                    t.parse::<i64>().unwrap_or(now),
                ),
                None => (0, now),
            }
        }
        None => (0, now),
    };

    let (count, window_start) = if now - window_start >= window {
        (1, now)
    } else {
        (count + 1, window_start)
    };

    if count > limit {
        return Err(Error::RateLimited {
            retry_after: window_start + window - now,
        });
    }

    state
        .store
        .kv_set(
            &key,
            format!("{count}:{window_start}").as_bytes(),
            std::time::Duration::from_secs(window as u64),
        )
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// DNS

#[derive(Debug, Serialize, Deserialize)]
struct DnsRecords {
    records: Vec<DnsRecord>,
}

async fn get_dns(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<DnsRecords>> {
    let sub = authorize(&state, &query, &headers).await?;
    let records = state.zone.get(&sub).await?;
    Ok(Json(DnsRecords { records }))
}

async fn put_dns(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<DnsRecords>,
) -> ApiResult<Json<DnsRecords>> {
    let sub = authorize(&state, &query, &headers).await?;
    state.zone.put(&sub, &body.records).await?;
    state.sessions.touch(&sub).await;
    Ok(Json(body))
}

// ---------------------------------------------------------------------------
// Files

async fn get_files(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<FileTree>> {
    let sub = authorize(&state, &query, &headers).await?;
    Ok(Json(state.files.get(&sub).await?))
}

async fn put_files(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(tree): Json<FileTree>,
) -> ApiResult<Json<serde_json::Value>> {
    let sub = authorize(&state, &query, &headers).await?;
    state.files.put(&sub, &tree).await?;
    state.sessions.touch(&sub).await;
    Ok(Json(json!({ "message": "files updated" })))
}

async fn get_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let sub = authorize(&state, &query, &headers).await?;
    let tree = state.files.get(&sub).await?;
    match tree.files.get(&path) {
        Some(entry) => Ok(Json(entry.clone()).into_response()),
        None => Err(Error::NotFound.into()),
    }
}

async fn delete_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let sub = authorize(&state, &query, &headers).await?;
    state.files.delete_path(&sub, &path).await?;
    state.sessions.touch(&sub).await;
    Ok(Json(json!({ "message": "file deleted" })))
}

// ---------------------------------------------------------------------------
// Requests

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let sub = authorize(&state, &query, &headers).await?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let page = state.log.list(&sub, limit, offset).await?;
    Ok(Json(json!({
        "requests": page.items,
        "pagination": {
            "total": page.total,
            "limit": limit,
            "offset": offset,
            "has_more": page.has_more,
        }
    })))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<trapline_shared::Interaction>> {
    let sub = authorize(&state, &query, &headers).await?;
    Ok(Json(state.log.get(&sub, id).await?))
}

async fn delete_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let sub = authorize(&state, &query, &headers).await?;
    state.log.delete(&sub, id).await?;
    Ok(Json(json!({ "message": "request deleted" })))
}

async fn delete_all_requests(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let sub = authorize(&state, &query, &headers).await?;
    state.log.delete_all(&sub).await?;
    Ok(Json(json!({ "message": "all requests deleted" })))
}

#[derive(Debug, Serialize)]
struct ShareResponse {
    share_token: String,
}

async fn share_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<ShareResponse>)> {
    let sub = authorize(&state, &query, &headers).await?;
    let share_token = state.log.share(&sub, id).await?;
    Ok((StatusCode::CREATED, Json(ShareResponse { share_token })))
}

/// Share tokens need no session token: one interaction, read-only.
async fn get_shared_request(
    State(state): State<AppState>,
    Path(share_token): Path<String>,
) -> ApiResult<Json<trapline_shared::Interaction>> {
    Ok(Json(state.log.get_shared(&share_token).await?))
}

// ---------------------------------------------------------------------------
// Ambient endpoints

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let storage_ok = state.store.ping().await.is_ok();
    Json(json!({
        "status": if storage_ok { "ok" } else { "degraded" },
        "active_subscribers": state.metrics.active_subscribers(),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain")],
        state.metrics.to_prometheus(),
    )
}
