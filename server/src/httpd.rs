//! HTTP capture listener and response resolver.
//!
//! A deliberately hand-rolled HTTP/1.1 front-end: every request to a
//! wildcard subdomain is parsed off the socket, normalised into an
//! interaction, answered from the subdomain's file tree, and appended to
//! the log strictly after the wire response. Parsing by hand is what lets
//! malformed requests be captured instead of rejected upstream.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::files::normalise_request_path;
use crate::state::AppState;
use trapline_shared::interaction::{encode_body, truncate_to_cap};
use trapline_shared::{Interaction, InteractionDetail};

const HEAD_TIMEOUT: Duration = Duration::from_secs(15);
const BODY_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Placeholder in stored bodies replaced with the captured request.
const REQUEST_PLACEHOLDER: &[u8] = b"{{request}}";

/// Virtual-hosting decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKind {
    /// The bare service domain (or its www alias): control-API territory.
    Bare,
    /// A capture subdomain.
    Subdomain(String),
    /// Anything else (IP literals, foreign hosts).
    Unknown,
}

/// Classify a Host header against the service domain. The subdomain is
/// the label immediately left of the service domain, so deeper names
/// (`foo.abc123.example`) still land on `abc123`.
pub fn classify_host(host: &str, service_domain: &str) -> HostKind {
    let host = host.trim().to_lowercase();
    let host = host.split(':').next().unwrap_or("").trim_end_matches('.');
    let domain = service_domain.to_lowercase();
    let domain = domain.trim_end_matches('.');

    if host == domain || host == format!("www.{domain}") {
        return HostKind::Bare;
    }
    if let Some(prefix) = host.strip_suffix(&format!(".{domain}")) {
        if let Some(label) = prefix.rsplit('.').next() {
            if !label.is_empty() {
                return HostKind::Subdomain(label.to_string());
            }
        }
    }
    HostKind::Unknown
}

struct ParsedRequest {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
    /// Raw head bytes as read off the wire.
    head: Vec<u8>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn wants_close(&self) -> bool {
        let conn = self.header("connection").unwrap_or("");
        conn.eq_ignore_ascii_case("close") || self.version.eq_ignore_ascii_case("HTTP/1.0")
    }

    fn is_upgrade(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
            || self
                .header("upgrade")
                .map(|u| !u.is_empty())
                .unwrap_or(false)
    }
}

/// Accept loop for one capture port.
pub async fn serve(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    state: AppState,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let acceptor = tls.map(TlsAcceptor::from);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("http accept failed: {e}");
                        continue;
                    }
                };
                let state = state.clone();
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let sni = tls_stream
                                    .get_ref()
                                    .1
                                    .server_name()
                                    .map(|s| s.to_string());
                                handle_connection(tls_stream, peer, sni, state, shutdown).await;
                            }
                            Err(e) => debug!("tls handshake with {peer} failed: {e}"),
                        },
                        None => handle_connection(stream, peer, None, state, shutdown).await,
                    }
                });
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    peer: std::net::SocketAddr,
    sni: Option<String>,
    state: AppState,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // SNI names a subdomain even when the request never parses.
    let sni_hint = sni.and_then(|name| match classify_host(&name, &state.cfg.service_domain) {
        HostKind::Subdomain(sub) => Some(sub),
        _ => None,
    });

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let parsed = match timeout(HEAD_TIMEOUT, read_head(&mut reader)).await {
            Ok(Ok(Some(parsed))) => parsed,
            Ok(Ok(None)) => break, // clean EOF between requests
            Ok(Err(HeadError::Malformed(raw))) => {
                record_malformed(&state, &sni_hint, &raw, peer).await;
                let _ = write_simple(&mut write_half, 400, "Bad Request", "bad request\n").await;
                break;
            }
            Ok(Err(HeadError::Io(_))) | Err(_) => break,
        };

        let host_kind = match parsed.header("host") {
            Some(host) => classify_host(host, &state.cfg.service_domain),
            None => sni_hint
                .clone()
                .map(HostKind::Subdomain)
                .unwrap_or(HostKind::Unknown),
        };

        let body = match timeout(BODY_TIMEOUT, read_body(&mut reader, &parsed, &state)).await {
            Ok(Ok(body)) => body,
            _ => break,
        };

        let mut close = parsed.wants_close() || parsed.is_upgrade() || body.unaligned;

        match host_kind {
            HostKind::Subdomain(sub) => {
                let live = state.sessions.exists(&sub).await.unwrap_or(false);
                if !live {
                    close = true;
                    let _ =
                        write_simple(&mut write_half, 404, "Not Found", "not found\n").await;
                } else if parsed.is_upgrade() {
                    // Captured, then refused: capture subdomains speak
                    // plain request/response only.
                    let _ = write_simple(
                        &mut write_half,
                        501,
                        "Not Implemented",
                        "upgrade not supported\n",
                    )
                    .await;
                    record_http(&state, &sub, &parsed, &body, peer).await;
                } else {
                    let raw = render_raw(&parsed, &body.data);
                    let response = resolve_response(&state, &sub, &parsed, &raw).await;
                    let _ = write_response(&mut write_half, &response, close).await;
                    record_http(&state, &sub, &parsed, &body, peer).await;
                }
            }
            // Capture listeners never host the control API; an upstream
            // proxy routes the bare domain to the API port.
            HostKind::Bare | HostKind::Unknown => {
                close = true;
                let _ = write_simple(
                    &mut write_half,
                    421,
                    "Misdirected Request",
                    "this listener captures subdomain traffic only\n",
                )
                .await;
            }
        }

        if close {
            break;
        }
    }
}

enum HeadError {
    /// Bytes read so far did not form a request head.
    Malformed(Vec<u8>),
    Io(std::io::Error),
}

/// Read and parse one request head. `Ok(None)` is a clean EOF before any
/// bytes arrived.
async fn read_head<R>(reader: &mut R) -> std::result::Result<Option<ParsedRequest>, HeadError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut head = Vec::new();
    let mut lines: Vec<String> = Vec::new();

    loop {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(HeadError::Io)?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(HeadError::Malformed(head));
        }
        head.extend_from_slice(&line);
        if head.len() > MAX_HEAD_BYTES {
            return Err(HeadError::Malformed(head));
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if lines.is_empty() {
                // tolerate leading blank lines
                head.clear();
                continue;
            }
            break;
        }
        lines.push(trimmed.to_string());
    }

    let mut parts = lines[0].split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v))
            if v.starts_with("HTTP/") && m.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            (m.to_string(), t.to_string(), v.to_string())
        }
        _ => return Err(HeadError::Malformed(head)),
    };

    let mut headers = Vec::new();
    for line in &lines[1..] {
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()))
            }
            None => return Err(HeadError::Malformed(head)),
        }
    }

    Ok(Some(ParsedRequest {
        method,
        target,
        version,
        headers,
        head,
    }))
}

struct CapturedBody {
    data: Vec<u8>,
    truncated: bool,
    /// True when the stream position no longer lines up with the next
    /// request (chunked or oversized drain failure): no keep-alive.
    unaligned: bool,
}

async fn read_body<R>(
    reader: &mut R,
    parsed: &ParsedRequest,
    state: &AppState,
) -> std::io::Result<CapturedBody>
where
    R: AsyncRead + Unpin,
{
    let cap = state.cfg.body_cap_bytes;

    let chunked = parsed
        .header("transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        // Chunked bodies are captured as raw bytes until the cap; no
        // attempt to realign for keep-alive. The buffer grows with the
        // body rather than being preallocated at the cap.
        let mut data = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let room = cap - data.len();
            data.extend_from_slice(&buf[..n.min(room)]);
            if n >= room {
                break;
            }
        }
        return Ok(CapturedBody {
            truncated: data.len() == cap,
            data,
            unaligned: true,
        });
    }

    let content_length: usize = parsed
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length == 0 {
        return Ok(CapturedBody {
            data: Vec::new(),
            truncated: false,
            unaligned: false,
        });
    }

    let keep = content_length.min(cap);
    let mut data = vec![0u8; keep];
    reader.read_exact(&mut data).await?;

    // Bytes beyond the cap are counted off the wire but never stored.
    let mut remaining = (content_length - keep) as u64;
    if remaining > 0 {
        let drained = tokio::io::copy(&mut reader.take(remaining), &mut tokio::io::sink()).await?;
        remaining -= drained.min(remaining);
    }

    Ok(CapturedBody {
        data,
        truncated: content_length > cap,
        unaligned: remaining > 0,
    })
}

struct ResolvedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Look the request up in the subdomain's file tree. The store snapshot
/// at resolution time wins; concurrent writers race benignly.
async fn resolve_response(
    state: &AppState,
    sub: &str,
    parsed: &ParsedRequest,
    raw: &[u8],
) -> ResolvedResponse {
    let tree = state.files.get(sub).await.unwrap_or_default();

    let entry = normalise_request_path(&parsed.target)
        .and_then(|path| tree.files.get(&path).cloned());

    let Some(entry) = entry else {
        return ResolvedResponse {
            status: 404,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: b"not found\n".to_vec(),
        };
    };

    let mut body = trapline_shared::interaction::decode_body(&entry.raw).unwrap_or_default();
    body = substitute_request(&body, raw);

    let mut headers: Vec<(String, String)> = entry
        .headers
        .iter()
        .map(|h| (h.header.clone(), h.value.clone()))
        .collect();
    if !headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
    {
        let path = normalise_request_path(&parsed.target).unwrap_or_default();
        headers.push((
            "Content-Type".to_string(),
            content_type_for(&path).to_string(),
        ));
    }

    ResolvedResponse {
        status: entry.status_code,
        headers,
        body,
    }
}

/// Replace `{{request}}` in a stored body with the captured raw request.
fn substitute_request(body: &[u8], raw: &[u8]) -> Vec<u8> {
    let Some(pos) = body
        .windows(REQUEST_PLACEHOLDER.len())
        .position(|w| w == REQUEST_PLACEHOLDER)
    else {
        return body.to_vec();
    };
    let mut out = Vec::with_capacity(body.len() + raw.len());
    out.extend_from_slice(&body[..pos]);
    out.extend_from_slice(raw);
    out.extend_from_slice(&body[pos + REQUEST_PLACEHOLDER.len()..]);
    out
}

/// Content type by file extension when the entry names none.
fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "" => "text/html",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "json" => "application/json",
        "js" => "application/javascript",
        "css" => "text/css",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn render_raw(parsed: &ParsedRequest, body: &[u8]) -> Vec<u8> {
    let mut raw = parsed.head.clone();
    raw.extend_from_slice(body);
    raw
}

async fn record_http(
    state: &AppState,
    sub: &str,
    parsed: &ParsedRequest,
    body: &CapturedBody,
    peer: std::net::SocketAddr,
) {
    let ip = peer.ip().to_string();
    let raw = render_raw(parsed, &body.data);
    let (raw_capped, _) = truncate_to_cap(&raw, state.cfg.body_cap_bytes);
    let interaction = Interaction::new(
        sub,
        raw_capped,
        ip.clone(),
        peer.port(),
        state.country_for(&ip),
        InteractionDetail::Http {
            method: parsed.method.clone(),
            path: parsed.target.clone(),
            protocol: parsed.version.clone(),
            headers: parsed.headers.clone(),
            body: encode_body(&body.data),
            truncated: body.truncated,
        },
    );
    state.record(interaction).await;
}

/// Malformed requests still become interactions when the connection can
/// be attributed (SNI on TLS listeners).
async fn record_malformed(
    state: &AppState,
    sni_hint: &Option<String>,
    raw: &[u8],
    peer: std::net::SocketAddr,
) {
    let Some(sub) = sni_hint else { return };
    if !state.sessions.exists(sub).await.unwrap_or(false) {
        return;
    }
    let ip = peer.ip().to_string();
    let (raw_capped, truncated) = truncate_to_cap(raw, state.cfg.body_cap_bytes);
    let interaction = Interaction::new(
        sub,
        raw_capped,
        ip.clone(),
        peer.port(),
        state.country_for(&ip),
        InteractionDetail::Http {
            method: String::new(),
            path: String::new(),
            protocol: String::new(),
            headers: Vec::new(),
            body: encode_body(raw_capped),
            truncated,
        },
    );
    state.record(interaction).await;
}

async fn write_response<W>(
    writer: &mut W,
    response: &ResolvedResponse,
    close: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = reason_phrase(response.status);
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, reason).into_bytes();
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    out.extend_from_slice(if close {
        b"Connection: close\r\n"
    } else {
        b"Connection: keep-alive\r\n"
    });
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    writer.write_all(&out).await?;
    writer.flush().await
}

async fn write_simple<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let out = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        421 => "Misdirected Request",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::MemoryStore;
    use std::sync::Arc as StdArc;

    fn test_state() -> AppState {
        let mut cfg = Config::default();
        cfg.signing.active = "k".into();
        cfg.signing.keys.insert("k".into(), "secret".into());
        AppState::new(cfg, StdArc::new(MemoryStore::new(64))).unwrap()
    }

    #[test]
    fn test_classify_host() {
        let d = "trapline.test";
        assert_eq!(classify_host("trapline.test", d), HostKind::Bare);
        assert_eq!(classify_host("www.trapline.test", d), HostKind::Bare);
        assert_eq!(classify_host("TRAPLINE.TEST:8080", d), HostKind::Bare);
        assert_eq!(
            classify_host("abc123.trapline.test", d),
            HostKind::Subdomain("abc123".into())
        );
        assert_eq!(
            classify_host("foo.abc123.trapline.test", d),
            HostKind::Subdomain("abc123".into())
        );
        assert_eq!(
            classify_host("abc123.trapline.test.", d),
            HostKind::Subdomain("abc123".into())
        );
        assert_eq!(classify_host("10.0.0.1", d), HostKind::Unknown);
        assert_eq!(classify_host("evil.example.org", d), HostKind::Unknown);
    }

    #[tokio::test]
    async fn test_read_head_parses_request() {
        let input = b"GET /x?y=1 HTTP/1.1\r\nHost: abc123.trapline.test\r\nX-Test: 1\r\n\r\n";
        let mut reader = BufReader::new(&input[..]);
        let parsed = read_head(&mut reader).await.ok().flatten().unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.target, "/x?y=1");
        assert_eq!(parsed.version, "HTTP/1.1");
        assert_eq!(parsed.header("host"), Some("abc123.trapline.test"));
        assert_eq!(parsed.header("HOST"), Some("abc123.trapline.test"));
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(&parsed.head[..], &input[..]);
    }

    #[tokio::test]
    async fn test_read_head_malformed() {
        let input = b"NOT A REQUEST\r\n\r\n";
        let mut reader = BufReader::new(&input[..]);
        match read_head(&mut reader).await {
            Err(HeadError::Malformed(raw)) => assert!(!raw.is_empty()),
            _ => panic!("expected malformed"),
        }
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let input = b"";
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(read_head(&mut reader).await, Ok(None)));
    }

    #[tokio::test]
    async fn test_read_body_respects_cap() {
        let mut state = test_state();
        let cfg = StdArc::make_mut(&mut state.cfg);
        cfg.body_cap_bytes = 4;

        let parsed = ParsedRequest {
            method: "POST".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Content-Length".into(), "10".into())],
            head: Vec::new(),
        };
        let input = b"0123456789";
        let mut reader = BufReader::new(&input[..]);
        let body = read_body(&mut reader, &parsed, &state).await.unwrap();
        assert_eq!(body.data, b"0123");
        assert!(body.truncated);
        assert!(!body.unaligned);
    }

    #[tokio::test]
    async fn test_read_body_chunked_grows_with_input() {
        let state = test_state();
        let parsed = ParsedRequest {
            method: "POST".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Transfer-Encoding".into(), "chunked".into())],
            head: Vec::new(),
        };
        let input = b"abc";
        let mut reader = BufReader::new(&input[..]);
        let body = read_body(&mut reader, &parsed, &state).await.unwrap();
        assert_eq!(body.data, b"abc");
        assert!(!body.truncated);
        assert!(body.unaligned, "chunked streams never keep-alive");
    }

    #[tokio::test]
    async fn test_read_body_chunked_respects_cap() {
        let mut state = test_state();
        let cfg = StdArc::make_mut(&mut state.cfg);
        cfg.body_cap_bytes = 4;

        let parsed = ParsedRequest {
            method: "POST".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Transfer-Encoding".into(), "chunked".into())],
            head: Vec::new(),
        };
        let input = b"0123456789";
        let mut reader = BufReader::new(&input[..]);
        let body = read_body(&mut reader, &parsed, &state).await.unwrap();
        assert_eq!(body.data, b"0123");
        assert!(body.truncated);
    }

    #[test]
    fn test_substitute_request() {
        let body = b"<pre>{{request}}</pre>";
        let out = substitute_request(body, b"GET / HTTP/1.1");
        assert_eq!(out, b"<pre>GET / HTTP/1.1</pre>");

        let untouched = substitute_request(b"plain", b"raw");
        assert_eq!(untouched, b"plain");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(""), "text/html");
        assert_eq!(content_type_for("x.json"), "application/json");
        assert_eq!(content_type_for("a/b.png"), "image/png");
        assert_eq!(content_type_for("weird.zzz"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_resolve_response_tree_hit_and_miss() {
        use crate::files::{FileEntry, FileTree, HeaderSpec};
        let state = test_state();
        let mut tree = FileTree::default();
        tree.files.insert(
            "hello.txt".into(),
            FileEntry {
                raw: encode_body(b"hi there"),
                status_code: 200,
                headers: vec![HeaderSpec {
                    header: "X-Custom".into(),
                    value: "1".into(),
                }],
            },
        );
        state.files.put("abc123", &tree).await.unwrap();

        let parsed = ParsedRequest {
            method: "GET".into(),
            target: "/hello.txt".into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
            head: Vec::new(),
        };
        let resp = resolve_response(&state, "abc123", &parsed, b"raw").await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hi there");
        // content-type defaulted by extension since the entry named none
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "text/plain"));
        assert!(resp.headers.iter().any(|(k, _)| k == "X-Custom"));

        let parsed = ParsedRequest {
            target: "/missing".into(),
            ..parsed
        };
        let resp = resolve_response(&state, "abc123", &parsed, b"raw").await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn test_capture_records_interaction() {
        let state = test_state();
        state.sessions.create(Some("abc123")).await.unwrap();

        let parsed = ParsedRequest {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), "abc123.trapline.test".into())],
            head: b"GET / HTTP/1.1\r\nHost: abc123.trapline.test\r\n\r\n".to_vec(),
        };
        let body = CapturedBody {
            data: Vec::new(),
            truncated: false,
            unaligned: false,
        };
        let peer = "9.9.9.9:40000".parse().unwrap();
        record_http(&state, "abc123", &parsed, &body, peer).await;

        let page = state.log.list("abc123", 10, 0).await.unwrap();
        assert_eq!(page.items.len(), 1);
        let i = &page.items[0];
        assert_eq!(i.kind(), "http");
        match &i.detail {
            InteractionDetail::Http { method, path, headers, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/");
                assert_eq!(headers[0].1, "abc123.trapline.test");
            }
            _ => panic!("wrong variant"),
        }
    }
}
