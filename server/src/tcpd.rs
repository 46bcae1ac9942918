//! Raw TCP capture.
//!
//! Passive listeners on the configured ports: whatever arrives is read
//! up to the cap, and the connection becomes one interaction when it
//! closes or goes idle. Nothing is ever written back. A raw stream
//! names no subdomain, so attribution sniffs a TLS ClientHello SNI or
//! an HTTP Host line out of the captured bytes.

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::httpd::{classify_host, HostKind};
use crate::state::AppState;
use crate::tls::extract_sni;
use trapline_shared::interaction::{encode_body, truncate_to_cap};
use trapline_shared::{Interaction, InteractionDetail};

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("tcp capture accept failed: {e}");
                        continue;
                    }
                };
                let state = state.clone();
                tracker.spawn(async move {
                    handle_stream(stream, peer, state).await;
                });
            }
        }
    }
}

async fn handle_stream(mut stream: TcpStream, peer: SocketAddr, state: AppState) {
    let cap = state.cfg.body_cap_bytes;
    let mut data = Vec::new();
    let mut truncated = false;

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match timeout(IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break, // closed or idle
            // past the cap the socket keeps draining, nothing more is stored
            Ok(Ok(n)) => {
                let room = cap.saturating_sub(data.len());
                if n > room {
                    truncated = true;
                }
                data.extend_from_slice(&buf[..n.min(room)]);
            }
            Ok(Err(e)) => {
                debug!("tcp capture read from {peer} failed: {e}");
                break;
            }
        }
    }

    let Some(sub) = attribute(&data, &state.cfg.service_domain) else {
        debug!("unattributable tcp stream from {peer} ({} bytes), dropped", data.len());
        return;
    };
    if !state.sessions.exists(&sub).await.unwrap_or(false) {
        debug!("tcp capture for dead subdomain '{sub}' dropped");
        return;
    }

    let ip = peer.ip().to_string();
    let (raw_capped, _) = truncate_to_cap(&data, cap);
    let interaction = Interaction::new(
        &sub,
        raw_capped,
        ip.clone(),
        peer.port(),
        state.country_for(&ip),
        InteractionDetail::Tcp {
            data: encode_body(&data),
            truncated,
        },
    );
    state.record(interaction).await;
}

/// Best-effort subdomain attribution from the captured bytes.
fn attribute(data: &[u8], service_domain: &str) -> Option<String> {
    if let Some(sni) = extract_sni(data) {
        if let HostKind::Subdomain(sub) = classify_host(&sni, service_domain) {
            return Some(sub);
        }
    }
    if let Some(host) = sniff_http_host(data) {
        if let HostKind::Subdomain(sub) = classify_host(&host, service_domain) {
            return Some(sub);
        }
    }
    None
}

/// Find a `Host:` header in what might be plaintext HTTP.
fn sniff_http_host(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(&data[..data.len().min(8 * 1024)]).ok()?;
    for line in text.lines().take(64) {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        if name.trim().eq_ignore_ascii_case("host") {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_http_host() {
        let req = b"GET / HTTP/1.1\r\nHost: abc123.trapline.test\r\nAccept: */*\r\n\r\n";
        assert_eq!(
            sniff_http_host(req).as_deref(),
            Some("abc123.trapline.test")
        );
        assert_eq!(sniff_http_host(b"\x00\x01\xff binary"), None);
        assert_eq!(sniff_http_host(b"no host here\r\n"), None);
    }

    #[test]
    fn test_attribute_prefers_sni_then_host() {
        let d = "trapline.test";
        let http = b"POST /x HTTP/1.1\r\nhost: abc123.trapline.test\r\n\r\n";
        assert_eq!(attribute(http, d).as_deref(), Some("abc123"));

        let foreign = b"GET / HTTP/1.1\r\nHost: other.example\r\n\r\n";
        assert_eq!(attribute(foreign, d), None);

        assert_eq!(attribute(b"raw bytes, nothing useful", d), None);
    }
}
