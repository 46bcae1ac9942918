//! SMTP capture.
//!
//! Speaks the minimal server side of RFC 5321: banner, HELO/EHLO, MAIL,
//! RCPT, DATA up to the dot terminator, QUIT. The recipient domains name
//! the owning subdomains; each completed message becomes one interaction
//! per recipient subdomain, and a session that dies mid-way is flushed
//! as a single interaction on disconnect.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::state::AppState;
use trapline_shared::interaction::truncate_to_cap;
use trapline_shared::{Interaction, InteractionDetail};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_LINE: usize = 8 * 1024;

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
                        warn!("smtp accept failed: {e}");
                        continue;
                    }
                };
                let state = state.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_session(stream, peer, state).await {
                        debug!("smtp session with {peer} ended: {e}");
                    }
                });
            }
        }
    }
}

struct Session {
    /// Transcript of the message in progress (commands + data).
    transcript: String,
    /// Subdomains named by RCPT TO in the current envelope.
    rcpt_subdomains: Vec<String>,
    /// Anything captured since the last flush?
    dirty: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            transcript: String::new(),
            rcpt_subdomains: Vec::new(),
            dirty: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.transcript.push_str(line);
        self.transcript.push('\n');
        self.dirty = true;
    }

    fn reset(&mut self) {
        self.transcript.clear();
        self.rcpt_subdomains.clear();
        self.dirty = false;
    }
}

async fn handle_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> std::io::Result<()> {
    let banner = format!("220 {} ESMTP trapline\r\n", state.cfg.service_domain);
    stream.write_all(banner.as_bytes()).await?;

    let (read_half, mut writer) = stream.split();
    let mut reader = BufReader::new(read_half);

    let mut session = Session::new();
    let mut data_mode = false;

    loop {
        let mut line = String::new();
        let n = match timeout(IDLE_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                flush_session(&state, &session, peer).await;
                return Err(e);
            }
            Err(_) => {
                flush_session(&state, &session, peer).await;
                return Ok(());
            }
        };
        if n == 0 {
            flush_session(&state, &session, peer).await;
            return Ok(());
        }
        if line.len() > MAX_LINE {
            writer.write_all(b"500 Line too long\r\n").await?;
            continue;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if data_mode {
            if trimmed == "." {
                data_mode = false;
                record_message(&state, &mut session, peer).await;
                writer.write_all(b"250 OK: Message received\r\n").await?;
            } else {
                session.push_line(trimmed);
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        session.push_line(trimmed);

        let command = trimmed
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();
        match command.as_str() {
            "HELO" | "EHLO" => {
                writer.write_all(b"250-trapline\r\n250-SIZE 10485760\r\n250 HELP\r\n").await?;
            }
            "MAIL" => {
                session.rcpt_subdomains.clear();
                writer.write_all(b"250 OK\r\n").await?;
            }
            "RCPT" => {
                if let Some(sub) = rcpt_subdomain(trimmed, &state.cfg.service_domain) {
                    if !session.rcpt_subdomains.contains(&sub) {
                        session.rcpt_subdomains.push(sub);
                    }
                }
                writer.write_all(b"250 OK\r\n").await?;
            }
            "DATA" => {
                writer
                    .write_all(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n")
                    .await?;
                data_mode = true;
            }
            "QUIT" => {
                writer.write_all(b"221 Bye\r\n").await?;
                flush_session(&state, &session, peer).await;
                return Ok(());
            }
            "RSET" => {
                session.reset();
                writer.write_all(b"250 OK\r\n").await?;
            }
            "NOOP" => {
                writer.write_all(b"250 OK\r\n").await?;
            }
            _ => {
                writer.write_all(b"500 Command not recognized\r\n").await?;
            }
        }
    }
}

/// Pull the subdomain out of `RCPT TO:<user@sub.domain>`.
fn rcpt_subdomain(line: &str, service_domain: &str) -> Option<String> {
    let lower = line.to_lowercase();
    let rest = lower.strip_prefix("rcpt")?.trim_start();
    let rest = rest.strip_prefix("to:")?.trim();
    let addr = rest.trim_start_matches('<').trim_end_matches('>');
    let (_, mail_domain) = addr.split_once('@')?;

    let domain = service_domain.to_lowercase();
    let mail_domain = mail_domain.trim_end_matches('.');
    let prefix = mail_domain.strip_suffix(&format!(".{domain}"))?;
    let sub = prefix.rsplit('.').next()?;
    (!sub.is_empty()).then(|| sub.to_string())
}

/// One interaction per recipient subdomain for a completed message.
async fn record_message(state: &AppState, session: &mut Session, peer: SocketAddr) {
    let subdomains = std::mem::take(&mut session.rcpt_subdomains);
    for sub in &subdomains {
        record_for(state, sub, &session.transcript, peer).await;
    }
    if subdomains.is_empty() {
        debug!("smtp message from {peer} had no recipient subdomain, dropped");
    }
    session.transcript.clear();
    session.dirty = false;
}

/// Flush a trailing partial session (disconnect without terminator).
async fn flush_session(state: &AppState, session: &Session, peer: SocketAddr) {
    if !session.dirty || session.transcript.is_empty() {
        return;
    }
    for sub in &session.rcpt_subdomains {
        record_for(state, sub, &session.transcript, peer).await;
    }
}

async fn record_for(state: &AppState, sub: &str, frame: &str, peer: SocketAddr) {
    if !state.sessions.exists(sub).await.unwrap_or(false) {
        debug!("smtp capture for dead subdomain '{sub}' dropped");
        return;
    }
    let ip = peer.ip().to_string();
    let (frame_capped, _) = truncate_to_cap(frame.as_bytes(), state.cfg.body_cap_bytes);
    let interaction = Interaction::new(
        sub,
        frame_capped,
        ip.clone(),
        peer.port(),
        state.country_for(&ip),
        InteractionDetail::Smtp {
            frame: String::from_utf8_lossy(frame_capped).into_owned(),
        },
    );
    state.record(interaction).await;
}
