//! Trapline server: multi-protocol interaction capture.
//!
//! One process, five listener groups: the control API, wildcard HTTP
//! capture, DNS (UDP+TCP), SMTP, and raw TCP capture. Everything funnels
//! into the per-subdomain request log and out through the subscription
//! bus.

use std::net::SocketAddr;

use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

mod api;
mod config;
mod dns;
mod files;
mod geoip;
mod httpd;
mod log;
mod metrics;
mod session;
mod smtp;
mod state;
mod storage;
mod tcpd;
mod tls;
mod token;
mod ws;
mod zone;

use config::Config;
use state::AppState;
use trapline_shared::Error;

/// Budget for draining in-flight captures on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trapline_server=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("{e}");
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(e: &Error) -> i32 {
    match e {
        Error::Config(_) | Error::Validation { .. } => 1,
        Error::Bind(_) => 2,
        Error::StorageUnavailable(_) => 3,
        _ => 1,
    }
}

async fn run() -> trapline_shared::Result<()> {
    let cfg = Config::load()?;
    info!(
        "trapline starting (domain: {}, store: {})",
        cfg.service_domain,
        if cfg.redis_url.is_some() { "redis" } else { "memory" }
    );

    let store = storage::connect(&cfg).await?;
    let tls_config = match &cfg.tls {
        Some(tls) => Some(tls::load_server_config(&tls.cert, &tls.key)?),
        None => None,
    };
    let state = AppState::new(cfg, store)?;
    let cfg = state.cfg.clone();

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Control API
    let api_listener = bind_tcp(cfg.bind_addr, cfg.api_port).await?;
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = api::serve(api_listener, state, shutdown).await {
                error!("control API terminated: {e}");
            }
        });
    }

    // HTTP capture
    for port in &cfg.http_ports {
        let listener = bind_tcp(cfg.bind_addr, *port).await?;
        info!("http capture listening on {port}");
        tracker.spawn(httpd::serve(
            listener,
            tls_config.clone(),
            state.clone(),
            tracker.clone(),
            shutdown.clone(),
        ));
    }

    // DNS capture
    for port in &cfg.dns_ports {
        let socket = bind_udp(cfg.bind_addr, *port).await?;
        info!("dns capture listening on {port} (udp+tcp)");
        tracker.spawn(dns::serve_udp(
            socket,
            state.clone(),
            tracker.clone(),
            shutdown.clone(),
        ));
        let listener = bind_tcp(cfg.bind_addr, *port).await?;
        tracker.spawn(dns::serve_tcp(
            listener,
            state.clone(),
            tracker.clone(),
            shutdown.clone(),
        ));
    }

    // SMTP capture
    for port in &cfg.smtp_ports {
        let listener = bind_tcp(cfg.bind_addr, *port).await?;
        info!("smtp capture listening on {port}");
        tracker.spawn(smtp::serve(
            listener,
            state.clone(),
            tracker.clone(),
            shutdown.clone(),
        ));
    }

    // Raw TCP capture
    for port in &cfg.tcp_ports {
        let listener = bind_tcp(cfg.bind_addr, *port).await?;
        info!("tcp capture listening on {port}");
        tracker.spawn(tcpd::serve(
            listener,
            state.clone(),
            tracker.clone(),
            shutdown.clone(),
        ));
    }

    spawn_signal_handler(shutdown.clone());
    shutdown.cancelled().await;

    // Stop accepting, then drain in-flight captures within the budget.
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!("drain budget exhausted, exiting with tasks in flight");
    }
    info!("trapline stopped");
    Ok(())
}

async fn bind_tcp(addr: std::net::IpAddr, port: u16) -> trapline_shared::Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(addr, port))
        .await
        .map_err(|e| Error::Bind(format!("tcp {addr}:{port}: {e}")))
}

async fn bind_udp(addr: std::net::IpAddr, port: u16) -> trapline_shared::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(addr, port))
        .await
        .map_err(|e| Error::Bind(format!("udp {addr}:{port}: {e}")))
}

/// Cancel the token on Ctrl+C or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received Ctrl+C, shutting down");
        }
        shutdown.cancel();
    });
}
