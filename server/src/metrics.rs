//! Metrics Collection
//!
//! Atomic counters for the capture front-ends and the subscription bus,
//! exposed as Prometheus text on the control API's /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Service-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Captured interactions by protocol
    http_captures: AtomicU64,
    dns_captures: AtomicU64,
    smtp_captures: AtomicU64,
    tcp_captures: AtomicU64,
    /// Sessions issued
    sessions_created: AtomicU64,
    /// Live WebSocket connections
    active_subscribers: AtomicU64,
    /// Messages dropped by the per-connection drop-oldest policy
    ws_messages_dropped: AtomicU64,
    /// Storage operations that failed or timed out
    storage_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_captures: AtomicU64::new(0),
                dns_captures: AtomicU64::new(0),
                smtp_captures: AtomicU64::new(0),
                tcp_captures: AtomicU64::new(0),
                sessions_created: AtomicU64::new(0),
                active_subscribers: AtomicU64::new(0),
                ws_messages_dropped: AtomicU64::new(0),
                storage_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Record a captured interaction by protocol tag.
    pub fn capture(&self, kind: &str) {
        let counter = match kind {
            "http" => &self.inner.http_captures,
            "dns" => &self.inner.dns_captures,
            "smtp" => &self.inner.smtp_captures,
            _ => &self.inner.tcp_captures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.inner.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_connected(&self) {
        self.inner.active_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_disconnected(&self) {
        self.inner.active_subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn ws_dropped(&self, n: u64) {
        self.inner.ws_messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn storage_error(&self) {
        self.inner.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_subscribers(&self) -> u64 {
        self.inner.active_subscribers.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP trapline_captures_total Captured interactions by protocol
# TYPE trapline_captures_total counter
trapline_captures_total{{protocol="http"}} {}
trapline_captures_total{{protocol="dns"}} {}
trapline_captures_total{{protocol="smtp"}} {}
trapline_captures_total{{protocol="tcp"}} {}

# HELP trapline_sessions_created_total Sessions issued
# TYPE trapline_sessions_created_total counter
trapline_sessions_created_total {}

# HELP trapline_active_subscribers Live WebSocket connections
# TYPE trapline_active_subscribers gauge
trapline_active_subscribers {}

# HELP trapline_ws_messages_dropped_total Messages dropped by slow consumers
# TYPE trapline_ws_messages_dropped_total counter
trapline_ws_messages_dropped_total {}

# HELP trapline_storage_errors_total Failed or timed-out storage operations
# TYPE trapline_storage_errors_total counter
trapline_storage_errors_total {}
"#,
            self.inner.http_captures.load(Ordering::Relaxed),
            self.inner.dns_captures.load(Ordering::Relaxed),
            self.inner.smtp_captures.load(Ordering::Relaxed),
            self.inner.tcp_captures.load(Ordering::Relaxed),
            self.inner.sessions_created.load(Ordering::Relaxed),
            self.inner.active_subscribers.load(Ordering::Relaxed),
            self.inner.ws_messages_dropped.load(Ordering::Relaxed),
            self.inner.storage_errors.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.capture("http");
        m.capture("http");
        m.capture("dns");
        m.session_created();
        m.subscriber_connected();
        m.ws_dropped(3);

        let text = m.to_prometheus();
        assert!(text.contains(r#"trapline_captures_total{protocol="http"} 2"#));
        assert!(text.contains(r#"trapline_captures_total{protocol="dns"} 1"#));
        assert!(text.contains("trapline_sessions_created_total 1"));
        assert!(text.contains("trapline_active_subscribers 1"));
        assert!(text.contains("trapline_ws_messages_dropped_total 3"));

        m.subscriber_disconnected();
        assert_eq!(m.active_subscribers(), 0);
    }
}
