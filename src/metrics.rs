//! Prometheus metrics
//!
//! All metrics live in one registry and are exposed through the optional
//! stats API endpoint. Failure to record a metric never affects the data
//! plane.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Connections accepted per service
    pub static ref SERVICE_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("passage_service_connections_total", "Total connections accepted per service"),
        &["service"]
    ).unwrap();

    /// Currently active connections per service
    pub static ref SERVICE_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("passage_service_connections_active", "Active connections per service"),
        &["service"]
    ).unwrap();

    /// Handler errors per service
    pub static ref SERVICE_HANDLER_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("passage_service_handler_errors_total", "Handler errors per service"),
        &["service"]
    ).unwrap();

    /// Bytes copied client -> upstream
    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("passage_traffic_bytes_uploaded_total", "Bytes uploaded per service"),
        &["service"]
    ).unwrap();

    /// Bytes copied upstream -> client
    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("passage_traffic_bytes_downloaded_total", "Bytes downloaded per service"),
        &["service"]
    ).unwrap();

    /// Transport handshake failures per kind
    pub static ref HANDSHAKE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("passage_handshake_errors_total", "Transport handshake failures"),
        &["transport"]
    ).unwrap();
}

/// Register all metrics with the global registry.
pub fn init_metrics() {
    REGISTRY.register(Box::new(SERVICE_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_HANDLER_ERRORS.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone())).ok();
    REGISTRY.register(Box::new(HANDSHAKE_ERRORS.clone())).ok();
}

/// Encode the registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00MB");
    }

    #[test]
    fn gather_includes_registered_metric() {
        init_metrics();
        SERVICE_CONNECTIONS_TOTAL.with_label_values(&["test"]).inc();
        assert!(gather().contains("passage_service_connections_total"));
    }
}
