use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::veil::tunnel::relay::RelayReport;

pub const CONNECTIONS_TOTAL: &str = "veil_connections_total";
pub const CONNECT_REJECTED_TOTAL: &str = "veil_connect_rejected_total";
pub const DIAL_FAILURES_TOTAL: &str = "veil_dial_failures_total";
pub const BYTES_UPSTREAM_TOTAL: &str = "veil_bytes_upstream_total";
pub const BYTES_DOWNSTREAM_TOTAL: &str = "veil_bytes_downstream_total";
pub const ACTIVE_SESSIONS: &str = "veil_active_sessions";

/// Installs a Prometheus recorder for the `metrics` crate and serves the
/// exposition format on `addr`.
///
/// Must run inside the tokio runtime, once per process. Without it every
/// metric call is a no-op.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("metrics: install Prometheus listener on {addr}"))
}

pub fn record_relay(report: &RelayReport) {
    metrics::counter!(BYTES_UPSTREAM_TOTAL).increment(report.upstream.bytes);
    metrics::counter!(BYTES_DOWNSTREAM_TOTAL).increment(report.downstream.bytes);
}
