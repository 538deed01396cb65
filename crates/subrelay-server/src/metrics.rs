//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names shared by the session, handler and forwarding tasks.

/// Downstream connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Downstream disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open downstream connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Downstream connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Client `subscribe` frames accepted for fan-out (counter).
pub const SUBSCRIPTIONS_TOTAL: &str = "subscriptions_total";
/// Client `subscribe` frames refused (counter, labels: reason).
pub const SUBSCRIPTIONS_REJECTED_TOTAL: &str = "subscriptions_rejected_total";
/// Live upstream legs across all connections (gauge).
pub const SUBSCRIPTION_LEGS_ACTIVE: &str = "subscription_legs_active";
/// Upstream operation failures (counter, labels: upstream).
pub const UPSTREAM_ERRORS_TOTAL: &str = "upstream_errors_total";
/// Upstream clients disposed at connection teardown (counter).
pub const UPSTREAM_DISPOSALS_TOTAL: &str = "upstream_disposals_total";
