//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if another recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted and registered (counter).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections removed from the registry (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Registered connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Payloads queued to a connection (counter, labels: route).
pub const MESSAGES_DELIVERED_TOTAL: &str = "relay_messages_delivered_total";
/// Per-connection delivery failures (counter, labels: route).
pub const DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
/// Connections pruned by the liveness sweep (counter).
pub const LIVENESS_TERMINATIONS_TOTAL: &str = "relay_liveness_terminations_total";
/// Messages received from the bus (counter, labels: route).
pub const BUS_MESSAGES_TOTAL: &str = "relay_bus_messages_total";
/// Bus events dropped before routing (counter, labels: reason).
pub const DROPPED_EVENTS_TOTAL: &str = "relay_dropped_events_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            MESSAGES_DELIVERED_TOTAL,
            DELIVERY_FAILURES_TOTAL,
            LIVENESS_TERMINATIONS_TOTAL,
            BUS_MESSAGES_TOTAL,
            DROPPED_EVENTS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("relay_"), "metric '{name}' lacks prefix");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
