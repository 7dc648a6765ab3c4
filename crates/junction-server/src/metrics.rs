//! Prometheus export for Junction.
//!
//! The router and transports record through the `metrics` facade; this
//! module describes those metrics and installs the exporter.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_junction_core::metrics::names;
use tracing::info;

/// Describe the metrics recorded by the router and transports.
pub fn init_metrics() {
    metrics::describe_counter!(names::SESSIONS_TOTAL, "Total number of sessions joined");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of joined sessions");
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of transport connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of transport connections"
    );
    metrics::describe_histogram!(
        names::CONNECTION_DURATION_SECONDS,
        "Transport connection lifetime in seconds"
    );
    metrics::describe_counter!(names::CALLS_TOTAL, "Total number of routed calls");
    metrics::describe_counter!(names::PUBLICATIONS_TOTAL, "Total number of publications");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
