//! Per-connection metrics.

use std::time::Instant;
use tenvis_junction_core::metrics::{record_connection, record_disconnection};
use tenvis_junction_core::TransportKind;

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    transport: TransportKind,
    started: Instant,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(transport: TransportKind) -> Self {
        record_connection(transport);
        Self {
            transport,
            started: Instant::now(),
        }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.transport, self.started.elapsed().as_secs_f64());
    }
}
