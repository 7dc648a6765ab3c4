//! Metric names and recording helpers shared by the router and transports.
//!
//! Recording is a no-op until a recorder is installed by the server.

use crate::session::TransportKind;
use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "junction_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "junction_sessions_active";
    pub const CONNECTIONS_TOTAL: &str = "junction_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "junction_connections_active";
    pub const CONNECTION_DURATION_SECONDS: &str = "junction_connection_duration_seconds";
    pub const CALLS_TOTAL: &str = "junction_calls_total";
    pub const PUBLICATIONS_TOTAL: &str = "junction_publications_total";
    pub const MESSAGES_TOTAL: &str = "junction_messages_total";
    pub const ERRORS_TOTAL: &str = "junction_errors_total";
}

/// Record a session joining a realm.
pub fn record_session_joined(realm: &str, transport: TransportKind) {
    counter!(
        names::SESSIONS_TOTAL,
        "realm" => realm.to_string(),
        "transport" => transport.as_str()
    )
    .increment(1);
    gauge!(names::SESSIONS_ACTIVE, "realm" => realm.to_string()).increment(1.0);
}

/// Record a session leaving a realm.
pub fn record_session_left(realm: &str) {
    gauge!(names::SESSIONS_ACTIVE, "realm" => realm.to_string()).decrement(1.0);
}

/// Record a routed call.
pub fn record_call(realm: &str) {
    counter!(names::CALLS_TOTAL, "realm" => realm.to_string()).increment(1);
}

/// Record a publication.
pub fn record_publication(realm: &str) {
    counter!(names::PUBLICATIONS_TOTAL, "realm" => realm.to_string()).increment(1);
}

/// Record a message crossing a transport.
pub fn record_message(transport: TransportKind, direction: &'static str) {
    counter!(
        names::MESSAGES_TOTAL,
        "transport" => transport.as_str(),
        "direction" => direction
    )
    .increment(1);
}

/// Record an accepted transport connection.
pub fn record_connection(transport: TransportKind) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport.as_str()).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport.as_str()).increment(1.0);
}

/// Record a transport connection ending after `seconds`.
pub fn record_disconnection(transport: TransportKind, seconds: f64) {
    gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport.as_str()).decrement(1.0);
    histogram!(names::CONNECTION_DURATION_SECONDS, "transport" => transport.as_str())
        .record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
