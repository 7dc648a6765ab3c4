//! Well-known URIs and URI validation.

/// Maximum URI length.
pub const MAX_URI_LENGTH: usize = 256;

/// Prefix reserved for router-defined URIs.
pub const RESERVED_PREFIX: &str = "wamp.";

pub const CLOSE_NORMAL: &str = "wamp.close.normal";
pub const CLOSE_GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";
pub const CLOSE_SYSTEM_SHUTDOWN: &str = "wamp.close.system_shutdown";

pub const ERROR_NO_SUCH_REALM: &str = "wamp.error.no_such_realm";
pub const ERROR_NOT_AUTHORIZED: &str = "wamp.error.not_authorized";
pub const ERROR_PROTOCOL_VIOLATION: &str = "wamp.error.protocol_violation";
pub const ERROR_INVALID_URI: &str = "wamp.error.invalid_uri";
pub const ERROR_NO_SUCH_PROCEDURE: &str = "wamp.error.no_such_procedure";
pub const ERROR_PROCEDURE_ALREADY_EXISTS: &str = "wamp.error.procedure_already_exists";
pub const ERROR_NO_SUCH_REGISTRATION: &str = "wamp.error.no_such_registration";
pub const ERROR_NO_SUCH_SUBSCRIPTION: &str = "wamp.error.no_such_subscription";
pub const ERROR_CANCELED: &str = "wamp.error.canceled";
pub const ERROR_RUNTIME: &str = "wamp.error.runtime_error";
pub const ERROR_DISCLOSE_DISALLOWED: &str = "wamp.error.option_disallowed.disclose_me";

/// Validate a URI using loose rules: dot-separated non-empty components
/// without whitespace or `#`.
///
/// # Errors
///
/// Returns an error message if the URI is invalid.
pub fn validate_uri(uri: &str) -> Result<(), &'static str> {
    if uri.is_empty() {
        return Err("URI cannot be empty");
    }
    if uri.len() > MAX_URI_LENGTH {
        return Err("URI too long");
    }
    if uri.split('.').any(str::is_empty) {
        return Err("URI contains an empty component");
    }
    if uri.chars().any(|c| c.is_whitespace() || c == '#' || c.is_control()) {
        return Err("URI contains invalid characters");
    }
    Ok(())
}

/// Whether a URI lies in the router-reserved namespace.
#[must_use]
pub fn is_reserved(uri: &str) -> bool {
    uri.starts_with(RESERVED_PREFIX)
}
