//! Identifier generation.

use uuid::Uuid;

/// Generates a new session handle.
///
/// Handles are opaque UUIDs; they stay stable across refreshes and are safe
/// to log (they carry no secret material).
#[must_use]
pub fn generate_handle() -> String {
    Uuid::new_v4().to_string()
}

/// Generates an opaque random token such as an anti-CSRF value.
#[must_use]
pub fn generate_opaque_token() -> String {
    Uuid::new_v4().to_string()
}
