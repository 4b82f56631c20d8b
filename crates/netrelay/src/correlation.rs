//! Request identifier allocation.

use uuid::Uuid;

/// Header the debug proxy adds to responses, carrying the relay identifier.
pub const CORRELATION_HEADER: &str = "x-netrelay-request-id";

/// Allocate a new request identifier (UUID v4).
///
/// Unique among concurrent calls with overwhelming probability; collisions
/// are not detected.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
