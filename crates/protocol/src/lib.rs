//! Kheti Protocol
//!
//! Shared types for talking to the Kheti chat backend.
//! These types are serialized as JSON over HTTP.

use uuid::Uuid;

// Re-exports
pub mod api;
pub mod types;

pub use api::*;
pub use types::*;

/// Session-id prefixes that exist only in client-local state.
/// Ids in these namespaces are never resolvable via the
/// session-retrieval endpoint.
pub const TEMP_SESSION_PREFIX: &str = "temp-";
pub const ANON_SESSION_PREFIX: &str = "anon-";

/// True if the id belongs to a local-only namespace.
pub fn is_local_only(session_id: &str) -> bool {
    session_id.starts_with(TEMP_SESSION_PREFIX) || session_id.starts_with(ANON_SESSION_PREFIX)
}

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
