//! Basic type definitions for the chat hub
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based unique connection identifier

use uuid::Uuid;

/// Identity assigned to connections without a valid bearer token
pub const ANONYMOUS: &str = "Anonymous";

/// Unique connection identifier (newtype pattern)
///
/// Two connections from the same username get distinct ids, so the hub
/// keys its client set by this rather than by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
