//! Ephemeral typing state
//!
//! Guarded by its own lock so keystroke-rate updates never contend with
//! the hub's connection set.

use std::collections::HashSet;

use tokio::sync::RwLock;

/// Set of identities currently composing a message
#[derive(Debug, Default)]
pub struct TypingTracker {
    users: RwLock<HashSet<String>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or remove `user`; both directions are idempotent
    pub async fn set_typing(&self, user: &str, is_typing: bool) {
        let mut users = self.users.write().await;
        if is_typing {
            users.insert(user.to_string());
        } else {
            users.remove(user);
        }
    }

    /// Point-in-time snapshot of typing identities (unordered)
    pub async fn typing_users(&self) -> Vec<String> {
        self.users.read().await.iter().cloned().collect()
    }
}
