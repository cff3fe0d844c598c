//! External collaborators consumed by the hub and the connection pumps
//!
//! Identity verification, profile lookup, message persistence and activity
//! timestamps live behind object-safe async traits. `Directory` is an
//! in-memory implementation of all four, used by the binary and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::RwLock;

use crate::error::AppError;

/// Default and maximum page sizes for `Directory::recent`
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 100;

/// Display identity of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub avatar: String,
}

impl Profile {
    /// Fallback used when the resolver has no entry for an identity
    pub fn fallback(identity: &str) -> Self {
        Self {
            display_name: identity.to_string(),
            avatar: String::new(),
        }
    }
}

/// Resolves a bearer token to an identity
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<String, AppError>;
}

/// Looks up display name and avatar; `None` on miss
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn profile(&self, identity: &str) -> Option<Profile>;
}

/// Appends chat messages, returning the new message id
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, identity: &str, content: &str) -> Result<u64, AppError>;
}

/// Records when a user was last active
#[async_trait]
pub trait UserActivity: Send + Sync {
    async fn touch(&self, identity: &str, at: DateTime<Local>) -> Result<(), AppError>;
}

/// Resolve `identity`, falling back to the raw identity with no avatar
pub async fn resolve_profile(profiles: &dyn ProfileResolver, identity: &str) -> Profile {
    match profiles.profile(identity).await {
        Some(profile) => profile,
        None => Profile::fallback(identity),
    }
}

/// Bundle of collaborators handed to every connection
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthResolver>,
    pub profiles: Arc<dyn ProfileResolver>,
    pub store: Arc<dyn MessageStore>,
    pub activity: Arc<dyn UserActivity>,
}

impl Services {
    /// Use one directory for every collaborator role
    pub fn from_directory(directory: Arc<Directory>) -> Self {
        Self {
            auth: directory.clone(),
            profiles: directory.clone(),
            store: directory.clone(),
            activity: directory,
        }
    }
}

/// Registered user
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub nickname: String,
    pub avatar: String,
    pub last_active: Option<DateTime<Local>>,
}

impl UserRecord {
    /// Nickname when set, otherwise the username
    pub fn display_name(&self) -> &str {
        if self.nickname.is_empty() {
            &self.username
        } else {
            &self.nickname
        }
    }
}

/// Persisted chat message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: u64,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Local>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<String, UserRecord>,
    tokens: HashMap<String, String>,
    messages: Vec<StoredMessage>,
    next_id: u64,
}

/// In-memory user directory and message log
#[derive(Debug, Default)]
pub struct Directory {
    state: RwLock<DirectoryState>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed users and tokens from `(token, username)` pairs
    pub async fn with_tokens(pairs: &[(String, String)]) -> Self {
        let directory = Self::new();
        for (token, username) in pairs {
            directory.add_user(username, "", "").await;
            directory.issue_token(token, username).await;
        }
        directory
    }

    /// Add or replace a user record
    pub async fn add_user(&self, username: &str, nickname: &str, avatar: &str) {
        let record = UserRecord {
            username: username.to_string(),
            nickname: nickname.to_string(),
            avatar: avatar.to_string(),
            last_active: None,
        };
        self.state
            .write()
            .await
            .users
            .insert(username.to_string(), record);
    }

    pub async fn issue_token(&self, token: &str, username: &str) {
        self.state
            .write()
            .await
            .tokens
            .insert(token.to_string(), username.to_string());
    }

    /// Newest messages, returned oldest first
    ///
    /// A limit of zero or above 100 falls back to 50.
    pub async fn recent(&self, limit: usize) -> Vec<StoredMessage> {
        let limit = if limit == 0 || limit > MAX_HISTORY_LIMIT {
            DEFAULT_HISTORY_LIMIT
        } else {
            limit
        };
        let state = self.state.read().await;
        let start = state.messages.len().saturating_sub(limit);
        state.messages[start..].to_vec()
    }

    pub async fn last_active(&self, username: &str) -> Option<DateTime<Local>> {
        self.state
            .read()
            .await
            .users
            .get(username)
            .and_then(|u| u.last_active)
    }
}

#[async_trait]
impl AuthResolver for Directory {
    async fn resolve(&self, token: &str) -> Result<String, AppError> {
        if token.is_empty() {
            return Err(AppError::Auth("empty token".to_string()));
        }
        self.state
            .read()
            .await
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AppError::Auth("unknown token".to_string()))
    }
}

#[async_trait]
impl ProfileResolver for Directory {
    async fn profile(&self, identity: &str) -> Option<Profile> {
        self.state
            .read()
            .await
            .users
            .get(identity)
            .map(|user| Profile {
                display_name: user.display_name().to_string(),
                avatar: user.avatar.clone(),
            })
    }
}

#[async_trait]
impl MessageStore for Directory {
    async fn append(&self, identity: &str, content: &str) -> Result<u64, AppError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = state.next_id;
        state.messages.push(StoredMessage {
            id,
            username: identity.to_string(),
            content: content.to_string(),
            created_at: Local::now(),
        });
        Ok(id)
    }
}

#[async_trait]
impl UserActivity for Directory {
    /// Unknown identities (e.g. anonymous) have nothing to update
    async fn touch(&self, identity: &str, at: DateTime<Local>) -> Result<(), AppError> {
        if let Some(user) = self.state.write().await.users.get_mut(identity) {
            user.last_active = Some(at);
        }
        Ok(())
    }
}
