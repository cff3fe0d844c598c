//! Error types for the chat hub
//!
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Transport errors are terminal for one connection. Decode, validation,
/// persistence and auth errors are recovered where they occur.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal for the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The hub control loop is no longer receiving operations
    #[error("Hub closed")]
    HubClosed,

    /// Chat frame with empty content
    #[error("Empty message content")]
    EmptyContent,

    /// Message store write failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Bearer token missing or rejected
    #[error("Auth error: {0}")]
    Auth(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),
}
