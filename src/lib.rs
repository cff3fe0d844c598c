//! Real-time WebSocket Chat Hub Library
//!
//! A chat hub built with tokio-tungstenite that fans chat messages and
//! typing indicators out to every connected client.
//!
//! # Features
//! - Bearer token identity at upgrade time, anonymous fallback
//! - Broadcast chat with server-stamped timestamps and resolved profiles
//! - Typing indicators, cleared automatically when a user sends a message
//! - Best-effort persistence that never delays delivery
//! - Slow consumers are evicted instead of stalling everyone else
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `HubLoop` is the single owner of the connection set
//! - Each connection runs a reader pump and a writer pump
//! - Read-only queries (online users, typing users) take short snapshots
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_hub::{handle_connection, Directory, Hub, Services};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let services = Services::from_directory(Arc::new(Directory::new()));
//!     let (hub, hub_loop) = Hub::new(256, services.profiles.clone());
//!
//!     tokio::spawn(hub_loop.run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, hub.clone(), services.clone(), 256));
//!     }
//! }
//! ```

pub mod client;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod typing;
pub mod types;

// Re-export main types for convenience
pub use client::{Client, Delivery};
pub use collaborators::{
    AuthResolver, Directory, MessageStore, Profile, ProfileResolver, Services, UserActivity,
};
pub use config::Config;
pub use error::AppError;
pub use handler::{handle_connection, read_pump, write_pump};
pub use hub::{Hub, HubLoop, HubState};
pub use message::{ChatFrame, InboundFrame, OnlineUser, OnlineUsers, TypingFrame, TypingKind};
pub use typing::TypingTracker;
pub use types::{ClientId, ANONYMOUS};
