//! Runtime configuration
//!
//! Read from `CHAT_*` environment variables; the first command line argument
//! overrides the bind address.

use std::env;

use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default outbound queue capacity per client
pub const DEFAULT_CLIENT_QUEUE: usize = 256;

/// Default capacity of each hub operation queue
pub const DEFAULT_HUB_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub addr: String,
    pub client_queue: usize,
    pub hub_queue: usize,
    /// `(token, username)` pairs accepted at upgrade time
    pub tokens: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            client_queue: DEFAULT_CLIENT_QUEUE,
            hub_queue: DEFAULT_HUB_QUEUE,
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the process environment and arguments
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        if let Some(addr) = env::args().nth(1) {
            config.addr = addr;
        }
        Ok(config)
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            config.addr = addr;
        }
        if let Some(value) = lookup("CHAT_CLIENT_QUEUE") {
            config.client_queue = parse_capacity("CHAT_CLIENT_QUEUE", &value)?;
        }
        if let Some(value) = lookup("CHAT_HUB_QUEUE") {
            config.hub_queue = parse_capacity("CHAT_HUB_QUEUE", &value)?;
        }
        if let Some(value) = lookup("CHAT_TOKENS") {
            config.tokens = parse_tokens(&value)?;
        }

        Ok(config)
    }
}

fn parse_capacity(key: &str, value: &str) -> Result<usize, AppError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(AppError::Config(format!(
            "{} must be a positive integer, got '{}'",
            key, value
        ))),
    }
}

/// Parse `token=username,token=username`
fn parse_tokens(value: &str) -> Result<Vec<(String, String)>, AppError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                Ok((token.to_string(), user.to_string()))
            }
            _ => Err(AppError::Config(format!("invalid CHAT_TOKENS entry '{}'", pair))),
        })
        .collect()
}
