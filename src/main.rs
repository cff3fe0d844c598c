//! Real-time WebSocket Chat Hub - Entry Point
//!
//! Builds the collaborators and the hub, then accepts connections.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_hub::{handle_connection, Config, Directory, Hub, Services};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info")),
        )
        .init();

    let config = Config::from_env()?;

    let directory = Arc::new(Directory::with_tokens(&config.tokens).await);
    let services = Services::from_directory(directory);

    // The hub lives for the whole process; this handle keeps its loop running
    let (hub, hub_loop) = Hub::new(config.hub_queue, services.profiles.clone());
    tokio::spawn(hub_loop.run());

    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket Chat Hub listening on {}", config.addr);

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let hub = hub.clone();
                let services = services.clone();
                let client_queue = config.client_queue;

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub, services, client_queue).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
