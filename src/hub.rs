//! Hub actor implementation
//!
//! The hub is the single owner of the connection set. Connections reach it
//! through four operation queues (register, unregister, broadcast, typing)
//! consumed by one serialized control loop, so the fan-out path needs no
//! lock held across tasks. Read-only queries take brief snapshots of the
//! shared set instead of going through the loop.
//!
//! Every operation is a rendezvous: the caller waits until the loop has
//! processed it. A single connection's operations are therefore applied in
//! the order it issued them, while the loop stays fair between queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::client::{Client, Delivery};
use crate::collaborators::{resolve_profile, ProfileResolver};
use crate::error::AppError;
use crate::message::{encode, ChatFrame, OnlineUser, OutboundFrame, TypingFrame};
use crate::typing::TypingTracker;
use crate::types::ClientId;

type ClientSet = Arc<RwLock<HashMap<ClientId, Client>>>;

/// Lifecycle of the hub control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Created, loop not started yet
    New,
    /// Loop is processing operations
    Running,
}

/// Operation payload plus the acknowledgement sent once it is processed
struct Envelope<T> {
    payload: T,
    done: oneshot::Sender<()>,
}

/// Handle to the hub, cheap to clone and shared by every connection
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<Envelope<Client>>,
    unregister_tx: mpsc::Sender<Envelope<ClientId>>,
    broadcast_tx: mpsc::Sender<Envelope<ChatFrame>>,
    typing_tx: mpsc::Sender<Envelope<TypingFrame>>,
    clients: ClientSet,
    typing: Arc<TypingTracker>,
    profiles: Arc<dyn ProfileResolver>,
    running: Arc<AtomicBool>,
}

/// The hub control loop, owning the receiving end of every operation queue
pub struct HubLoop {
    register_rx: mpsc::Receiver<Envelope<Client>>,
    unregister_rx: mpsc::Receiver<Envelope<ClientId>>,
    broadcast_rx: mpsc::Receiver<Envelope<ChatFrame>>,
    typing_rx: mpsc::Receiver<Envelope<TypingFrame>>,
    clients: ClientSet,
    running: Arc<AtomicBool>,
}

impl Hub {
    /// Create a hub handle and its (not yet running) control loop
    ///
    /// `queue_capacity` bounds each of the four operation queues.
    pub fn new(queue_capacity: usize, profiles: Arc<dyn ProfileResolver>) -> (Self, HubLoop) {
        let (register_tx, register_rx) = mpsc::channel(queue_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(queue_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(queue_capacity);
        let (typing_tx, typing_rx) = mpsc::channel(queue_capacity);
        let clients: ClientSet = Arc::new(RwLock::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(false));

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            typing_tx,
            clients: clients.clone(),
            typing: Arc::new(TypingTracker::new()),
            profiles,
            running: running.clone(),
        };
        let hub_loop = HubLoop {
            register_rx,
            unregister_rx,
            broadcast_rx,
            typing_rx,
            clients,
            running,
        };
        (hub, hub_loop)
    }

    pub fn state(&self) -> HubState {
        if self.running.load(Ordering::Acquire) {
            HubState::Running
        } else {
            HubState::New
        }
    }

    /// Add a client to the set (idempotent per client id)
    pub async fn register(&self, client: Client) -> Result<(), AppError> {
        submit(&self.register_tx, client).await
    }

    /// Remove a client and close its outbound queue; no-op if absent
    pub async fn unregister(&self, client_id: ClientId) -> Result<(), AppError> {
        submit(&self.unregister_tx, client_id).await
    }

    /// Fan a finalized chat frame out to every registered client
    pub async fn broadcast(&self, frame: ChatFrame) -> Result<(), AppError> {
        submit(&self.broadcast_tx, frame).await
    }

    /// Fan a typing frame out to every registered client
    pub async fn broadcast_typing(&self, frame: TypingFrame) -> Result<(), AppError> {
        submit(&self.typing_tx, frame).await
    }

    pub async fn set_typing(&self, user: &str, is_typing: bool) {
        self.typing.set_typing(user, is_typing).await;
    }

    /// Snapshot of the typing set
    pub async fn typing_users(&self) -> Vec<String> {
        self.typing.typing_users().await
    }

    /// Snapshot of connected clients joined with their profiles
    ///
    /// May race with an in-flight register or broadcast.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let identities: Vec<String> = self
            .clients
            .read()
            .await
            .values()
            .map(|c| c.identity.clone())
            .collect();

        let mut users = Vec::with_capacity(identities.len());
        for identity in identities {
            let profile = resolve_profile(self.profiles.as_ref(), &identity).await;
            users.push(OnlineUser {
                username: profile.display_name,
                avatar: profile.avatar,
            });
        }
        users
    }

    pub async fn online_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

async fn submit<T>(queue: &mpsc::Sender<Envelope<T>>, payload: T) -> Result<(), AppError> {
    let (done, processed) = oneshot::channel();
    queue
        .send(Envelope { payload, done })
        .await
        .map_err(|_| AppError::HubClosed)?;
    processed.await.map_err(|_| AppError::HubClosed)
}

impl HubLoop {
    /// Run the control loop
    ///
    /// Processes operations in arrival order with no priority between
    /// queues, until every `Hub` handle has been dropped.
    pub async fn run(mut self) {
        self.running.store(true, Ordering::Release);
        info!("Hub started");

        loop {
            tokio::select! {
                Some(op) = self.register_rx.recv() => {
                    self.handle_register(op.payload).await;
                    let _ = op.done.send(());
                }
                Some(op) = self.unregister_rx.recv() => {
                    self.handle_unregister(op.payload).await;
                    let _ = op.done.send(());
                }
                Some(op) = self.broadcast_rx.recv() => {
                    self.handle_broadcast(&op.payload).await;
                    let _ = op.done.send(());
                }
                Some(op) = self.typing_rx.recv() => {
                    self.handle_typing(&op.payload).await;
                    let _ = op.done.send(());
                }
                else => break,
            }
        }

        info!("Hub shutting down");
    }

    pub(crate) async fn handle_register(&mut self, client: Client) {
        let mut clients = self.clients.write().await;
        let (id, identity) = (client.id, client.identity.clone());
        if clients.contains_key(&id) {
            debug!("Client {} already registered", id);
            return;
        }
        clients.insert(id, client);
        info!("Client {} registered as '{}'", id, identity);
        debug!("Total clients: {}", clients.len());
    }

    pub(crate) async fn handle_unregister(&mut self, client_id: ClientId) {
        // Dropping the entry drops the only sender, closing the writer's queue
        if let Some(client) = self.clients.write().await.remove(&client_id) {
            info!("Client {} ('{}') unregistered", client_id, client.identity);
        }
    }

    pub(crate) async fn handle_broadcast(&mut self, frame: &ChatFrame) {
        match encode(frame) {
            Ok(encoded) => self.fan_out(&encoded).await,
            Err(e) => error!("Failed to encode chat frame: {}", e),
        }
    }

    pub(crate) async fn handle_typing(&mut self, frame: &TypingFrame) {
        match encode(frame) {
            Ok(encoded) => self.fan_out(&encoded).await,
            Err(e) => error!("Failed to encode typing frame: {}", e),
        }
    }

    /// Queue `frame` on every client without waiting
    ///
    /// A full queue evicts that client only; the others still get the frame.
    async fn fan_out(&mut self, frame: &OutboundFrame) {
        let mut clients = self.clients.write().await;
        clients.retain(|id, client| match client.try_deliver(frame) {
            Delivery::Queued => true,
            Delivery::Full => {
                warn!("Evicting slow client {} ('{}'): queue full", id, client.identity);
                false
            }
            Delivery::Closed => {
                debug!("Dropping client {}: writer gone", id);
                false
            }
        });
    }
}
