//! Hub-side client entry
//!
//! Represents a registered connection: its identity and the producing end of
//! its bounded outbound queue. The consuming end belongs to the connection's
//! writer pump.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::message::OutboundFrame;
use crate::types::ClientId;

/// Result of a non-blocking enqueue onto a client's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame is queued for the writer
    Queued,
    /// Queue is at capacity; the writer cannot keep up
    Full,
    /// Writer has already dropped its receiver
    Closed,
}

/// Registered connection
///
/// The hub holds the only `Sender`, so dropping this entry closes the queue
/// and tells the writer to finish.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Resolved identity (username or "Anonymous")
    pub identity: String,
    /// Hub → writer frame queue
    sender: mpsc::Sender<OutboundFrame>,
}

impl Client {
    /// Create a client together with the receiving end of its outbound queue
    pub fn new(
        id: ClientId,
        identity: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let client = Self {
            id,
            identity: identity.into(),
            sender,
        };
        (client, receiver)
    }

    /// Try to queue a frame without waiting
    pub fn try_deliver(&self, frame: &OutboundFrame) -> Delivery {
        match self.sender.try_send(frame.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}
