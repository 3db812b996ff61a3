//! Registry of connected hook clients.
//!
//! Owned by the event loop and never shared. Each registration holds the
//! only sender of its client's inbound queue, so removing a registration is
//! what closes the queue.

use crate::event::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handles given to a freshly accepted connection.
#[derive(Debug)]
pub struct ClientHandles {
    /// Identifier used in logs.
    pub id: u64,
    /// Broadcasts addressed to this client.
    pub inbox: mpsc::Receiver<Arc<Message>>,
    /// Shared intake for client-originated messages.
    pub outbox: mpsc::Sender<Message>,
    /// Connection-wide stop signal.
    pub stop: CancellationToken,
}

/// One registered client.
#[derive(Debug)]
struct ClientRegistration {
    id: u64,
    peer: SocketAddr,
    queue: mpsc::Sender<Arc<Message>>,
    stop: CancellationToken,
}

/// Ordered collection of live registrations.
#[derive(Debug)]
pub struct Registry {
    clients: Vec<ClientRegistration>,
    queue_capacity: usize,
    next_id: u64,
}

impl Registry {
    /// Create an empty registry whose clients get queues of `queue_capacity`.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Vec::new(),
            queue_capacity,
            next_id: 0,
        }
    }

    /// Register a new client and return the handles for its connection.
    pub fn register(&mut self, peer: SocketAddr, outbox: &mpsc::Sender<Message>) -> ClientHandles {
        let id = self.next_id;
        self.next_id += 1;

        let (queue, inbox) = mpsc::channel(self.queue_capacity);
        let stop = CancellationToken::new();

        self.clients.push(ClientRegistration {
            id,
            peer,
            queue,
            stop: stop.clone(),
        });
        debug!(client = id, peer = %peer, clients = self.clients.len(), "Client registered");

        ClientHandles {
            id,
            inbox,
            outbox: outbox.clone(),
            stop,
        }
    }

    /// Offer `msg` to every client without waiting.
    ///
    /// A client whose queue is full, or already closed by a torn-down
    /// connection, is removed and its queue closed. Returns how many clients
    /// were removed.
    pub fn broadcast(&mut self, msg: Message) -> usize {
        let msg = Arc::new(msg);
        let before = self.clients.len();

        self.clients
            .retain(|client| match client.queue.try_send(Arc::clone(&msg)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(client = client.id, peer = %client.peer, id = msg.id, "Client queue full, dropping client");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = client.id, peer = %client.peer, "Client connection gone, dropping registration");
                    false
                }
            });

        before - self.clients.len()
    }

    /// Stop every connection and forget all registrations.
    pub fn shutdown(&mut self) {
        for client in self.clients.drain(..) {
            client.stop.cancel();
        }
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if there are no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client ids in registry order.
    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.clients.iter().map(|client| client.id)
    }
}
