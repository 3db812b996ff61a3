//! Hook connection acceptor.
//!
//! Binds once, registers every accepted socket with the event loop and
//! spawns its connection tasks. A panic restarts the acceptor from the
//! bind; a bind or accept failure ends it for good.

use crate::connection::{self, ConnectionSettings};
use crate::registry::ClientHandles;
use crate::supervisor::restart_on_fault;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause before re-binding after a caught panic.
const RESTART_DELAY: Duration = Duration::from_millis(100);

const LISTEN_BACKLOG: i32 = 128;

/// Observable state of the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not bound yet.
    Pending,
    /// Accepting hook connections on this address.
    Listening(SocketAddr),
    /// Bind failed; hooks are disabled for this run.
    Disabled,
    /// Accept loop ended (accept failure or shutdown).
    Closed,
}

/// Request sent to the event loop for every accepted socket.
#[derive(Debug)]
pub struct RegistrationRequest {
    pub peer: SocketAddr,
    pub reply: oneshot::Sender<ClientHandles>,
}

pub(crate) struct Acceptor {
    pub(crate) listen: String,
    pub(crate) registrations: mpsc::Sender<RegistrationRequest>,
    pub(crate) settings: ConnectionSettings,
    pub(crate) state: watch::Sender<ListenerState>,
    pub(crate) shutdown: CancellationToken,
}

impl Acceptor {
    /// Run the accept loop, restarting it whenever it panics.
    pub(crate) async fn supervise(self) {
        self.supervise_with(|acceptor| acceptor.serve().boxed()).await;
    }

    async fn supervise_with<F>(mut self, body: F)
    where
        F: for<'a> FnMut(&'a mut Acceptor) -> BoxFuture<'a, ()>,
    {
        let runs = restart_on_fault("listener", RESTART_DELAY, &mut self, body, |acceptor, _| {
            // The old socket is gone; wait for the re-bind
            acceptor.state.send_replace(ListenerState::Pending);
        })
        .await;
        debug!(runs, "Listener exited");
    }

    async fn serve(&self) {
        let listener = match bind(&self.listen) {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %self.listen, error = %e, "Failed to start listener, hooks disabled");
                self.state.send_replace(ListenerState::Disabled);
                return;
            }
        };

        match listener.local_addr() {
            Ok(addr) => {
                info!(address = %addr, "Hook listener started");
                self.state.send_replace(ListenerState::Listening(addr));
            }
            Err(e) => {
                error!(error = %e, "Failed to read listener address, hooks disabled");
                self.state.send_replace(ListenerState::Disabled);
                return;
            }
        }

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept new connection");
                    break;
                }
            };
            debug!(peer = %peer, "New hook connection");

            let Some(handles) = self.register(peer).await else {
                debug!(peer = %peer, "Event loop gone, closing listener");
                break;
            };
            connection::spawn(stream, peer, handles, self.settings);
        }

        self.state.send_replace(ListenerState::Closed);
    }

    /// Registration handshake with the event loop.
    ///
    /// Waits while the registration intake is full.
    async fn register(&self, peer: SocketAddr) -> Option<ClientHandles> {
        let (reply, response) = oneshot::channel();
        self.registrations
            .send(RegistrationRequest { peer, reply })
            .await
            .ok()?;
        response.await.ok()
    }
}

/// Create the listening socket with `SO_REUSEADDR`, so a restart can bind
/// again while old connections sit in `TIME_WAIT`.
fn bind(listen: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
