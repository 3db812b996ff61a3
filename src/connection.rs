//! Per-connection tasks: writer, reader and stop coordinator.
//!
//! The three tasks share one [`CancellationToken`] and one error channel
//! with a slot for each of reader and writer. Whichever fails first wins;
//! the coordinator cancels the token and the siblings unwind.

use crate::codec::{read_message, write_message};
use crate::config::Config;
use crate::error::ConnectionError;
use crate::event::Message;
use crate::registry::ClientHandles;
use crate::supervisor::catch_fault;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// One slot each for reader and writer.
const ERROR_CHANNEL_CAPACITY: usize = 2;

/// Timing and size limits applied to each hook connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    pub max_frame_len: usize,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
            max_frame_len: config.max_frame_len,
        }
    }
}

/// Spawn the writer, reader and coordinator for an accepted socket.
pub fn spawn(stream: TcpStream, peer: SocketAddr, handles: ClientHandles, settings: ConnectionSettings) {
    let ClientHandles {
        id,
        inbox,
        outbox,
        stop,
    } = handles;

    let (read_half, write_half) = stream.into_split();
    let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

    debug!(client = id, peer = %peer, "Starting connection tasks");

    tokio::spawn(writer_task(
        id,
        write_half,
        inbox,
        errors_tx.clone(),
        stop.clone(),
        settings,
    ));
    tokio::spawn(reader_task(
        id,
        read_half,
        outbox,
        errors_tx,
        stop.clone(),
        settings,
    ));
    tokio::spawn(coordinator_task(id, peer, errors_rx, stop));
}

/// Drive the reader or writer loop and post its failure for the
/// coordinator. A panic is posted as [`ConnectionError::Fault`].
async fn run_half<F>(id: u64, task: &'static str, errors: &mpsc::Sender<ConnectionError>, half: F)
where
    F: Future<Output = Result<(), ConnectionError>>,
{
    let result = catch_fault(half).await.unwrap_or_else(|fault| {
        error!(client = id, task, error = %fault, "Caught panic in connection task");
        Err(ConnectionError::Fault {
            task,
            message: fault.message,
        })
    });

    if let Err(e) = result {
        debug!(client = id, task, error = %e, "Connection task failed");
        // Only the first error matters
        let _ = errors.try_send(e);
    }
}

async fn writer_task(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::Receiver<Arc<Message>>,
    errors: mpsc::Sender<ConnectionError>,
    stop: CancellationToken,
    settings: ConnectionSettings,
) {
    let write = write_loop(id, &mut writer, &mut inbox, &stop, settings);
    run_half(id, "writer", &errors, write).await;
}

async fn write_loop(
    id: u64,
    writer: &mut OwnedWriteHalf,
    inbox: &mut mpsc::Receiver<Arc<Message>>,
    stop: &CancellationToken,
    settings: ConnectionSettings,
) -> Result<(), ConnectionError> {
    let period = settings.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),

            msg = inbox.recv() => match msg {
                Some(msg) => {
                    trace!(client = id, id = msg.id, kind = %msg.kind, "Writing message");
                    write_message(writer, settings.timeout, &msg, settings.max_frame_len).await?;
                }
                None => {
                    // Removed from the registry by the event loop
                    debug!(client = id, "Client queue closed");
                    stop.cancel();
                    return Ok(());
                }
            },

            _ = heartbeat.tick() => {
                trace!(client = id, "Sending ping");
                write_message(writer, settings.timeout, &Message::ping(), settings.max_frame_len).await?;
            }
        }
    }
}

async fn reader_task(
    id: u64,
    reader: OwnedReadHalf,
    outbox: mpsc::Sender<Message>,
    errors: mpsc::Sender<ConnectionError>,
    stop: CancellationToken,
    settings: ConnectionSettings,
) {
    let mut reader = BufReader::new(reader);

    let read = read_loop(id, &mut reader, &outbox, &stop, settings);
    run_half(id, "reader", &errors, read).await;
}

async fn read_loop(
    id: u64,
    reader: &mut BufReader<OwnedReadHalf>,
    outbox: &mpsc::Sender<Message>,
    stop: &CancellationToken,
    settings: ConnectionSettings,
) -> Result<(), ConnectionError> {
    loop {
        // Each read gets a fresh deadline; a pong arriving in time is the
        // only liveness evidence needed.
        let msg = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            msg = read_message(reader, settings.timeout, settings.max_frame_len) => msg?,
        };

        if msg.is_pong() {
            trace!(client = id, "Received pong");
            continue;
        }

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            sent = outbox.send(msg) => {
                if sent.is_err() {
                    debug!(client = id, "Event loop gone, closing connection");
                    stop.cancel();
                    return Ok(());
                }
            }
        }
    }
}

async fn coordinator_task(
    id: u64,
    peer: SocketAddr,
    mut errors: mpsc::Receiver<ConnectionError>,
    stop: CancellationToken,
) {
    let waited = catch_fault(async {
        tokio::select! {
            err = errors.recv() => {
                if let Some(err) = err {
                    debug!(client = id, peer = %peer, error = %err, "Connection failed");
                }
            }
            _ = stop.cancelled() => {}
        }
    })
    .await;

    if let Err(fault) = waited {
        error!(client = id, error = %fault, "Caught panic in stopper");
    }

    stop.cancel();
    debug!(client = id, peer = %peer, "Connection closed");
}
