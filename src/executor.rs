//! The hook executor: event loop plus control surface.
//!
//! One task owns the client registry and the message counter. Everything
//! else talks to it through bounded channels:
//!
//! ```text
//! chat layer --Event--> [events]        \
//! host       --Command--> [commands]     \
//! acceptor   --RegistrationRequest-->     >-- event loop --> registry --> client queues
//! readers    --Message--> [outbox]       /                \-> ChatSink
//! ```
//!
//! Shutdown is an explicit signal. A closed intake only means that source
//! has nothing more to say; the loop keeps serving the others and exits once
//! the chat intakes and the acceptor are all gone.

use crate::chat::{ChatSink, GroupMessage};
use crate::config::Config;
use crate::connection::ConnectionSettings;
use crate::error::{ChatError, ExecutorError};
use crate::event::{Command, Event, Message};
use crate::listener::{Acceptor, ListenerState, RegistrationRequest};
use crate::registry::Registry;
use crate::supervisor::restart_on_fault;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A configured executor that has not been started.
pub struct Executor {
    config: Config,
    sink: Arc<dyn ChatSink>,
}

impl Executor {
    /// Create an executor that forwards hook replies to `sink`.
    pub fn new(config: Config, sink: impl ChatSink + 'static) -> Self {
        Self {
            config,
            sink: Arc::new(sink),
        }
    }

    /// Spawn the acceptor and the event loop on the current Tokio runtime.
    ///
    /// Consumes the executor, so one instance cannot be started twice.
    pub fn start(self) -> ExecutorHandle {
        let Executor { config, sink } = self;

        let (events_tx, events) = mpsc::channel(config.inbox_queue);
        let (commands_tx, commands) = mpsc::channel(config.control_queue);
        let (registrations_tx, registrations) = mpsc::channel(config.registration_queue);
        let (outbox_tx, outbox) = mpsc::channel(config.outbox_queue);
        let (state_tx, state) = watch::channel(ListenerState::Pending);
        let shutdown = CancellationToken::new();

        let acceptor = Acceptor {
            listen: config.listen.clone(),
            registrations: registrations_tx,
            settings: ConnectionSettings::from(&config),
            state: state_tx,
            shutdown: shutdown.clone(),
        };

        let event_loop = EventLoop {
            registry: Registry::new(config.client_queue),
            counter: 0,
            events,
            events_open: true,
            commands,
            commands_open: true,
            registrations,
            registrations_open: true,
            outbox,
            outbox_tx,
            sink,
            room: config.chat_room.clone(),
            chat_timeout: config.chat_write_timeout,
            shutdown: shutdown.clone(),
        };

        let tasks = vec![
            tokio::spawn(acceptor.supervise()),
            tokio::spawn(event_loop.supervise()),
        ];

        info!(
            listen = %config.listen,
            room = %config.chat_room,
            client_queue = config.client_queue,
            heartbeat_interval = ?config.heartbeat_interval,
            heartbeat_timeout = ?config.heartbeat_timeout,
            "Hook executor started"
        );

        ExecutorHandle {
            events: EventSender {
                events: events_tx,
                shutdown: shutdown.clone(),
            },
            commands: commands_tx,
            shutdown,
            state,
            tasks,
        }
    }
}

/// Cloneable push capability for the chat layer.
#[derive(Debug, Clone)]
pub struct EventSender {
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
}

impl EventSender {
    /// Queue a chat-origin event for broadcast.
    ///
    /// Waits while the intake is full.
    pub async fn new_event(&self, event: Event) -> Result<(), ExecutorError> {
        if self.shutdown.is_cancelled() {
            return Err(ExecutorError::Stopped);
        }
        self.events
            .send(event)
            .await
            .map_err(|_| ExecutorError::Stopped)
    }
}

/// Control surface of a running executor.
pub struct ExecutorHandle {
    events: EventSender,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    state: watch::Receiver<ListenerState>,
    tasks: Vec<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Queue a chat-origin event for broadcast.
    pub async fn new_event(&self, event: Event) -> Result<(), ExecutorError> {
        self.events.new_event(event).await
    }

    /// A sender the chat layer can keep.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Queue a control command. Commands are logged and otherwise ignored.
    pub async fn run(&self, cmd: impl Into<Command>) -> Result<(), ExecutorError> {
        if self.shutdown.is_cancelled() {
            return Err(ExecutorError::Stopped);
        }
        self.commands
            .send(cmd.into())
            .await
            .map_err(|_| ExecutorError::Stopped)
    }

    /// Request shutdown. Returns immediately.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Current acceptor state.
    pub fn listener_state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait for the acceptor to bind and return its address, or `None` if
    /// hooks are disabled or closed.
    pub async fn listening_addr(&self) -> Option<SocketAddr> {
        let mut state = self.state.clone();
        let current = *state
            .wait_for(|s| *s != ListenerState::Pending)
            .await
            .ok()?;
        match current {
            ListenerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Stop and wait for the acceptor and event loop to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!(error = %e, "Executor task failed");
            }
        }
        info!("Hook executor stopped");
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State owned by the event loop task.
struct EventLoop {
    registry: Registry,
    counter: i64,
    events: mpsc::Receiver<Event>,
    events_open: bool,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    registrations: mpsc::Receiver<RegistrationRequest>,
    registrations_open: bool,
    outbox: mpsc::Receiver<Message>,
    outbox_tx: mpsc::Sender<Message>,
    sink: Arc<dyn ChatSink>,
    room: String,
    chat_timeout: Duration,
    shutdown: CancellationToken,
}

impl EventLoop {
    /// Run the loop, restarting it with its state intact whenever it panics.
    async fn supervise(mut self) {
        restart_on_fault(
            "event loop",
            Duration::ZERO,
            &mut self,
            |event_loop| event_loop.run().boxed(),
            |event_loop, _| {
                debug!(
                    counter = event_loop.counter,
                    clients = event_loop.registry.len(),
                    "Event loop state kept across restart"
                );
            },
        )
        .await;

        self.registry.shutdown();
        debug!(counter = self.counter, "Event loop exited");
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,

                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        debug!("Chat event intake closed");
                        self.events_open = false;
                    }
                },

                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("Command intake closed");
                        self.commands_open = false;
                    }
                },

                req = self.registrations.recv(), if self.registrations_open => match req {
                    Some(req) => self.register(req),
                    None => {
                        debug!("Registration intake closed");
                        self.registrations_open = false;
                    }
                },

                Some(msg) = self.outbox.recv() => self.forward(msg).await,
            }

            if !self.events_open && !self.commands_open && !self.registrations_open {
                debug!("All intakes closed");
                return;
            }
        }
    }

    /// Number and broadcast one chat-origin event.
    fn dispatch(&mut self, event: Event) {
        let id = self.counter;
        self.counter += 1;

        trace!(id, kind = %event.kind, "Broadcasting event");
        let pruned = self.registry.broadcast(Message::new(event, id));
        if pruned > 0 {
            warn!(pruned, clients = self.registry.len(), "Dropped unresponsive clients");
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Opaque(cmd) => info!(cmd = %cmd, "Ignoring command"),
        }
    }

    fn register(&mut self, req: RegistrationRequest) {
        let handles = self.registry.register(req.peer, &self.outbox_tx);
        if req.reply.send(handles).is_err() {
            // The dead entry goes away on the next broadcast
            debug!(peer = %req.peer, "Acceptor dropped registration reply");
        }
    }

    /// Hand a client message to the chat session, bounded by `chat_timeout`.
    async fn forward(&self, msg: Message) {
        trace!(kind = %msg.kind, id = msg.id, "Forwarding client message");
        let stanza = GroupMessage::from_client(&self.room, &msg);

        let result = match tokio::time::timeout(self.chat_timeout, self.sink.send(stanza)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout(self.chat_timeout)),
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to write message to chat stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_message, write_message};
    use crate::error::FrameError;
    use async_trait::async_trait;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    const MAX: usize = 4096;
    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Records forwarded stanzas. A `boom` body panics, a `stall` body
    /// never completes and a `refused` body fails the write.
    struct RecordingSink {
        sent: mpsc::UnboundedSender<GroupMessage>,
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send(&self, msg: GroupMessage) -> Result<(), ChatError> {
            match msg.body.as_str() {
                "boom" => panic!("sink exploded"),
                "stall" => std::future::pending::<()>().await,
                "refused" => {
                    let cause = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream closed");
                    return Err(ChatError::Write(Box::new(cause)));
                }
                _ => {}
            }
            let _ = self.sent.send(msg);
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            chat_room: "hooks@conference.example.org".to_string(),
            chat_write_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    async fn start() -> (ExecutorHandle, SocketAddr, mpsc::UnboundedReceiver<GroupMessage>) {
        let (sent, forwarded) = mpsc::unbounded_channel();
        let handle = Executor::new(test_config(), RecordingSink { sent }).start();
        let addr = handle.listening_addr().await.unwrap();
        (handle, addr, forwarded)
    }

    fn reply(body: &str, id: i64) -> Message {
        Message::new(Event::new("reply").with("body", body), id)
    }

    /// Connect and wait until the event loop has registered the client.
    ///
    /// A client message can only be forwarded once registration completed.
    async fn connect(
        addr: SocketAddr,
        forwarded: &mut mpsc::UnboundedReceiver<GroupMessage>,
    ) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        write_message(&mut client, TIMEOUT, &reply("hello", 0), MAX)
            .await
            .unwrap();
        let stanza = tokio::time::timeout(TIMEOUT, forwarded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stanza.body, "hello");
        client
    }

    async fn next_message(client: &mut TcpStream) -> Message {
        loop {
            let msg = read_message(client, TIMEOUT, MAX).await.unwrap();
            if msg.kind != "ping" {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_chat_event_reaches_client() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;

        handle.new_event(Event::message("hi")).await.unwrap();

        let msg = next_message(&mut a).await;
        assert_eq!(msg, Message::new(Event::message("hi"), 0));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_reply_reaches_chat() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;

        write_message(&mut a, TIMEOUT, &reply("yo", 7), MAX)
            .await
            .unwrap();

        let stanza = tokio::time::timeout(TIMEOUT, forwarded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stanza,
            GroupMessage {
                to: "hooks@conference.example.org".to_string(),
                body: "yo".to_string(),
            }
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_client_gets_every_event_in_order() {
        let (handle, addr, mut forwarded) = start().await;
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(addr, &mut forwarded).await);
        }

        for n in 0..8 {
            handle
                .new_event(Event::message(format!("event {n}")))
                .await
                .unwrap();
        }

        for client in &mut clients {
            for expected in 0..8 {
                let msg = next_message(client).await;
                assert_eq!(msg.id, expected);
                assert_eq!(msg.body(), format!("event {expected}"));
            }
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_sink_restarts_loop_with_state() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;

        handle.new_event(Event::message("before")).await.unwrap();
        assert_eq!(next_message(&mut a).await.id, 0);

        write_message(&mut a, TIMEOUT, &reply("boom", 1), MAX)
            .await
            .unwrap();

        // Registry and counter survive the restart
        handle.new_event(Event::message("after")).await.unwrap();
        let msg = next_message(&mut a).await;
        assert_eq!(msg.id, 1);
        assert_eq!(msg.body(), "after");

        write_message(&mut a, TIMEOUT, &reply("still forwarding", 2), MAX)
            .await
            .unwrap();
        let stanza = tokio::time::timeout(TIMEOUT, forwarded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stanza.body, "still forwarding");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stuck_sink_does_not_stall_loop() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;

        write_message(&mut a, TIMEOUT, &reply("stall", 1), MAX)
            .await
            .unwrap();

        handle.new_event(Event::message("hi")).await.unwrap();
        let msg = next_message(&mut a).await;
        assert_eq!(msg.body(), "hi");

        write_message(&mut a, TIMEOUT, &reply("unstuck", 2), MAX)
            .await
            .unwrap();
        let stanza = tokio::time::timeout(TIMEOUT, forwarded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stanza.body, "unstuck");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_chat_write_is_skipped() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;

        write_message(&mut a, TIMEOUT, &reply("refused", 1), MAX)
            .await
            .unwrap();
        write_message(&mut a, TIMEOUT, &reply("next", 2), MAX)
            .await
            .unwrap();

        let stanza = tokio::time::timeout(TIMEOUT, forwarded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stanza.body, "next");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_are_accepted_and_ignored() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;

        handle.run("reload").await.unwrap();
        handle.new_event(Event::message("hi")).await.unwrap();

        assert_eq!(next_message(&mut a).await.id, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_closes_intake_and_connections() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;
        let sender = handle.event_sender();

        handle.stop();

        assert_eq!(
            handle.new_event(Event::message("late")).await,
            Err(ExecutorError::Stopped)
        );
        assert_eq!(sender.new_event(Event::message("late")).await, Err(ExecutorError::Stopped));
        assert_eq!(handle.run("late").await, Err(ExecutorError::Stopped));

        loop {
            match read_message(&mut a, TIMEOUT, MAX).await {
                Ok(msg) => assert_eq!(msg.kind, "ping"),
                Err(FrameError::Io(_)) => break,
                Err(e) => panic!("connection was not closed: {e}"),
            }
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_executor() {
        let (handle, addr, mut forwarded) = start().await;
        let mut a = connect(addr, &mut forwarded).await;
        let sender = handle.event_sender();

        drop(handle);

        assert_eq!(sender.new_event(Event::message("late")).await, Err(ExecutorError::Stopped));
        loop {
            match read_message(&mut a, TIMEOUT, MAX).await {
                Ok(msg) => assert_eq!(msg.kind, "ping"),
                Err(FrameError::Io(_)) => break,
                Err(e) => panic!("connection was not closed: {e}"),
            }
        }

        // The acceptor releases the port
        tokio::time::timeout(TIMEOUT, async {
            while TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_handle_usable() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            listen: taken.local_addr().unwrap().to_string(),
            ..test_config()
        };
        let (sent, _forwarded) = mpsc::unbounded_channel();
        let handle = Executor::new(config, RecordingSink { sent }).start();

        assert_eq!(handle.listening_addr().await, None);
        assert_eq!(handle.listener_state(), ListenerState::Disabled);
        handle.new_event(Event::message("nobody listens")).await.unwrap();

        handle.shutdown().await;
    }

    fn bare_loop(client_queue: usize) -> EventLoop {
        let (_events_tx, events) = mpsc::channel(4);
        let (_commands_tx, commands) = mpsc::channel(4);
        let (_registrations_tx, registrations) = mpsc::channel(4);
        let (outbox_tx, outbox) = mpsc::channel(4);
        let (sent, _forwarded) = mpsc::unbounded_channel();

        EventLoop {
            registry: Registry::new(client_queue),
            counter: 0,
            events,
            events_open: true,
            commands,
            commands_open: true,
            registrations,
            registrations_open: true,
            outbox,
            outbox_tx,
            sink: Arc::new(RecordingSink { sent }),
            room: "room".to_string(),
            chat_timeout: Duration::from_secs(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn register(event_loop: &mut EventLoop) -> crate::registry::ClientHandles {
        let (reply, mut response) = oneshot::channel();
        event_loop.register(RegistrationRequest {
            peer: "127.0.0.1:40000".parse().unwrap(),
            reply,
        });
        response.try_recv().unwrap()
    }

    #[test]
    fn test_ids_start_at_zero_and_increase() {
        let mut event_loop = bare_loop(8);
        let mut a = register(&mut event_loop);

        for _ in 0..4 {
            event_loop.dispatch(Event::message("x"));
        }

        let ids: Vec<i64> = (0..4).map(|_| a.inbox.try_recv().unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(event_loop.counter, 4);
    }

    #[test]
    fn test_simultaneous_saturation_prunes_both() {
        let mut event_loop = bare_loop(8);
        let mut a = register(&mut event_loop);
        let mut b = register(&mut event_loop);

        for _ in 0..9 {
            event_loop.dispatch(Event::message("x"));
        }

        assert!(event_loop.registry.is_empty());
        for client in [&mut a, &mut b] {
            for expected in 0..8 {
                assert_eq!(client.inbox.try_recv().unwrap().id, expected);
            }
            assert!(matches!(
                client.inbox.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            ));
        }

        // Later registrations are unaffected
        let mut c = register(&mut event_loop);
        event_loop.dispatch(Event::message("x"));
        assert_eq!(c.inbox.try_recv().unwrap().id, 9);
    }

    #[tokio::test]
    async fn test_loop_exits_when_all_intakes_close() {
        let mut event_loop = bare_loop(8);
        // bare_loop drops every intake sender
        tokio::time::timeout(TIMEOUT, event_loop.run()).await.unwrap();
        assert!(!event_loop.events_open);
        assert!(!event_loop.commands_open);
        assert!(!event_loop.registrations_open);
    }
}
