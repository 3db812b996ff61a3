//! hookbridge: fan chat events out to hook processes over TCP
//!
//! Hook clients connect to a private TCP port and receive every chat-origin
//! event as a length-prefixed MessagePack frame. Messages they send back are
//! forwarded into the chat session as groupchat messages.
//!
//! Features:
//! - Single event loop owning the client registry (no locks)
//! - Bounded per-client queues; clients that fall behind are dropped
//! - Heartbeat ping/pong with read deadlines
//! - Panic boundaries around every task, with restart for the acceptor
//!   and event loop

pub mod chat;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod executor;
pub mod listener;
pub mod registry;
pub mod supervisor;

pub use chat::{ChatSink, GroupMessage, LogSink};
pub use config::Config;
pub use error::{ChatError, ConfigError, ConnectionError, ExecutorError, FrameError};
pub use event::{Command, Event, Message};
pub use executor::{EventSender, Executor, ExecutorHandle};
pub use listener::ListenerState;
