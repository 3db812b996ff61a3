//! Outbound seam towards the chat session.
//!
//! The broker never speaks the chat protocol itself. It hands a
//! [`GroupMessage`] to a [`ChatSink`] supplied by the host.

use crate::error::ChatError;
use crate::event::Message;
use async_trait::async_trait;
use tracing::info;

/// A groupchat stanza addressed to a fixed room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Room address (bare JID)
    pub to: String,
    /// Message body
    pub body: String,
}

impl GroupMessage {
    /// Build the stanza for a message received from a hook client.
    ///
    /// Only `Data["body"]` is carried over; the client's ID is ignored.
    pub fn from_client(room: &str, msg: &Message) -> Self {
        Self {
            to: room.to_string(),
            body: msg.body().to_string(),
        }
    }
}

/// Write capability of the chat session.
///
/// The event loop awaits `send` under a deadline, so implementations should
/// not block a runtime thread.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, msg: GroupMessage) -> Result<(), ChatError>;
}

/// Sink that only logs outgoing stanzas. Used by the console bridge.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ChatSink for LogSink {
    async fn send(&self, msg: GroupMessage) -> Result<(), ChatError> {
        info!(to = %msg.to, body = %msg.body, "Outgoing groupchat message");
        Ok(())
    }
}
