//! Wire-level types shared by the broker and hook clients.
//!
//! Field names on the wire are `Type`, `Data` and `ID`, matching what
//! existing hook clients encode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Heartbeat sent by the broker.
pub const PING: &str = "ping";

/// Heartbeat reply sent by hook clients. Never forwarded.
pub const PONG: &str = "pong";

/// Conventional type tag for chat bodies.
pub const MESSAGE: &str = "message";

/// Key under which chat bodies travel in `Data`.
pub const BODY: &str = "body";

/// ID carried by heartbeat pings.
pub const HEARTBEAT_ID: i64 = -1;

/// A semantic unit pushed by the chat layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// Type tag (e.g. `message`)
    pub kind: String,
    /// Optional string payload
    pub data: Option<BTreeMap<String, String>>,
}

impl Event {
    /// Create an event without data.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
        }
    }

    /// Create a chat `message` event carrying `body`.
    pub fn message(body: impl Into<String>) -> Self {
        Self::new(MESSAGE).with(BODY, body)
    }

    /// Add one key/value pair to the payload.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// An event with a sequence number, as framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Data", default)]
    pub data: Option<BTreeMap<String, String>>,
    #[serde(rename = "ID", default)]
    pub id: i64,
}

impl Message {
    /// Attach a sequence number to an event.
    pub fn new(event: Event, id: i64) -> Self {
        Self {
            kind: event.kind,
            data: event.data,
            id,
        }
    }

    /// The heartbeat ping written by connection writers.
    pub fn ping() -> Self {
        Self {
            kind: PING.to_string(),
            data: None,
            id: HEARTBEAT_ID,
        }
    }

    pub fn is_pong(&self) -> bool {
        self.kind == PONG
    }

    /// Look up a payload value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key).map(String::as_str)
    }

    /// The chat body, empty when absent.
    pub fn body(&self) -> &str {
        self.get(BODY).unwrap_or_default()
    }
}

/// Control commands accepted by the event loop.
///
/// Commands carry no behavior yet; the loop logs and discards them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Opaque(String),
}

impl From<String> for Command {
    fn from(cmd: String) -> Self {
        Command::Opaque(cmd)
    }
}

impl From<&str> for Command {
    fn from(cmd: &str) -> Self {
        Command::Opaque(cmd.to_string())
    }
}
