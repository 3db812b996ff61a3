//! Error types for the broker.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to read or write one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deadline of {0:?} elapsed")]
    Timeout(Duration),

    #[error("message is too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Reason a connection pair is torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("caught panic in {task}: {message}")]
    Fault { task: &'static str, message: String },
}

/// Failure reported by the chat-write collaborator.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat stream write failed: {0}")]
    Write(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("chat stream write timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the executor control surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor is stopped")]
    Stopped,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
