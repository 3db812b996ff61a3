//! Configuration module for the hook bridge.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Everything is
//! resolved once at startup.

use crate::error::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default hook listener address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:1984";

/// Capacity of each client's inbound queue
pub const DEFAULT_CLIENT_QUEUE: usize = 8;

/// Capacity of the chat-origin, control and registration intakes
pub const DEFAULT_INBOX_QUEUE: usize = 4;

/// Capacity of the shared client-originated intake
pub const DEFAULT_OUTBOX_QUEUE: usize = 4;

/// Interval between heartbeat pings, in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 5;

/// Read/write deadline on hook sockets, in seconds
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 10;

/// Largest frame payload accepted or produced
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024;

/// Group chat that client messages are forwarded to
pub const DEFAULT_CHAT_ROOM: &str = "golang@conference.jabber.ru";

/// Bound on one chat-write call, in seconds
pub const DEFAULT_CHAT_WRITE_TIMEOUT: u64 = 5;

/// Command-line arguments for the bridge
#[derive(Parser, Debug)]
#[command(name = "hookbridge")]
#[command(author = "hookbridge authors")]
#[command(version = "0.1.0")]
#[command(about = "Fan chat events out to hook processes over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind the hook listener to (e.g., 127.0.0.1:1984)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Group chat that hook replies are sent to
    #[arg(short = 'r', long)]
    pub room: Option<String>,

    /// Seconds between heartbeat pings
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Seconds before a silent hook connection is dropped
    #[arg(long)]
    pub heartbeat_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Channel capacities
#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_client_queue")]
    pub client: usize,
    #[serde(default = "default_inbox_queue")]
    pub inbox: usize,
    #[serde(default = "default_inbox_queue")]
    pub control: usize,
    #[serde(default = "default_outbox_queue")]
    pub outbox: usize,
    #[serde(default = "default_inbox_queue")]
    pub registrations: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            client: default_client_queue(),
            inbox: default_inbox_queue(),
            control: default_inbox_queue(),
            outbox: default_outbox_queue(),
            registrations: default_inbox_queue(),
        }
    }
}

/// Heartbeat timing
#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Outbound chat settings
#[derive(Debug, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_room")]
    pub room: String,
    #[serde(default = "default_chat_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            room: default_chat_room(),
            write_timeout_secs: default_chat_write_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_client_queue() -> usize {
    DEFAULT_CLIENT_QUEUE
}

fn default_inbox_queue() -> usize {
    DEFAULT_INBOX_QUEUE
}

fn default_outbox_queue() -> usize {
    DEFAULT_OUTBOX_QUEUE
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_chat_room() -> String {
    DEFAULT_CHAT_ROOM.to_string()
}

fn default_chat_write_timeout() -> u64 {
    DEFAULT_CHAT_WRITE_TIMEOUT
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub client_queue: usize,
    pub inbox_queue: usize,
    pub control_queue: usize,
    pub outbox_queue: usize,
    pub registration_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_frame_len: usize,
    pub chat_room: String,
    pub chat_write_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Self::from_toml(toml_config);

        // Merge CLI args (CLI takes precedence)
        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        if let Some(room) = cli.room {
            config.chat_room = room;
        }
        if let Some(secs) = cli.heartbeat_interval {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.heartbeat_timeout {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_toml(toml: TomlConfig) -> Self {
        Config {
            listen: toml.server.listen,
            client_queue: toml.queues.client,
            inbox_queue: toml.queues.inbox,
            control_queue: toml.queues.control,
            outbox_queue: toml.queues.outbox,
            registration_queue: toml.queues.registrations,
            heartbeat_interval: Duration::from_secs(toml.heartbeat.interval_secs),
            heartbeat_timeout: Duration::from_secs(toml.heartbeat.timeout_secs),
            max_frame_len: toml.protocol.max_frame_len,
            chat_room: toml.chat.room,
            chat_write_timeout: Duration::from_secs(toml.chat.write_timeout_secs),
            log_level: toml.logging.level,
        }
    }

    /// Reject values the runtime cannot honor.
    ///
    /// Channels cannot have zero capacity, timers cannot have zero period,
    /// and the length prefix is two bytes wide.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queues = [
            ("queues.client", self.client_queue),
            ("queues.inbox", self.inbox_queue),
            ("queues.control", self.control_queue),
            ("queues.outbox", self.outbox_queue),
            ("queues.registrations", self.registration_queue),
        ];
        for (name, capacity) in queues {
            if capacity == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        let durations = [
            ("heartbeat.interval", self.heartbeat_interval),
            ("heartbeat.timeout", self.heartbeat_timeout),
            ("chat.write_timeout", self.chat_write_timeout),
        ];
        for (name, duration) in durations {
            if duration.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        if self.max_frame_len == 0 || self.max_frame_len > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "protocol.max_frame_len must be between 1 and {}",
                u16::MAX
            )));
        }

        Ok(())
    }
}
