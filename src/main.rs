//! hookbridge: console bridge for the hook executor
//!
//! Stands in for the chat session:
//! - Each stdin line is broadcast to hook clients as a `message` event
//! - Lines starting with `/` are passed to the executor as commands
//! - Hook replies are logged instead of being sent to a chat room
//!
//! Configuration via CLI arguments or TOML file.

use hookbridge::{Config, Event, Executor, ExecutorHandle, LogSink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        room = %config.chat_room,
        max_frame_len = config.max_frame_len,
        "Starting hookbridge"
    );

    let handle = Executor::new(config, LogSink).start();
    if let Some(addr) = handle.listening_addr().await {
        info!(address = %addr, "Waiting for hook clients");
    } else {
        warn!("Hook listener unavailable, events will not be delivered");
    }

    tokio::select! {
        result = pump_stdin(&handle) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    handle.shutdown().await;
    Ok(())
}

/// Feed stdin lines to the executor until EOF.
async fn pump_stdin(handle: &ExecutorHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(cmd) = line.strip_prefix('/') {
            handle.run(cmd).await?;
        } else {
            handle.new_event(Event::message(line)).await?;
        }
    }

    info!("Input closed");
    Ok(())
}
