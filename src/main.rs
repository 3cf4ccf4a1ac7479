//! Entry point for the line-reverser server.

use line_reverser::config::Config;
use line_reverser::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        read_buffer = config.read_buffer_size,
        write_buffer = config.write_buffer_size,
        idle_timeout = ?config.idle_timeout,
        "Starting line-reverser server"
    );

    runtime::run(config)?;
    Ok(())
}
