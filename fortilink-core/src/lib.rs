//! Core library for the fortilink helper daemon.
//!
//! Brokers a single openfortivpn process on behalf of unprivileged
//! desktop clients: session control, output parsing, and the UNIX socket
//! protocol shared by the daemon and its clients.

pub mod error;
pub mod helper;
pub mod profile;
pub mod vpn;

/// Initialize logging infrastructure.
///
/// Structured JSON records go to stdout at info level; setting the
/// `FORTILINK_DEBUG` environment variable switches to debug.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if std::env::var_os("FORTILINK_DEBUG").is_some() {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout))
        .with(level)
        .init();

    Ok(())
}
