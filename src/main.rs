//! fortilink-helper: privileged daemon brokering openfortivpn for
//! unprivileged desktop clients.
//!
//! Runs as a systemd service with root privileges and manages the VPN
//! client process on behalf of GUI clients attached over a UNIX socket.

mod notify;

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use fortilink_core::helper::manager::Manager;
use fortilink_core::helper::server::{
    RequestHandler, Server, DEFAULT_SOCKET_GROUP, DEFAULT_SOCKET_PATH,
};
use fortilink_core::vpn::Controller;

const DEFAULT_OPENFORTIVPN_PATH: &str = "/usr/bin/openfortivpn";

#[derive(Parser)]
#[command(
    name = "fortilink-helper",
    version,
    about = "Privileged helper daemon for openfortivpn desktop clients"
)]
struct Args {
    /// Path to the UNIX socket.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: std::path::PathBuf,

    /// Path to the openfortivpn binary.
    #[arg(long, default_value = DEFAULT_OPENFORTIVPN_PATH)]
    openfortivpn: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = fortilink_core::init_logging() {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }
    info!(version = env!("CARGO_PKG_VERSION"), "starting fortilink-helper");

    if which::which(&args.openfortivpn).is_err() {
        error!(path = %args.openfortivpn.display(), "openfortivpn binary not found");
        std::process::exit(1);
    }

    let controller = Arc::new(Controller::elevated(
        args.openfortivpn.to_string_lossy().into_owned(),
    ));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let manager = Manager::new(controller, event_tx);
    let server = Arc::new(Server::new(
        args.socket,
        Some(DEFAULT_SOCKET_GROUP.to_string()),
        Arc::clone(&manager) as Arc<dyn RequestHandler>,
        event_rx,
    ));

    if let Err(err) = server.start().await {
        error!(error = %err, "failed to start helper server");
        std::process::exit(1);
    }

    notify::notify_ready();
    notify::spawn_watchdog();

    wait_for_shutdown().await;
    info!("received shutdown signal");

    notify::notify_stopping();
    manager.shutdown().await;
    server.stop().await;
    info!("shutdown complete");
}

async fn wait_for_shutdown() {
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}
