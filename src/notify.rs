//! systemd supervisor integration.
//!
//! Readiness and stop notifications plus watchdog pings, all sent as
//! datagrams to the socket advertised in `NOTIFY_SOCKET`. Everything here
//! is best-effort; a daemon without a supervisor just skips it.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use tracing::warn;

pub fn notify_ready() {
    notify("READY=1");
}

pub fn notify_stopping() {
    notify("STOPPING=1");
}

fn notify(state: &str) {
    let Some(socket_path) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    match UnixDatagram::unbound() {
        Ok(socket) => {
            if let Err(err) = socket.send_to(state.as_bytes(), &socket_path) {
                warn!(state, error = %err, "failed to notify supervisor");
            }
        }
        Err(err) => warn!(error = %err, "failed to create notify socket"),
    }
}

/// Starts the watchdog task when `WATCHDOG_USEC` is advertised, pinging
/// at half the supervisor's interval.
pub fn spawn_watchdog() {
    let Ok(value) = std::env::var("WATCHDOG_USEC") else {
        return;
    };
    let usec: u64 = match value.parse() {
        Ok(usec) => usec,
        Err(_) => {
            warn!(value = %value, "invalid WATCHDOG_USEC");
            return;
        }
    };
    let interval = Duration::from_micros(usec / 2);
    if interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            notify("WATCHDOG=1");
        }
    });
}
