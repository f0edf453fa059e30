//! Command dispatch for the helper daemon.
//!
//! Translates wire requests into controller operations and controller
//! callbacks into broadcast events. Also the place where client-supplied
//! certificate paths are checked before they reach a root process.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::helper::protocol::{
    Command, ConnectParams, ErrorData, Event, EventName, OutputData, Request, Response,
    StateChangeData, StatusResult, VpnEventData, ERR_CONNECTION_FAILED, ERR_DISCONNECT_FAILED,
    ERR_INTERNAL_ERROR, ERR_INVALID_COMMAND, ERR_INVALID_PARAMS, ERR_INVALID_STATE,
    ERR_PROFILE_INVALID,
};
use crate::helper::server::RequestHandler;
use crate::profile::Profile;
use crate::vpn::controller::{ConnectOptions, VpnController};
use crate::vpn::state::ConnectionState;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Filesystem locations client certificate paths must never resolve into.
/// Errors from a root process reading these could leak their contents.
const SENSITIVE_PATH_PREFIXES: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/passwd",
    "/etc/group",
    "/etc/ssh/",
    "/etc/security/",
    "/etc/pam.d/",
    "/etc/krb5.keytab",
    "/root/",
    "/proc/",
    "/sys/",
    "/dev/",
    "/boot/",
    "/var/lib/secrets/",
    "/var/log/",
];

/// Owns the controller on behalf of the socket server and keeps track of
/// which profile the active session belongs to.
pub struct Manager {
    controller: Arc<dyn VpnController>,
    connected_profile_id: Arc<Mutex<String>>,
}

impl Manager {
    /// Creates a manager and wires the controller callbacks to the event
    /// channel consumed by the server's broadcast task.
    pub fn new(
        controller: Arc<dyn VpnController>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            controller: Arc::clone(&controller),
            connected_profile_id: Arc::new(Mutex::new(String::new())),
        });

        {
            let events = events.clone();
            let profile_id = Arc::clone(&manager.connected_profile_id);
            controller.on_state_change(Arc::new(move |old, new| {
                match Event::new(EventName::StateChange, &StateChangeData { from: old, to: new }) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(err) => tracing::error!(error = %err, "failed to encode state change event"),
                }
                // The session is over either way; forget its profile.
                if matches!(new, ConnectionState::Disconnected | ConnectionState::Failed) {
                    profile_id.lock().unwrap().clear();
                }
            }));
        }
        {
            let events = events.clone();
            controller.on_output(Arc::new(move |line| {
                match Event::new(
                    EventName::Output,
                    &OutputData {
                        line: line.to_string(),
                    },
                ) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(err) => tracing::error!(error = %err, "failed to encode output event"),
                }
            }));
        }
        {
            let events = events.clone();
            controller.on_event(Arc::new(move |output_event| {
                match Event::new(EventName::VpnEvent, &VpnEventData::from_event(output_event)) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(err) => tracing::error!(error = %err, "failed to encode VPN event"),
                }
            }));
        }
        {
            controller.on_error(Arc::new(move |err| {
                match Event::new(
                    EventName::Error,
                    &ErrorData {
                        message: err.to_string(),
                    },
                ) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(err) => tracing::error!(error = %err, "failed to encode error event"),
                }
            }));
        }

        manager
    }

    /// Processes one request and produces the response.
    pub async fn handle(&self, request: Request) -> Response {
        match request.command {
            Command::Connect => self.handle_connect(request).await,
            Command::Disconnect => self.handle_disconnect(request).await,
            Command::Status => self.handle_status(request),
            Command::Unknown => {
                Response::error(request.id, ERR_INVALID_COMMAND, "unknown command")
            }
        }
    }

    async fn handle_connect(&self, request: Request) -> Response {
        let params: ConnectParams = match serde_json::from_value(request.params.clone()) {
            Ok(params) => params,
            Err(_) => {
                return Response::error(request.id, ERR_INVALID_PARAMS, "invalid connect params")
            }
        };

        if let Err(err) = validate_credential_path(&params.client_cert_path) {
            return Response::error(
                request.id,
                ERR_INVALID_PARAMS,
                format!("invalid client cert path: {err}"),
            );
        }
        if let Err(err) = validate_credential_path(&params.client_key_path) {
            return Response::error(
                request.id,
                ERR_INVALID_PARAMS,
                format!("invalid client key path: {err}"),
            );
        }

        let port = match u16::try_from(params.port) {
            Ok(port) => port,
            Err(_) => {
                return Response::error(
                    request.id,
                    ERR_PROFILE_INVALID,
                    "invalid profile: port must be between 1 and 65535",
                )
            }
        };

        let profile = Profile {
            id: params.profile_id.clone(),
            name: "helper-connection".to_string(),
            description: String::new(),
            host: params.host.clone(),
            port,
            auth_method: params.auth_method,
            username: params.username.clone(),
            realm: params.realm.clone(),
            trusted_cert: params.trusted_cert.clone(),
            client_cert_path: params.client_cert_path.clone(),
            client_key_path: params.client_key_path.clone(),
            set_dns: params.set_dns,
            set_routes: params.set_routes,
            half_internet_routes: params.half_internet_routes,
            auto_reconnect: false,
        };
        if let Err(err) = profile.validate() {
            return Response::error(
                request.id,
                ERR_PROFILE_INVALID,
                format!("invalid profile: {err}"),
            );
        }

        // The state check and the profile-id reservation share one
        // critical section so two racing connects cannot both pass.
        {
            let mut connected = self.connected_profile_id.lock().unwrap();
            if !self.controller.can_connect() {
                return Response::error(
                    request.id,
                    ERR_INVALID_STATE,
                    format!(
                        "cannot connect: current state is {}",
                        self.controller.state()
                    ),
                );
            }
            connected.clone_from(&params.profile_id);
        }

        let options = ConnectOptions {
            password: SecretString::new(params.password.clone()),
            otp: if params.otp.is_empty() {
                None
            } else {
                Some(params.otp.clone())
            },
        };

        if let Err(err) = self.controller.connect(&profile, &options).await {
            self.connected_profile_id.lock().unwrap().clear();
            return Response::error(request.id, ERR_CONNECTION_FAILED, err.to_string());
        }

        Response::success(request.id, None)
    }

    async fn handle_disconnect(&self, request: Request) -> Response {
        if !self.controller.can_disconnect() {
            return Response::error(
                request.id,
                ERR_INVALID_STATE,
                format!(
                    "cannot disconnect: current state is {}",
                    self.controller.state()
                ),
            );
        }

        if let Err(err) = self.controller.disconnect().await {
            // The session is logically gone even when the kill misbehaves.
            self.connected_profile_id.lock().unwrap().clear();
            return Response::error(request.id, ERR_DISCONNECT_FAILED, err.to_string());
        }

        self.connected_profile_id.lock().unwrap().clear();
        Response::success(request.id, None)
    }

    fn handle_status(&self, request: Request) -> Response {
        let result = StatusResult {
            state: self.controller.state(),
            assigned_ip: self.controller.assigned_ip(),
            connected_profile_id: self.connected_profile_id.lock().unwrap().clone(),
        };
        match serde_json::to_value(&result) {
            Ok(value) => Response::success(request.id, Some(value)),
            Err(err) => Response::error(request.id, ERR_INTERNAL_ERROR, err.to_string()),
        }
    }

    /// Current VPN state.
    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Gracefully disconnects the VPN if a session is active, bounded so
    /// daemon shutdown cannot hang on a stuck kill.
    pub async fn shutdown(&self) {
        if !self.controller.can_disconnect() {
            return;
        }
        tracing::info!("disconnecting VPN before shutdown");
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.controller.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to disconnect during shutdown");
            }
            Err(_) => {
                tracing::error!(timeout = ?SHUTDOWN_TIMEOUT, "disconnect timed out during shutdown");
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Manager {
    async fn handle_request(&self, request: Request) -> Response {
        self.handle(request).await
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
enum PathError {
    #[error("path traversal not allowed")]
    Traversal,

    #[error("path must be absolute")]
    NotAbsolute,

    #[error("access to sensitive system path not allowed")]
    Sensitive,

    #[error("failed to resolve path: {0}")]
    Resolve(String),
}

/// Validates a client-supplied certificate or key path: absolute, no
/// `..`, and after symlink resolution outside the sensitive set. A path
/// that does not exist passes; the VPN client will report it itself.
fn validate_credential_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Ok(());
    }
    // Checked before any normalization, which would fold the dots away.
    if path.contains("..") {
        return Err(PathError::Traversal);
    }
    if !Path::new(path).is_absolute() {
        return Err(PathError::NotAbsolute);
    }

    let resolved = match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(PathError::Resolve(err.to_string())),
    };

    if is_sensitive_path(&resolved) {
        return Err(PathError::Sensitive);
    }
    Ok(())
}

fn is_sensitive_path(path: &Path) -> bool {
    let text = path.to_string_lossy();
    SENSITIVE_PATH_PREFIXES
        .iter()
        .any(|prefix| text == *prefix || text.starts_with(prefix))
}
