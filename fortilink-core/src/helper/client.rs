//! Client-side proxy for the helper daemon.
//!
//! Opens one connection to the helper socket, correlates requests to
//! responses by id and replays broadcast events as controller callbacks,
//! so upper layers see the same surface as a local
//! [`Controller`](crate::vpn::Controller).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, FortilinkError, VpnError};
use crate::helper::protocol::{
    Command, ConnectParams, DisconnectParams, ErrorData, Event, EventName, OutputData, Request,
    Response, StateChangeData, StatusParams, StatusResult, VpnEventData,
};
use crate::helper::server::DEFAULT_SOCKET_PATH;
use crate::profile::Profile;
use crate::vpn::controller::{
    ConnectOptions, ErrorCallback, EventCallback, OutputCallback, StateChangeCallback,
    VpnController,
};
use crate::vpn::netif;
use crate::vpn::state::ConnectionState;

/// Default deadline for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Checks whether the helper daemon is reachable at the given socket.
pub async fn is_helper_available(socket_path: impl AsRef<Path>) -> bool {
    UnixStream::connect(socket_path.as_ref()).await.is_ok()
}

/// Proxy implementing [`VpnController`] against the helper daemon.
pub struct HelperClient {
    shared: Arc<ClientShared>,
    timeout: Duration,
}

struct ClientShared {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    cached: RwLock<Cached>,
    callbacks: RwLock<Callbacks>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    closed: CancellationToken,
}

#[derive(Default)]
struct Cached {
    state: ConnectionState,
    assigned_ip: String,
    interface_name: String,
}

#[derive(Default)]
struct Callbacks {
    on_state_change: Option<StateChangeCallback>,
    on_output: Option<OutputCallback>,
    on_event: Option<EventCallback>,
    on_error: Option<ErrorCallback>,
}

impl HelperClient {
    /// Connects to the helper daemon at the default socket path.
    pub async fn open_default() -> Result<Self, ClientError> {
        Self::open(DEFAULT_SOCKET_PATH).await
    }

    /// Connects to the helper daemon and seeds the cached state with an
    /// initial status request.
    pub async fn open(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .await
            .map_err(|err| ClientError::NotAvailable(err.to_string()))?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(ClientShared {
            writer: tokio::sync::Mutex::new(write_half),
            cached: RwLock::new(Cached::default()),
            callbacks: RwLock::new(Callbacks::default()),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_loop(Arc::clone(&shared), read_half));

        let client = Self {
            shared,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        if let Err(err) = client.sync_state().await {
            client.close().await;
            return Err(err);
        }
        Ok(client)
    }

    /// Overrides the per-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shuts the transport down and terminates the reader. Idempotent;
    /// pending requests complete with a `client closed` error.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Current cached connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.cached.read().unwrap().state
    }

    /// Cached IP assigned by the VPN server.
    pub fn assigned_ip(&self) -> String {
        self.shared.cached.read().unwrap().assigned_ip.clone()
    }

    /// Cached tunnel interface name.
    pub fn interface_name(&self) -> String {
        self.shared.cached.read().unwrap().interface_name.clone()
    }

    async fn sync_state(&self) -> Result<(), ClientError> {
        let response = self.send_request(Command::Status, &StatusParams {}).await?;
        let status: StatusResult =
            serde_json::from_value(response.result.unwrap_or(Value::Null))
                .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;

        let mut cached = self.shared.cached.write().unwrap();
        cached.state = status.state;
        cached.assigned_ip = status.assigned_ip;
        Ok(())
    }

    async fn send_request<P: Serialize>(
        &self,
        command: Command,
        params: &P,
    ) -> Result<Response, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = Request::new(id.clone(), command, params)?;

        let (sender, receiver) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(id.clone(), sender);

        let result = self.send_and_wait(&request, receiver).await;
        // The pending slot must not outlive the call, whatever the outcome.
        self.shared.pending.lock().unwrap().remove(&id);
        result
    }

    async fn send_and_wait(
        &self,
        request: &Request,
        receiver: oneshot::Receiver<Response>,
    ) -> Result<Response, ClientError> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        {
            let mut writer = self.shared.writer.lock().await;
            writer
                .write_all(&payload)
                .await
                .map_err(|err| ClientError::Send(err.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|err| ClientError::Send(err.to_string()))?;
        }

        let response = tokio::select! {
            response = receiver => response.map_err(|_| ClientError::Closed)?,
            _ = tokio::time::sleep(self.timeout) => return Err(ClientError::Timeout),
            _ = self.shared.closed.cancelled() => return Err(ClientError::Closed),
        };

        if !response.success {
            return Err(match response.error {
                Some(info) => ClientError::Request {
                    code: info.code,
                    message: info.message,
                },
                None => ClientError::Request {
                    code: "UNKNOWN".to_string(),
                    message: "request failed without error details".to_string(),
                },
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl VpnController for HelperClient {
    fn state(&self) -> ConnectionState {
        HelperClient::state(self)
    }

    fn assigned_ip(&self) -> String {
        HelperClient::assigned_ip(self)
    }

    fn interface_name(&self) -> String {
        HelperClient::interface_name(self)
    }

    async fn connect(
        &self,
        profile: &Profile,
        options: &ConnectOptions,
    ) -> crate::error::Result<()> {
        let params = ConnectParams {
            profile_id: profile.id.clone(),
            host: profile.host.clone(),
            port: u32::from(profile.port),
            username: profile.username.clone(),
            password: options.password.expose_secret().clone(),
            otp: options.otp.clone().unwrap_or_default(),
            auth_method: profile.auth_method,
            realm: profile.realm.clone(),
            trusted_cert: profile.trusted_cert.clone(),
            client_cert_path: profile.client_cert_path.clone(),
            client_key_path: profile.client_key_path.clone(),
            set_dns: profile.set_dns,
            set_routes: profile.set_routes,
            half_internet_routes: profile.half_internet_routes,
        };
        self.send_request(Command::Connect, &params)
            .await
            .map_err(FortilinkError::from)?;
        Ok(())
    }

    async fn disconnect(&self) -> crate::error::Result<()> {
        self.send_request(Command::Disconnect, &DisconnectParams {})
            .await
            .map_err(FortilinkError::from)?;
        Ok(())
    }

    fn on_state_change(&self, callback: StateChangeCallback) {
        self.shared.callbacks.write().unwrap().on_state_change = Some(callback);
    }

    fn on_output(&self, callback: OutputCallback) {
        self.shared.callbacks.write().unwrap().on_output = Some(callback);
    }

    fn on_event(&self, callback: EventCallback) {
        self.shared.callbacks.write().unwrap().on_event = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.shared.callbacks.write().unwrap().on_error = Some(callback);
    }
}

async fn read_loop(shared: Arc<ClientShared>, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shared.closed.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => handle_message(&shared, &line),
            Err(err) => {
                if !shared.closed.is_cancelled() {
                    tracing::error!(error = %err, "read error from helper");
                }
                break;
            }
        }
    }

    // Transport is gone; unblock any pending request.
    shared.closed.cancel();
}

fn handle_message(shared: &Arc<ClientShared>, raw: &[u8]) {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "invalid message from helper");
            return;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("response") => match serde_json::from_value::<Response>(value) {
            Ok(response) => deliver_response(shared, response),
            Err(err) => tracing::warn!(error = %err, "invalid response from helper"),
        },
        Some("event") => match serde_json::from_value::<Event>(value) {
            Ok(event) => handle_event(shared, event),
            Err(err) => tracing::warn!(error = %err, "invalid event from helper"),
        },
        // Forward compatibility: newer daemons may send more shapes.
        other => tracing::warn!(message_type = ?other, "unknown message type from helper"),
    }
}

/// Best-effort delivery: a response nobody is waiting for is dropped.
fn deliver_response(shared: &Arc<ClientShared>, response: Response) {
    let sender = shared.pending.lock().unwrap().remove(&response.id);
    match sender {
        Some(sender) => {
            let _ = sender.send(response);
        }
        None => tracing::debug!(id = %response.id, "response without pending request"),
    }
}

fn handle_event(shared: &Arc<ClientShared>, event: Event) {
    match event.name {
        EventName::StateChange => {
            let data: StateChangeData = match serde_json::from_value(event.data) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(error = %err, "invalid state change event");
                    return;
                }
            };
            let old_state = {
                let mut cached = shared.cached.write().unwrap();
                let old_state = cached.state;
                cached.state = data.to;
                if data.to == ConnectionState::Disconnected {
                    cached.assigned_ip.clear();
                    cached.interface_name.clear();
                }
                old_state
            };
            let callback = shared.callbacks.read().unwrap().on_state_change.clone();
            if let Some(callback) = callback {
                callback(old_state, data.to);
            }
        }

        EventName::Output => {
            let data: OutputData = match serde_json::from_value(event.data) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(error = %err, "invalid output event");
                    return;
                }
            };
            let callback = shared.callbacks.read().unwrap().on_output.clone();
            if let Some(callback) = callback {
                callback(&data.line);
            }
        }

        EventName::VpnEvent => {
            let data: VpnEventData = match serde_json::from_value(event.data) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(error = %err, "invalid VPN event");
                    return;
                }
            };

            if data.event_type == "got_ip" {
                if let Some(ip) = data.data.get("ip") {
                    shared.cached.write().unwrap().assigned_ip.clone_from(ip);
                    // The tunnel device may take a moment to appear.
                    spawn_interface_discovery(Arc::clone(shared), ip.clone());
                }
            }

            let Some(output_event) = data.to_event() else {
                tracing::debug!(event_type = %data.event_type, "unknown VPN event kind");
                return;
            };
            let callback = shared.callbacks.read().unwrap().on_event.clone();
            if let Some(callback) = callback {
                callback(&output_event);
            }
        }

        EventName::Error => {
            let data: ErrorData = match serde_json::from_value(event.data) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(error = %err, "invalid error event");
                    return;
                }
            };
            let callback = shared.callbacks.read().unwrap().on_error.clone();
            if let Some(callback) = callback {
                callback(&VpnError::Tunnel(data.message));
            }
        }
    }
}

fn spawn_interface_discovery(shared: Arc<ClientShared>, ip: String) {
    tokio::spawn(async move {
        match netif::detect_interface_with_retry(&ip, 5, Duration::from_millis(100)).await {
            Ok(name) => {
                tracing::info!(interface = %name, ip = %ip, "detected VPN interface");
                shared.cached.write().unwrap().interface_name = name;
            }
            Err(err) => {
                tracing::warn!(ip = %ip, error = %err, "failed to detect VPN interface");
            }
        }
    });
}
