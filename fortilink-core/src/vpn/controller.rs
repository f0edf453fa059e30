//! VPN session controller.
//!
//! Wraps a single openfortivpn process: spawns it through a
//! [`ProcessExecutor`], feeds credentials on stdin, parses output lines
//! into events and drives the connection state machine. At most one
//! session is active at a time.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::VpnError;
use crate::profile::{AuthMethod, Profile};
use crate::vpn::executor::{
    BoxedReader, BoxedWriter, KillHandle, ProcessExecutor, RealExecutor, VpnProcess,
};
use crate::vpn::netif;
use crate::vpn::parser::{parse_line, OutputEvent};
use crate::vpn::state::{is_valid_transition, ConnectionState};

/// Optional parameters for a connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Password written to the client's stdin, never the argv. Empty for SAML.
    pub password: SecretString,
    /// One-time password passed via `--otp`; time-limited and single-use,
    /// which makes argv exposure acceptable.
    pub otp: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            password: SecretString::new(String::new()),
            otp: None,
        }
    }
}

/// Callback invoked on every committed state transition.
pub type StateChangeCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
/// Callback invoked for every raw output line.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback invoked for every parsed output event.
pub type EventCallback = Arc<dyn Fn(&OutputEvent) + Send + Sync>;
/// Callback invoked for session errors.
pub type ErrorCallback = Arc<dyn Fn(&VpnError) + Send + Sync>;

/// Common surface of a VPN session backend.
///
/// Implemented by the in-process [`Controller`] and by the remote
/// [`HelperClient`](crate::helper::client::HelperClient); upper layers
/// must not need to distinguish the two.
#[async_trait]
pub trait VpnController: Send + Sync {
    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// IP address assigned by the VPN server, empty when not connected.
    fn assigned_ip(&self) -> String;

    /// Network interface name of the tunnel, empty when not detected.
    fn interface_name(&self) -> String;

    fn can_connect(&self) -> bool {
        self.state().can_connect()
    }

    fn can_disconnect(&self) -> bool {
        self.state().can_disconnect()
    }

    /// Initiates a VPN connection with the given profile and options.
    async fn connect(&self, profile: &Profile, options: &ConnectOptions)
        -> crate::error::Result<()>;

    /// Terminates the active VPN connection.
    async fn disconnect(&self) -> crate::error::Result<()>;

    fn on_state_change(&self, callback: StateChangeCallback);
    fn on_output(&self, callback: OutputCallback);
    fn on_event(&self, callback: EventCallback);
    fn on_error(&self, callback: ErrorCallback);
}

/// Manages the VPN connection lifecycle around one openfortivpn process.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

struct Shared {
    vpn_path: String,
    executor: Arc<dyn ProcessExecutor>,
    /// When true the VPN binary path is prepended to the argv and the
    /// privilege-escalation helper is spawned instead of the binary.
    user_mode: bool,
    inner: RwLock<Inner>,
}

type StdinSlot = Arc<tokio::sync::Mutex<Option<BoxedWriter>>>;

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    assigned_ip: String,
    interface_name: String,
    kill: Option<Arc<dyn KillHandle>>,
    cancel: Option<CancellationToken>,
    stdin: Option<StdinSlot>,
    on_state_change: Option<StateChangeCallback>,
    on_output: Option<OutputCallback>,
    on_event: Option<EventCallback>,
    on_error: Option<ErrorCallback>,
}

impl Controller {
    /// Controller for an unprivileged host process; the client is spawned
    /// through pkexec.
    pub fn new(vpn_path: impl Into<String>) -> Self {
        Self::with_executor(vpn_path, Arc::new(RealExecutor::user()), true)
    }

    /// Controller for the privileged helper daemon; the client is spawned
    /// directly.
    pub fn elevated(vpn_path: impl Into<String>) -> Self {
        Self::with_executor(vpn_path, Arc::new(RealExecutor::elevated()), false)
    }

    /// Controller with a custom executor, primarily for tests.
    pub fn with_executor(
        vpn_path: impl Into<String>,
        executor: Arc<dyn ProcessExecutor>,
        user_mode: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                vpn_path: vpn_path.into(),
                executor,
                user_mode,
                inner: RwLock::new(Inner::default()),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// IP address assigned by the VPN server, empty when not connected.
    pub fn assigned_ip(&self) -> String {
        self.shared.inner.read().unwrap().assigned_ip.clone()
    }

    /// Tunnel interface name, empty when not detected.
    pub fn interface_name(&self) -> String {
        self.shared.inner.read().unwrap().interface_name.clone()
    }

    pub fn can_connect(&self) -> bool {
        self.state().can_connect()
    }

    pub fn can_disconnect(&self) -> bool {
        self.state().can_disconnect()
    }

    pub fn on_state_change(&self, callback: StateChangeCallback) {
        self.shared.inner.write().unwrap().on_state_change = Some(callback);
    }

    pub fn on_output(&self, callback: OutputCallback) {
        self.shared.inner.write().unwrap().on_output = Some(callback);
    }

    pub fn on_event(&self, callback: EventCallback) {
        self.shared.inner.write().unwrap().on_event = Some(callback);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.shared.inner.write().unwrap().on_error = Some(callback);
    }

    /// Initiates a VPN connection using the given profile and options.
    ///
    /// The password is written to the client's stdin followed by a single
    /// newline; it never appears on the command line, where it would be
    /// visible to every user via /proc. SAML sessions receive no password
    /// at all, even when one is supplied.
    pub async fn connect(
        &self,
        profile: &Profile,
        options: &ConnectOptions,
    ) -> Result<(), VpnError> {
        let shared = &self.shared;

        let current = shared.state();
        if !current.can_connect() {
            return Err(VpnError::CannotConnect(current));
        }
        profile.validate()?;

        shared.set_state(ConnectionState::Connecting)?;

        let vpn_args = build_command_args(profile, options);
        let (program, args) = if shared.user_mode {
            let mut full = Vec::with_capacity(vpn_args.len() + 1);
            full.push(shared.vpn_path.clone());
            full.extend(vpn_args);
            ("pkexec".to_string(), full)
        } else {
            (shared.vpn_path.clone(), vpn_args)
        };

        let mut process = match shared.executor.create(&program, &args) {
            Ok(process) => process,
            Err(err) => {
                shared.fail_quietly();
                return Err(err);
            }
        };

        if let Err(err) = process.start() {
            shared.fail_quietly();
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let kill = process.kill_handle();
        let stdin: Option<StdinSlot> = process
            .take_stdin()
            .map(|writer| Arc::new(tokio::sync::Mutex::new(Some(writer))));
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        {
            let mut inner = shared.inner.write().unwrap();
            inner.kill = kill;
            inner.cancel = Some(cancel.clone());
            inner.stdin = stdin.clone();
        }

        if profile.auth_method != AuthMethod::Saml
            && !options.password.expose_secret().is_empty()
        {
            if let Some(slot) = stdin {
                spawn_password_feeder(Arc::clone(shared), slot, options.password.clone());
            }
        }

        if let Some(stdout) = stdout {
            spawn_output_reader(Arc::clone(shared), cancel.clone(), stdout);
        }
        if let Some(stderr) = stderr {
            spawn_output_reader(Arc::clone(shared), cancel.clone(), stderr);
        }
        spawn_waiter(Arc::clone(shared), process);

        Ok(())
    }

    /// Terminates the active VPN connection.
    ///
    /// Cancels the session tasks and kills the process group. The state
    /// transition to disconnected happens asynchronously when the waiter
    /// observes the child exit.
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        let current = self.state();
        if !current.can_disconnect() {
            return Err(VpnError::CannotDisconnect(current));
        }

        let (cancel, kill) = {
            let inner = self.shared.inner.read().unwrap();
            (inner.cancel.clone(), inner.kill.clone())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(kill) = kill {
            kill.kill().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VpnController for Controller {
    fn state(&self) -> ConnectionState {
        Controller::state(self)
    }

    fn assigned_ip(&self) -> String {
        Controller::assigned_ip(self)
    }

    fn interface_name(&self) -> String {
        Controller::interface_name(self)
    }

    async fn connect(
        &self,
        profile: &Profile,
        options: &ConnectOptions,
    ) -> crate::error::Result<()> {
        Controller::connect(self, profile, options)
            .await
            .map_err(Into::into)
    }

    async fn disconnect(&self) -> crate::error::Result<()> {
        Controller::disconnect(self).await.map_err(Into::into)
    }

    fn on_state_change(&self, callback: StateChangeCallback) {
        Controller::on_state_change(self, callback);
    }

    fn on_output(&self, callback: OutputCallback) {
        Controller::on_output(self, callback);
    }

    fn on_event(&self, callback: EventCallback) {
        Controller::on_event(self, callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        Controller::on_error(self, callback);
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.inner.read().unwrap().state
    }

    /// Commits a state transition if it is legal. The callback is invoked
    /// after the guard is released; holding it across a user callback
    /// invites deadlocks with the upper layer's own locking.
    fn set_state(&self, new_state: ConnectionState) -> Result<(), VpnError> {
        let (old_state, callback) = {
            let mut inner = self.inner.write().unwrap();
            if !is_valid_transition(inner.state, new_state) {
                return Err(VpnError::InvalidTransition {
                    from: inner.state,
                    to: new_state,
                });
            }
            let old_state = inner.state;
            inner.state = new_state;
            (old_state, inner.on_state_change.clone())
        };

        tracing::debug!(from = %old_state, to = %new_state, "connection state changed");
        if let Some(callback) = callback {
            callback(old_state, new_state);
        }
        Ok(())
    }

    fn fail_quietly(&self) {
        if let Err(err) = self.set_state(ConnectionState::Failed) {
            tracing::warn!(error = %err, "failed to record failed state");
        }
    }

    fn set_assigned_ip(&self, ip: &str) {
        self.inner.write().unwrap().assigned_ip = ip.to_string();
    }

    fn set_interface_name(&self, name: &str) {
        self.inner.write().unwrap().interface_name = name.to_string();
    }

    fn emit_output(&self, line: &str) {
        let callback = self.inner.read().unwrap().on_output.clone();
        if let Some(callback) = callback {
            callback(line);
        }
    }

    fn emit_event(&self, event: &OutputEvent) {
        let callback = self.inner.read().unwrap().on_event.clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn emit_error(&self, err: &VpnError) {
        let callback = self.inner.read().unwrap().on_error.clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

/// Builds the openfortivpn command line. Order is significant.
fn build_command_args(profile: &Profile, options: &ConnectOptions) -> Vec<String> {
    let mut args = vec![format!("{}:{}", profile.host, profile.port)];

    if matches!(profile.auth_method, AuthMethod::Password | AuthMethod::Otp)
        && !profile.username.is_empty()
    {
        args.push("-u".to_string());
        args.push(profile.username.clone());
    }

    if let Some(otp) = options.otp.as_deref() {
        if !otp.is_empty() {
            args.push(format!("--otp={otp}"));
        }
    }

    if !profile.realm.is_empty() {
        args.push(format!("--realm={}", profile.realm));
    }

    args.push(format!("--set-dns={}", u8::from(profile.set_dns)));
    args.push(format!("--set-routes={}", u8::from(profile.set_routes)));
    args.push(format!(
        "--half-internet-routes={}",
        u8::from(profile.half_internet_routes)
    ));

    if profile.auth_method == AuthMethod::Certificate {
        if !profile.client_cert_path.is_empty() {
            args.push(format!("--user-cert={}", profile.client_cert_path));
        }
        if !profile.client_key_path.is_empty() {
            args.push(format!("--user-key={}", profile.client_key_path));
        }
    }

    if profile.auth_method == AuthMethod::Saml {
        args.push("--saml-login".to_string());
    }

    if !profile.trusted_cert.is_empty() {
        args.push(format!("--trusted-cert={}", profile.trusted_cert));
    }

    args
}

/// Writes the password followed by a single newline to the child's stdin.
/// The writer stays in its slot afterwards; closing it early would
/// terminate the client.
fn spawn_password_feeder(shared: Arc<Shared>, slot: StdinSlot, password: SecretString) {
    tokio::spawn(async move {
        let mut guard = slot.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let mut payload = Vec::with_capacity(password.expose_secret().len() + 1);
        payload.extend_from_slice(password.expose_secret().as_bytes());
        payload.push(b'\n');
        if let Err(err) = writer.write_all(&payload).await {
            shared.emit_error(&VpnError::PasswordWrite(err.to_string()));
            return;
        }
        if let Err(err) = writer.flush().await {
            shared.emit_error(&VpnError::PasswordWrite(err.to_string()));
        }
    });
}

/// Reads one of the child's output streams line by line.
fn spawn_output_reader(shared: Arc<Shared>, cancel: CancellationToken, reader: BoxedReader) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    // Lines drained after disconnect must not re-enter the
                    // state machine.
                    if cancel.is_cancelled() {
                        return;
                    }
                    process_output(&shared, &line);
                }
                Ok(None) => return,
                Err(err) => {
                    if !cancel.is_cancelled() {
                        shared.emit_error(&VpnError::OutputRead(err.to_string()));
                    }
                    return;
                }
            }
        }
    });
}

/// Waits for the child to exit and releases the session. The wait error
/// is intentionally dropped; cleanup is unconditional.
fn spawn_waiter(shared: Arc<Shared>, mut process: Box<dyn VpnProcess>) {
    tokio::spawn(async move {
        let _ = process.wait().await;

        let (stdin, state) = {
            let mut inner = shared.inner.write().unwrap();
            inner.kill = None;
            inner.cancel = None;
            inner.assigned_ip.clear();
            inner.interface_name.clear();
            (inner.stdin.take(), inner.state)
        };
        if let Some(slot) = stdin {
            // Closes the child's input once the feeder is done with it.
            slot.lock().await.take();
        }

        if matches!(
            state,
            ConnectionState::Connected
                | ConnectionState::Connecting
                | ConnectionState::Authenticating
        ) {
            if let Err(err) = shared.set_state(ConnectionState::Disconnected) {
                tracing::warn!(error = %err, "failed to transition to disconnected after exit");
            }
        }
    });
}

/// Handles a single output line: raw callback first, then the parsed
/// event, then any state transition it implies.
fn process_output(shared: &Arc<Shared>, line: &str) {
    shared.emit_output(line);

    let Some(event) = parse_line(line) else {
        return;
    };
    shared.emit_event(&event);

    match &event {
        OutputEvent::Connected => apply_transition(shared, ConnectionState::Connected),
        OutputEvent::Disconnected => {
            shared.set_assigned_ip("");
            apply_transition(shared, ConnectionState::Disconnected);
        }
        OutputEvent::GotIp { ip } => {
            shared.set_assigned_ip(ip);
            let cancel = shared.inner.read().unwrap().cancel.clone();
            if let Some(cancel) = cancel {
                spawn_interface_discovery(Arc::clone(shared), ip.clone(), cancel);
            }
        }
        OutputEvent::Error { message } => {
            shared.emit_error(&VpnError::Tunnel(message.clone()));
            // A late error from a session that already reached a terminal
            // state must not drag it to failed.
            if shared.state().is_transitioning() {
                apply_transition(shared, ConnectionState::Failed);
            }
        }
        OutputEvent::Authenticate { .. } => {
            apply_transition(shared, ConnectionState::Authenticating)
        }
        OutputEvent::Connecting | OutputEvent::OtpRequired | OutputEvent::PasswordRequired => {}
    }
}

/// Illegal transitions never mutate state; they surface as non-fatal
/// errors on the error callback.
fn apply_transition(shared: &Shared, to: ConnectionState) {
    if let Err(err) = shared.set_state(to) {
        shared.emit_error(&err);
    }
}

fn spawn_interface_discovery(shared: Arc<Shared>, ip: String, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = netif::detect_interface_with_retry(&ip, 5, Duration::from_millis(100)) => {
                match result {
                    Ok(name) => {
                        tracing::debug!(interface = %name, ip = %ip, "detected VPN interface");
                        shared.set_interface_name(&name);
                    }
                    Err(err) => {
                        tracing::debug!(ip = %ip, error = %err, "VPN interface not detected");
                    }
                }
            }
        }
    });
}
