//! End-to-end tests over a real UNIX helper socket.
//!
//! A stub controller stands in for the VPN session so the full chain
//! (proxy client -> socket server -> manager -> controller, and events
//! back out to every attached client) can be exercised without openfortivpn.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use fortilink_core::error::{ClientError, FortilinkError, VpnError};
use fortilink_core::helper::client::{is_helper_available, HelperClient};
use fortilink_core::helper::manager::Manager;
use fortilink_core::helper::protocol::{
    Command, Event, EventName, Request, Response, StatusParams, StatusResult, VpnEventData,
    ERR_INVALID_REQUEST, MAX_LINE_BYTES,
};
use fortilink_core::helper::server::{RequestHandler, Server, MAX_CLIENTS};
use fortilink_core::profile::Profile;
use fortilink_core::vpn::controller::{
    ConnectOptions, ErrorCallback, EventCallback, OutputCallback, StateChangeCallback,
    VpnController,
};
use fortilink_core::vpn::parser::OutputEvent;
use fortilink_core::vpn::state::ConnectionState;

#[derive(Default)]
struct StubCallbacks {
    state_change: Option<StateChangeCallback>,
    output: Option<OutputCallback>,
    event: Option<EventCallback>,
    error: Option<ErrorCallback>,
}

#[derive(Default)]
struct StubController {
    state: Mutex<ConnectionState>,
    assigned_ip: Mutex<String>,
    connect_error: Mutex<Option<VpnError>>,
    disconnect_error: Mutex<Option<VpnError>>,
    connects: Mutex<Vec<Profile>>,
    callbacks: Mutex<StubCallbacks>,
}

impl StubController {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn fire_state_change(&self, old: ConnectionState, new: ConnectionState) {
        *self.state.lock().unwrap() = new;
        let callback = self.callbacks.lock().unwrap().state_change.clone();
        if let Some(callback) = callback {
            callback(old, new);
        }
    }

    fn fire_output(&self, line: &str) {
        let callback = self.callbacks.lock().unwrap().output.clone();
        if let Some(callback) = callback {
            callback(line);
        }
    }

    fn fire_event(&self, event: &OutputEvent) {
        let callback = self.callbacks.lock().unwrap().event.clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn fire_error(&self, err: &VpnError) {
        let callback = self.callbacks.lock().unwrap().error.clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

#[async_trait]
impl VpnController for StubController {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn assigned_ip(&self) -> String {
        self.assigned_ip.lock().unwrap().clone()
    }

    fn interface_name(&self) -> String {
        String::new()
    }

    async fn connect(
        &self,
        profile: &Profile,
        _options: &ConnectOptions,
    ) -> fortilink_core::error::Result<()> {
        self.connects.lock().unwrap().push(profile.clone());
        match self.connect_error.lock().unwrap().take() {
            Some(err) => Err(FortilinkError::Vpn(err)),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> fortilink_core::error::Result<()> {
        match self.disconnect_error.lock().unwrap().take() {
            Some(err) => Err(FortilinkError::Vpn(err)),
            None => Ok(()),
        }
    }

    fn on_state_change(&self, callback: StateChangeCallback) {
        self.callbacks.lock().unwrap().state_change = Some(callback);
    }

    fn on_output(&self, callback: OutputCallback) {
        self.callbacks.lock().unwrap().output = Some(callback);
    }

    fn on_event(&self, callback: EventCallback) {
        self.callbacks.lock().unwrap().event = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.callbacks.lock().unwrap().error = Some(callback);
    }
}

struct Fixture {
    controller: Arc<StubController>,
    manager: Arc<Manager>,
    server: Arc<Server>,
    path: PathBuf,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helper.sock");

    let controller = Arc::new(StubController::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = Manager::new(
        Arc::clone(&controller) as Arc<dyn VpnController>,
        events_tx,
    );
    let server = Arc::new(Server::new(
        path.clone(),
        None,
        Arc::clone(&manager) as Arc<dyn RequestHandler>,
        events_rx,
    ));
    server.start().await.unwrap();

    Fixture {
        controller,
        manager,
        server,
        path,
        _dir: dir,
    }
}

struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    async fn open(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv_raw(&mut self) -> String {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
            .await
            .expect("no message within two seconds")
            .unwrap();
        assert!(read > 0, "connection closed");
        assert!(line.ends_with('\n'));
        line
    }

    async fn recv(&mut self) -> Value {
        serde_json::from_str(&self.recv_raw().await).unwrap()
    }
}

fn valid_profile() -> Profile {
    let mut profile = Profile::new("e2e");
    profile.host = "vpn.example.com".to_string();
    profile.username = "alice".to_string();
    profile
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within two seconds");
}

#[tokio::test]
async fn status_round_trip_over_the_socket() {
    let fx = fixture().await;
    assert!(is_helper_available(&fx.path).await);

    let mut client = RawClient::open(&fx.path).await;
    client
        .send_line(r#"{"id":"42","type":"request","command":"status","params":{}}"#)
        .await;

    let response = client.recv().await;
    assert_eq!(response["id"], "42");
    assert_eq!(response["type"], "response");
    assert_eq!(response["success"], true);
    assert_eq!(response["result"]["state"], "disconnected");
}

#[tokio::test]
async fn malformed_request_gets_error_but_keeps_connection() {
    let fx = fixture().await;
    let mut client = RawClient::open(&fx.path).await;

    client.send_line("{this is not json").await;
    let response = client.recv().await;
    assert_eq!(response["success"], false);
    assert_eq!(response["error"]["code"], ERR_INVALID_REQUEST);
    assert_eq!(response["id"], "");

    // The connection survives per-line errors.
    client
        .send_line(r#"{"id":"2","type":"request","command":"status","params":{}}"#)
        .await;
    let response = client.recv().await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn oversize_request_drops_connection_but_not_others() {
    let fx = fixture().await;
    let mut bystander = RawClient::open(&fx.path).await;
    let mut offender = RawClient::open(&fx.path).await;

    // One byte over the cap, no delimiter.
    let oversize = vec![b'x'; MAX_LINE_BYTES + 1];
    offender.writer.write_all(&oversize).await.unwrap();
    offender.writer.flush().await.unwrap();

    let response = offender.recv().await;
    assert_eq!(response["error"]["code"], ERR_INVALID_REQUEST);

    // The offender's connection is gone.
    let mut rest = String::new();
    let read = tokio::time::timeout(
        Duration::from_secs(2),
        offender.reader.read_line(&mut rest),
    )
    .await
    .expect("connection not closed")
    .unwrap();
    assert_eq!(read, 0, "expected EOF after oversize request");

    // Everyone else keeps working and still receives broadcasts.
    bystander
        .send_line(r#"{"id":"1","type":"request","command":"status","params":{}}"#)
        .await;
    assert_eq!(bystander.recv().await["success"], true);

    fx.controller.fire_output("Connecting to gateway...");
    let event = bystander.recv().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["name"], "output");
    assert_eq!(event["data"]["line"], "Connecting to gateway...");
}

#[tokio::test]
async fn broadcast_reaches_every_attached_client_identically() {
    let fx = fixture().await;
    let mut first = RawClient::open(&fx.path).await;
    let mut second = RawClient::open(&fx.path).await;
    let mut third = RawClient::open(&fx.path).await;

    // A round trip guarantees all three are attached before the event.
    first
        .send_line(r#"{"id":"a","type":"request","command":"status","params":{}}"#)
        .await;
    first.recv().await;

    fx.controller.fire_output("Tunnel is up and running.");

    let a = first.recv_raw().await;
    let b = second.recv_raw().await;
    let c = third.recv_raw().await;
    assert_eq!(a, b);
    assert_eq!(b, c);

    let event: Value = serde_json::from_str(&a).unwrap();
    assert_eq!(event["name"], "output");
}

#[tokio::test]
async fn clients_beyond_the_cap_are_dropped() {
    let fx = fixture().await;

    let mut attached = Vec::new();
    for _ in 0..MAX_CLIENTS {
        attached.push(RawClient::open(&fx.path).await);
    }
    // A round trip on the last client proves all accepts were processed.
    let last = attached.last_mut().unwrap();
    last.send_line(r#"{"id":"s","type":"request","command":"status","params":{}}"#)
        .await;
    last.recv().await;
    assert_eq!(fx.server.client_count(), MAX_CLIENTS);

    // The next connection is accepted and immediately closed.
    let mut extra = RawClient::open(&fx.path).await;
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(2), extra.reader.read_line(&mut line))
        .await
        .expect("overflow connection not closed")
        .unwrap();
    assert_eq!(read, 0, "expected EOF on the connection over the cap");

    // The first N survive.
    let first = attached.first_mut().unwrap();
    first
        .send_line(r#"{"id":"t","type":"request","command":"status","params":{}}"#)
        .await;
    assert_eq!(first.recv().await["success"], true);
}

#[tokio::test]
async fn double_start_fails_and_stop_is_idempotent() {
    let fx = fixture().await;

    let err = fx.server.start().await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    fx.server.stop().await;
    assert!(!fx.path.exists(), "socket file must be removed on stop");

    // Stopping a stopped server is a no-op.
    fx.server.stop().await;
}

#[tokio::test]
async fn proxy_connect_flows_through_to_the_controller() {
    let fx = fixture().await;
    let client = HelperClient::open(&fx.path).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let profile = valid_profile();
    let options = ConnectOptions {
        password: SecretString::new("hunter2".to_string()),
        otp: None,
    };
    client.connect(&profile, &options).await.unwrap();

    let connects = fx.controller.connects.lock().unwrap();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].id, profile.id);
    assert_eq!(connects[0].host, profile.host);
    drop(connects);

    let response = fx
        .manager
        .handle(Request::new("s", Command::Status, &StatusParams {}).unwrap())
        .await;
    let status: StatusResult = serde_json::from_value(response.result.unwrap()).unwrap();
    assert_eq!(status.connected_profile_id, profile.id);
}

#[tokio::test]
async fn proxy_surfaces_request_errors_with_code_and_message() {
    let fx = fixture().await;
    let client = HelperClient::open(&fx.path).await.unwrap();
    fx.controller.set_state(ConnectionState::Connected);

    let err = client
        .connect(&valid_profile(), &ConnectOptions::default())
        .await
        .unwrap_err();
    match err {
        FortilinkError::Client(ClientError::Request { code, message }) => {
            assert_eq!(code, "INVALID_STATE");
            assert!(message.contains("connected"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn proxy_seeds_state_from_the_daemon() {
    let fx = fixture().await;
    fx.controller.set_state(ConnectionState::Connected);
    *fx.controller.assigned_ip.lock().unwrap() = "10.0.0.50".to_string();

    let client = HelperClient::open(&fx.path).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.assigned_ip(), "10.0.0.50");
    assert!(client.can_disconnect());
    assert!(!client.can_connect());
}

#[tokio::test]
async fn proxy_tracks_state_changes_and_clears_cache_on_disconnect() {
    let fx = fixture().await;
    let client = HelperClient::open(&fx.path).await.unwrap();

    let seen: Arc<Mutex<Vec<(ConnectionState, ConnectionState)>>> =
        Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client.on_state_change(Arc::new(move |old, new| {
            seen.lock().unwrap().push((old, new));
        }));
    }

    fx.controller
        .fire_state_change(ConnectionState::Disconnected, ConnectionState::Connecting);
    wait_until(|| client.state() == ConnectionState::Connecting).await;

    fx.controller.fire_event(&OutputEvent::GotIp {
        ip: "10.0.0.50".to_string(),
    });
    wait_until(|| client.assigned_ip() == "10.0.0.50").await;

    fx.controller
        .fire_state_change(ConnectionState::Connecting, ConnectionState::Connected);
    wait_until(|| client.state() == ConnectionState::Connected).await;

    fx.controller
        .fire_state_change(ConnectionState::Connected, ConnectionState::Disconnected);
    wait_until(|| client.state() == ConnectionState::Disconnected).await;
    assert_eq!(client.assigned_ip(), "");
    assert_eq!(client.interface_name(), "");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first().unwrap().1, ConnectionState::Connecting);
    assert_eq!(seen.last().unwrap().1, ConnectionState::Disconnected);
}

#[tokio::test]
async fn proxy_forwards_vpn_events_output_and_errors() {
    let fx = fixture().await;
    let client = HelperClient::open(&fx.path).await.unwrap();

    let events: Arc<Mutex<Vec<OutputEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let outputs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        client.on_event(Arc::new(move |event| {
            events.lock().unwrap().push(event.clone());
        }));
    }
    {
        let outputs = Arc::clone(&outputs);
        client.on_output(Arc::new(move |line| {
            outputs.lock().unwrap().push(line.to_string());
        }));
    }
    {
        let errors = Arc::clone(&errors);
        client.on_error(Arc::new(move |err| {
            errors.lock().unwrap().push(err.to_string());
        }));
    }

    fx.controller.fire_output("Connecting to gateway...");
    fx.controller.fire_event(&OutputEvent::OtpRequired);
    fx.controller
        .fire_error(&VpnError::Tunnel("VPN authentication failed.".to_string()));

    {
        let outputs = Arc::clone(&outputs);
        wait_until(move || !outputs.lock().unwrap().is_empty()).await;
    }
    {
        let events = Arc::clone(&events);
        wait_until(move || !events.lock().unwrap().is_empty()).await;
    }
    {
        let errors = Arc::clone(&errors);
        wait_until(move || !errors.lock().unwrap().is_empty()).await;
    }

    assert_eq!(outputs.lock().unwrap()[0], "Connecting to gateway...");
    assert_eq!(events.lock().unwrap()[0], OutputEvent::OtpRequired);
    assert!(errors.lock().unwrap()[0].contains("VPN authentication failed"));
}

struct SlowHandler {
    delay: Duration,
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn handle_request(&self, request: Request) -> Response {
        tokio::time::sleep(self.delay).await;
        match request.command {
            Command::Status => Response::success(
                request.id,
                Some(serde_json::to_value(StatusResult::default()).unwrap()),
            ),
            _ => Response::success(request.id, None),
        }
    }
}

#[tokio::test]
async fn proxy_request_times_out_against_a_stalled_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helper.sock");
    let (_events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
    let server = Arc::new(Server::new(
        path.clone(),
        None,
        Arc::new(SlowHandler {
            delay: Duration::from_millis(400),
        }) as Arc<dyn RequestHandler>,
        events_rx,
    ));
    server.start().await.unwrap();

    let client = HelperClient::open(&path)
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(50));

    let err = client.disconnect().await.unwrap_err();
    assert!(matches!(
        err,
        FortilinkError::Client(ClientError::Timeout)
    ));
}

#[tokio::test]
async fn proxy_close_is_idempotent_and_pending_requests_observe_it() {
    let fx = fixture().await;
    let client = HelperClient::open(&fx.path).await.unwrap();

    client.close().await;
    client.close().await;

    let err = client.disconnect().await.unwrap_err();
    assert!(matches!(
        err,
        FortilinkError::Client(ClientError::Closed) | FortilinkError::Client(ClientError::Send(_))
    ));
}

#[tokio::test]
async fn server_stop_unblocks_proxy_requests() {
    let fx = fixture().await;
    let client = HelperClient::open(&fx.path).await.unwrap();

    fx.server.stop().await;

    let err = client.disconnect().await.unwrap_err();
    assert!(matches!(
        err,
        FortilinkError::Client(ClientError::Closed) | FortilinkError::Client(ClientError::Send(_))
    ));
}

#[tokio::test]
async fn vpn_events_round_trip_through_the_wire_encoding() {
    let fx = fixture().await;
    let mut raw = RawClient::open(&fx.path).await;

    // A round trip guarantees the client is attached before the event.
    raw.send_line(r#"{"id":"a","type":"request","command":"status","params":{}}"#)
        .await;
    raw.recv().await;

    fx.controller.fire_event(&OutputEvent::Authenticate {
        url: "https://idp.example.com/login".to_string(),
    });

    let event = raw.recv().await;
    assert_eq!(event["name"], "vpn_event");
    let data: VpnEventData = serde_json::from_value(event["data"].clone()).unwrap();
    assert_eq!(
        data.to_event(),
        Some(OutputEvent::Authenticate {
            url: "https://idp.example.com/login".to_string()
        })
    );
    assert_eq!(event["name"], serde_json::json!(EventName::VpnEvent));
}
