//! Wire protocol between the helper daemon and its clients.
//!
//! Newline-delimited JSON over a UNIX socket: every message is one JSON
//! object followed by a single `\n`, UTF-8, at most [`MAX_LINE_BYTES`]
//! including the delimiter. Requests carry caller-chosen ids that the
//! server echoes into the matching response; events carry no id and are
//! broadcast to every attached client.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::profile::AuthMethod;
use crate::vpn::parser::OutputEvent;
use crate::vpn::state::ConnectionState;

/// Maximum accepted message length, delimiter included.
pub const MAX_LINE_BYTES: usize = 65_536;

// Machine-readable error codes carried in error responses.
pub const ERR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERR_INVALID_COMMAND: &str = "INVALID_COMMAND";
pub const ERR_INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const ERR_INVALID_STATE: &str = "INVALID_STATE";
pub const ERR_CONNECTION_FAILED: &str = "CONNECTION_FAILED";
pub const ERR_DISCONNECT_FAILED: &str = "DISCONNECT_FAILED";
pub const ERR_INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const ERR_PROFILE_INVALID: &str = "PROFILE_INVALID";

/// Discriminates the three message shapes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// Operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Connect,
    Disconnect,
    Status,
    /// Forward compatibility: commands this build does not know.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::Status => "status",
            Command::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Asynchronous notification kinds broadcast by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    StateChange,
    Output,
    VpnEvent,
    Error,
}

/// A command sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen identifier echoed into the matching response.
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub command: Command,
    /// Command-specific parameters, passed through verbatim.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        command: Command,
        params: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            message_type: MessageType::Request,
            command,
            params: serde_json::to_value(params)?,
        })
    }
}

/// A reply from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Matches the request id.
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            success: true,
            result,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            success: false,
            result: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// An asynchronous notification broadcast from server to all clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub name: EventName,
    pub data: Value,
}

impl Event {
    pub fn new(name: EventName, data: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: MessageType::Event,
            name,
            data: serde_json::to_value(data)?,
        })
    }
}

/// Details of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Parameters for the `connect` command.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub profile_id: String,
    pub host: String,
    /// Wide on purpose so out-of-range ports are rejected by validation
    /// rather than by the decoder.
    pub port: u32,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub otp: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub realm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trusted_cert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_cert_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_key_path: String,
    pub set_dns: bool,
    pub set_routes: bool,
    pub half_internet_routes: bool,
}

// Credentials stay out of logs and panic messages.
impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("profile_id", &self.profile_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("otp", &"[redacted]")
            .field("auth_method", &self.auth_method)
            .field("realm", &self.realm)
            .field("trusted_cert", &self.trusted_cert)
            .field("client_cert_path", &self.client_cert_path)
            .field("client_key_path", &self.client_key_path)
            .field("set_dns", &self.set_dns)
            .field("set_routes", &self.set_routes)
            .field("half_internet_routes", &self.half_internet_routes)
            .finish()
    }
}

/// Parameters for the `disconnect` command, reserved for extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectParams {}

/// Parameters for the `status` command, reserved for extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusParams {}

/// Result payload of a `status` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connected_profile_id: String,
}

/// Payload of `state_change` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeData {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Payload of `output` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputData {
    pub line: String,
}

/// Payload of `vpn_event` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnEventData {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

impl VpnEventData {
    /// Encodes a typed controller event for the wire.
    pub fn from_event(event: &OutputEvent) -> Self {
        let mut data = HashMap::new();
        let mut message = None;
        match event {
            OutputEvent::Authenticate { url } => {
                data.insert("url".to_string(), url.clone());
            }
            OutputEvent::GotIp { ip } => {
                data.insert("ip".to_string(), ip.clone());
            }
            OutputEvent::Error { message: text } => {
                message = Some(text.clone());
            }
            _ => {}
        }
        Self {
            event_type: event.kind().to_string(),
            message,
            data,
        }
    }

    /// Reconstructs the typed event, `None` for unknown kinds.
    pub fn to_event(&self) -> Option<OutputEvent> {
        match self.event_type.as_str() {
            "authenticate" => Some(OutputEvent::Authenticate {
                url: self.data.get("url").cloned().unwrap_or_default(),
            }),
            "connecting" => Some(OutputEvent::Connecting),
            "connected" => Some(OutputEvent::Connected),
            "disconnected" => Some(OutputEvent::Disconnected),
            "got_ip" => Some(OutputEvent::GotIp {
                ip: self.data.get("ip").cloned().unwrap_or_default(),
            }),
            "error" => Some(OutputEvent::Error {
                message: self.message.clone().unwrap_or_default(),
            }),
            "otp_required" => Some(OutputEvent::OtpRequired),
            "password_required" => Some(OutputEvent::PasswordRequired),
            _ => None,
        }
    }
}

/// Payload of `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}
