//! Error types for the fortilink helper daemon and its clients.
//!
//! Each subsystem carries its own error enum; `FortilinkError` aggregates
//! them for callers that only need a single error surface.

use thiserror::Error;

use crate::vpn::state::ConnectionState;

/// Main error type aggregating all subsystem errors.
#[derive(Error, Debug)]
pub enum FortilinkError {
    /// Errors from the VPN session controller.
    #[error("VPN error: {0}")]
    Vpn(#[from] VpnError),

    /// Errors from the helper client proxy.
    #[error("helper client error: {0}")]
    Client(#[from] ClientError),

    /// Errors from the helper socket server.
    #[error("helper server error: {0}")]
    Server(#[from] ServerError),

    /// Generic I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// VPN session operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VpnError {
    #[error("cannot connect: current state is {0}")]
    CannotConnect(ConnectionState),

    #[error("not connected: current state is {0}")]
    CannotDisconnect(ConnectionState),

    #[error("invalid profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("state transition failed: invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("failed to create process: {0}")]
    CreateProcess(String),

    #[error("failed to start VPN client: {0}")]
    StartProcess(String),

    #[error("failed to wait for VPN client: {0}")]
    WaitProcess(String),

    #[error("authentication cancelled or pkexec not available")]
    AuthorizationCancelled,

    #[error("failed to kill VPN process group: {0}")]
    KillFailed(String),

    /// An error reported by the VPN client itself on its output streams.
    #[error("{0}")]
    Tunnel(String),

    #[error("failed to read VPN client output: {0}")]
    OutputRead(String),

    #[error("failed to write password to stdin: {0}")]
    PasswordWrite(String),
}

/// Profile validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile id is required")]
    MissingId,

    #[error("invalid profile id: {0}")]
    InvalidId(String),

    #[error("profile name is required")]
    MissingName,

    #[error("{field} is too long (max {max} characters)")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("{field} contains a control character")]
    ControlCharacter { field: &'static str },

    #[error("host is required")]
    MissingHost,

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("username is required for password/OTP authentication")]
    MissingUsername,

    #[error("client certificate path is required for certificate authentication")]
    MissingCertPath,

    #[error("client key path is required for certificate authentication")]
    MissingKeyPath,
}

/// Helper socket server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,

    #[error("failed to remove stale socket {}: {source}", path.display())]
    RemoveStale {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to bind socket {}: {source}", path.display())]
    Bind {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("socket group {0} not found")]
    GroupNotFound(String),

    #[error("failed to set socket ownership: {0}")]
    Ownership(String),

    #[error("failed to set socket permissions: {0}")]
    Permissions(std::io::Error),
}

/// Helper client proxy errors.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("helper daemon not available: {0}")]
    NotAvailable(String),

    /// The daemon answered with `success = false`.
    #[error("{code}: {message}")]
    Request { code: String, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("client closed")]
    Closed,

    #[error("failed to send request: {0}")]
    Send(String),

    #[error("invalid response from helper: {0}")]
    InvalidResponse(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Network interface discovery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetifError {
    #[error("VPN interface not found")]
    NotFound,

    #[error("failed to enumerate interfaces: {0}")]
    Enumerate(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, FortilinkError>;
