//! Connection state machine for the VPN session lifecycle.
//!
//! The set of legal transitions lives in a single declarative table;
//! transition code never encodes legality on its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the VPN connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No active VPN connection.
    #[default]
    Disconnected,
    /// Waiting for user authentication (e.g. SAML in a browser).
    Authenticating,
    /// The tunnel is being established.
    Connecting,
    /// The tunnel is active.
    Connected,
    /// Attempting to re-establish a dropped tunnel.
    Reconnecting,
    /// The connection attempt failed.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

impl ConnectionState {
    /// Returns true if the state represents an active VPN connection.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Returns true if the state represents an in-progress connection attempt.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting
        )
    }

    /// Returns true if a new connection can be initiated from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// Returns true if the connection can be terminated from this state.
    pub fn can_disconnect(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating
                | ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }

    /// All possible connection states.
    pub fn all() -> [ConnectionState; 6] {
        [
            ConnectionState::Disconnected,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ]
    }
}

/// Allowed state transitions, keyed by source state.
const VALID_TRANSITIONS: &[(ConnectionState, &[ConnectionState])] = &[
    (
        ConnectionState::Disconnected,
        &[ConnectionState::Authenticating, ConnectionState::Connecting],
    ),
    (
        ConnectionState::Authenticating,
        &[
            ConnectionState::Connecting,
            // After SAML auth completes the tunnel establishes directly.
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Failed,
        ],
    ),
    (
        ConnectionState::Connecting,
        &[
            // openfortivpn prompts for browser auth while connecting.
            ConnectionState::Authenticating,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Failed,
        ],
    ),
    (
        ConnectionState::Connected,
        &[ConnectionState::Disconnected, ConnectionState::Reconnecting],
    ),
    (
        ConnectionState::Reconnecting,
        &[
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Failed,
        ],
    ),
    (
        ConnectionState::Failed,
        &[
            ConnectionState::Disconnected,
            ConnectionState::Authenticating,
            ConnectionState::Connecting,
        ],
    ),
];

/// Checks whether transitioning between two states is allowed.
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    VALID_TRANSITIONS
        .iter()
        .find(|(state, _)| *state == from)
        .map(|(_, allowed)| allowed.contains(&to))
        .unwrap_or(false)
}
