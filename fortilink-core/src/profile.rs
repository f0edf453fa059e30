//! VPN connection profiles.
//!
//! Profiles are supplied by callers (the GUI stores them on disk); the
//! helper validates them before any process is spawned. Host validation is
//! strict because the value ends up on a privileged command line.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProfileError;

/// Authentication method for a VPN profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Otp,
    Certificate,
    Saml,
}

impl AuthMethod {
    /// All valid authentication methods.
    pub fn all() -> [AuthMethod; 4] {
        [
            AuthMethod::Password,
            AuthMethod::Otp,
            AuthMethod::Certificate,
            AuthMethod::Saml,
        ]
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthMethod::Password => "password",
            AuthMethod::Otp => "otp",
            AuthMethod::Certificate => "certificate",
            AuthMethod::Saml => "saml",
        };
        write!(f, "{name}")
    }
}

// Maximum lengths for text fields to prevent UI issues.
const MAX_NAME_LENGTH: usize = 100;
const MAX_DESCRIPTION_LENGTH: usize = 500;

// Shell metacharacters and separators that must never reach the argv.
const FORBIDDEN_HOST_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '\\', '\'', '"', '\n', '\r',
    '\t', ' ',
];

/// A VPN connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub host: String,
    pub port: u16,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub username: String,
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
    /// Consumed by the reconnect policy layer, never by the helper itself.
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl Profile {
    /// Creates a profile with default values and a generated UUID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            host: String::new(),
            port: 443,
            auth_method: AuthMethod::Password,
            username: String::new(),
            realm: String::new(),
            trusted_cert: String::new(),
            client_cert_path: String::new(),
            client_key_path: String::new(),
            set_dns: true,
            set_routes: true,
            half_internet_routes: false,
            auto_reconnect: true,
        }
    }

    /// Checks that the profile is safe and complete enough to connect with.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.id.is_empty() {
            return Err(ProfileError::MissingId);
        }
        Uuid::parse_str(&self.id).map_err(|err| ProfileError::InvalidId(err.to_string()))?;

        if self.name.trim().is_empty() {
            return Err(ProfileError::MissingName);
        }
        validate_text(&self.name, "name", MAX_NAME_LENGTH)?;

        if !self.description.is_empty() {
            validate_text(&self.description, "description", MAX_DESCRIPTION_LENGTH)?;
        }

        if self.host.trim().is_empty() {
            return Err(ProfileError::MissingHost);
        }
        validate_host(&self.host)?;

        if self.port == 0 {
            return Err(ProfileError::InvalidPort);
        }

        match self.auth_method {
            AuthMethod::Password | AuthMethod::Otp => {
                if self.username.trim().is_empty() {
                    return Err(ProfileError::MissingUsername);
                }
            }
            // Username is optional for SAML; credentials come from the browser.
            AuthMethod::Saml => {}
            AuthMethod::Certificate => {
                if self.client_cert_path.trim().is_empty() {
                    return Err(ProfileError::MissingCertPath);
                }
                if self.client_key_path.trim().is_empty() {
                    return Err(ProfileError::MissingKeyPath);
                }
            }
        }

        Ok(())
    }
}

/// Validates that the host is a safe hostname or IP literal.
fn validate_host(host: &str) -> Result<(), ProfileError> {
    if host.is_empty() {
        return Err(ProfileError::MissingHost);
    }

    for ch in host.chars() {
        if ch.is_control() {
            return Err(ProfileError::InvalidHost(
                "contains control characters".to_string(),
            ));
        }
        if FORBIDDEN_HOST_CHARS.contains(&ch) {
            return Err(ProfileError::InvalidHost(format!(
                "contains forbidden character {ch:?}"
            )));
        }
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    // RFC 1123 hostname rules.
    if host.len() > 253 {
        return Err(ProfileError::InvalidHost(
            "hostname too long (max 253 characters)".to_string(),
        ));
    }
    if host.starts_with('-') || host.ends_with('-') {
        return Err(ProfileError::InvalidHost(
            "hostname cannot start or end with hyphen".to_string(),
        ));
    }
    if host.starts_with('.') || host.ends_with('.') {
        return Err(ProfileError::InvalidHost(
            "hostname cannot start or end with dot".to_string(),
        ));
    }

    for label in host.split('.') {
        if label.is_empty() {
            return Err(ProfileError::InvalidHost(
                "empty label in hostname".to_string(),
            ));
        }
        if label.len() > 63 {
            return Err(ProfileError::InvalidHost(
                "label too long (max 63 characters)".to_string(),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ProfileError::InvalidHost(
                "label cannot start or end with hyphen".to_string(),
            ));
        }
        if let Some(ch) = label.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(ProfileError::InvalidHost(format!(
                "invalid character {ch:?} in hostname"
            )));
        }
    }

    Ok(())
}

/// Validates a single-line text field for control characters and length.
fn validate_text(value: &str, field: &'static str, max: usize) -> Result<(), ProfileError> {
    if value.len() > max {
        return Err(ProfileError::FieldTooLong { field, max });
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(ProfileError::ControlCharacter { field });
    }
    Ok(())
}
