//! Pattern-based parser for openfortivpn output.
//!
//! Maps single output lines to typed events. Stateless; unrecognized
//! lines yield `None`.

use once_cell::sync::Lazy;
use regex::Regex;

/// A typed event parsed from a line of openfortivpn output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A URL for web/SAML authentication.
    Authenticate { url: String },
    /// The tunnel is being established.
    Connecting,
    /// The tunnel is up and running.
    Connected,
    /// The tunnel has gone down.
    Disconnected,
    /// The VPN assigned an IP address.
    GotIp { ip: String },
    /// The client reported an error.
    Error { message: String },
    /// OTP/2FA input is needed.
    OtpRequired,
    /// Password input is needed.
    PasswordRequired,
}

impl OutputEvent {
    /// Stable wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OutputEvent::Authenticate { .. } => "authenticate",
            OutputEvent::Connecting => "connecting",
            OutputEvent::Connected => "connected",
            OutputEvent::Disconnected => "disconnected",
            OutputEvent::GotIp { .. } => "got_ip",
            OutputEvent::Error { .. } => "error",
            OutputEvent::OtpRequired => "otp_required",
            OutputEvent::PasswordRequired => "password_required",
        }
    }
}

// Matches: Authenticate at 'https://...'
static AUTHENTICATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Authenticate at '([^']+)'").expect("authenticate pattern"));

// Matches: Tunnel is up and running.
static TUNNEL_UP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tunnel is up and running").expect("tunnel up pattern"));

// Matches: Tunnel is down.
static TUNNEL_DOWN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tunnel is down").expect("tunnel down pattern"));

// Matches: Got addresses: [10.0.0.100], ns [...]
static GOT_ADDRESSES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Got addresses: \[([^\]]+)\]").expect("got addresses pattern"));

// Matches: ERROR: message
static ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ERROR:\s*(.+)").expect("error pattern"));

// Matches: Connecting to gateway...
static CONNECTING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Connecting to gateway").expect("connecting pattern"));

// Matches OTP/2FA prompts.
static OTP_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(two-factor|otp|token:)").expect("otp pattern"));

// Matches password prompts.
static PASSWORD_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)password:").expect("password pattern"));

/// Parses a single output line, trailing newline already stripped.
///
/// Patterns are evaluated in a fixed order and the first match wins.
pub fn parse_line(line: &str) -> Option<OutputEvent> {
    if line.trim().is_empty() {
        return None;
    }

    if let Some(caps) = AUTHENTICATE.captures(line) {
        return Some(OutputEvent::Authenticate {
            url: caps[1].to_string(),
        });
    }

    if TUNNEL_UP.is_match(line) {
        return Some(OutputEvent::Connected);
    }

    if TUNNEL_DOWN.is_match(line) {
        return Some(OutputEvent::Disconnected);
    }

    if let Some(caps) = GOT_ADDRESSES.captures(line) {
        return Some(OutputEvent::GotIp {
            ip: caps[1].to_string(),
        });
    }

    if let Some(caps) = ERROR_LINE.captures(line) {
        return Some(OutputEvent::Error {
            message: caps[1].trim().to_string(),
        });
    }

    if CONNECTING.is_match(line) {
        return Some(OutputEvent::Connecting);
    }

    if OTP_PROMPT.is_match(line) {
        return Some(OutputEvent::OtpRequired);
    }

    if PASSWORD_PROMPT.is_match(line) {
        return Some(OutputEvent::PasswordRequired);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authenticate_url() {
        let event = parse_line("Authenticate at 'https://vpn.example.com/saml?id=42'").unwrap();
        assert_eq!(
            event,
            OutputEvent::Authenticate {
                url: "https://vpn.example.com/saml?id=42".to_string()
            }
        );
    }

    #[test]
    fn parses_tunnel_up() {
        assert_eq!(
            parse_line("INFO:   Tunnel is up and running."),
            Some(OutputEvent::Connected)
        );
    }

    #[test]
    fn parses_tunnel_down() {
        assert_eq!(
            parse_line("INFO:   Tunnel is down."),
            Some(OutputEvent::Disconnected)
        );
    }

    #[test]
    fn parses_first_bracketed_address() {
        let event = parse_line("Got addresses: [10.0.0.50], ns [10.0.0.1, 10.0.0.2]").unwrap();
        assert_eq!(
            event,
            OutputEvent::GotIp {
                ip: "10.0.0.50".to_string()
            }
        );
    }

    #[test]
    fn parses_error_and_trims_message() {
        let event = parse_line("ERROR:  VPN authentication failed.").unwrap();
        assert_eq!(
            event,
            OutputEvent::Error {
                message: "VPN authentication failed.".to_string()
            }
        );
    }

    #[test]
    fn error_is_case_sensitive() {
        assert_eq!(parse_line("error: something"), None);
    }

    #[test]
    fn parses_connecting() {
        assert_eq!(
            parse_line("Connecting to gateway..."),
            Some(OutputEvent::Connecting)
        );
    }

    #[test]
    fn parses_otp_prompts_case_insensitively() {
        assert_eq!(parse_line("Two-factor code:"), Some(OutputEvent::OtpRequired));
        assert_eq!(parse_line("please enter OTP"), Some(OutputEvent::OtpRequired));
        assert_eq!(parse_line("Token: "), Some(OutputEvent::OtpRequired));
    }

    #[test]
    fn parses_password_prompt_case_insensitively() {
        assert_eq!(parse_line("Password:"), Some(OutputEvent::PasswordRequired));
        assert_eq!(parse_line("PASSWORD: "), Some(OutputEvent::PasswordRequired));
    }

    #[test]
    fn error_takes_precedence_over_prompts() {
        // Both the ERROR pattern and the password prompt match; order decides.
        let event = parse_line("ERROR: bad password: rejected").unwrap();
        assert_eq!(
            event,
            OutputEvent::Error {
                message: "bad password: rejected".to_string()
            }
        );
    }

    #[test]
    fn blank_lines_yield_nothing() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   \t  "), None);
    }

    #[test]
    fn unrecognized_lines_yield_nothing() {
        assert_eq!(parse_line("DEBUG:  Negotiating IPsec parameters"), None);
    }

    #[test]
    fn event_kinds_are_stable() {
        assert_eq!(OutputEvent::Connecting.kind(), "connecting");
        assert_eq!(
            OutputEvent::GotIp {
                ip: "10.0.0.1".to_string()
            }
            .kind(),
            "got_ip"
        );
        assert_eq!(OutputEvent::PasswordRequired.kind(), "password_required");
    }
}
