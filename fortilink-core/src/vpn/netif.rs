//! VPN tunnel interface discovery.
//!
//! After the VPN reports an assigned address, the owning network
//! interface is looked up so callers can display or monitor it.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::NetifError;

/// Finds the network interface holding the given address.
pub fn detect_vpn_interface(assigned_ip: &str) -> Result<String, NetifError> {
    let target: IpAddr = assigned_ip.parse().map_err(|_| NetifError::NotFound)?;

    let addrs =
        nix::ifaddrs::getifaddrs().map_err(|err| NetifError::Enumerate(err.to_string()))?;
    for ifaddr in addrs {
        // openfortivpn creates ppp or tun devices (rarely tap); skip the rest.
        if !is_vpn_interface(&ifaddr.interface_name) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        if ip == target {
            return Ok(ifaddr.interface_name);
        }
    }

    Err(NetifError::NotFound)
}

fn is_vpn_interface(name: &str) -> bool {
    name.starts_with("ppp") || name.starts_with("tun") || name.starts_with("tap")
}

/// Retries [`detect_vpn_interface`] with exponential backoff; the tunnel
/// device can take a moment to appear after the address is reported.
pub async fn detect_interface_with_retry(
    assigned_ip: &str,
    max_retries: u32,
    initial_backoff: Duration,
) -> Result<String, NetifError> {
    let retries = if max_retries == 0 { 5 } else { max_retries };
    let mut backoff = if initial_backoff.is_zero() {
        Duration::from_millis(100)
    } else {
        initial_backoff
    };

    let mut last = NetifError::NotFound;
    for attempt in 0..retries {
        match detect_vpn_interface(assigned_ip) {
            Ok(name) => return Ok(name),
            Err(err) => last = err,
        }
        if attempt + 1 < retries {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_is_not_found() {
        assert_eq!(detect_vpn_interface(""), Err(NetifError::NotFound));
    }

    #[test]
    fn malformed_address_is_not_found() {
        assert_eq!(detect_vpn_interface("not-an-ip"), Err(NetifError::NotFound));
    }

    #[test]
    fn unassigned_address_is_not_found() {
        // TEST-NET-3, never assigned to a local interface.
        assert_eq!(
            detect_vpn_interface("203.0.113.77"),
            Err(NetifError::NotFound)
        );
    }

    #[test]
    fn vpn_interface_name_patterns() {
        assert!(is_vpn_interface("ppp0"));
        assert!(is_vpn_interface("tun3"));
        assert!(is_vpn_interface("tap1"));
        assert!(!is_vpn_interface("eth0"));
        assert!(!is_vpn_interface("wlan0"));
        assert!(!is_vpn_interface("lo"));
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let result =
            detect_interface_with_retry("203.0.113.77", 2, Duration::from_millis(1)).await;
        assert_eq!(result, Err(NetifError::NotFound));
    }
}
