//! Device address validation

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;

use nw_core::error::WardenError;
use nw_core::types::DeviceRef;

static MAC_PATTERN: OnceLock<Regex> = OnceLock::new();

fn mac_pattern() -> &'static Regex {
    MAC_PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$|^(?:[0-9A-Fa-f]{2}-){5}[0-9A-Fa-f]{2}$")
            .expect("MAC pattern compiles")
    })
}

/// Dotted-quad IPv4; every rule is rendered for `iptables`
pub fn is_valid_ip(value: &str) -> bool {
    value.parse::<Ipv4Addr>().is_ok()
}

/// Colon or hyphen separated, not mixed
pub fn is_valid_mac(value: &str) -> bool {
    mac_pattern().is_match(value)
}

/// Lowercase, colon-separated form
pub fn normalize_mac(value: &str) -> String {
    value.to_ascii_lowercase().replace('-', ":")
}

/// Pair up IPs and MACs by position and validate them.
///
/// Fails on the first malformed value, on mismatched list lengths, and on a
/// device repeated within the request. MACs come back normalized.
pub fn validate_devices(ips: &[String], macs: &[String]) -> Result<Vec<DeviceRef>, WardenError> {
    if ips.len() != macs.len() {
        return Err(WardenError::InvalidFormat(format!(
            "{} IP addresses but {} MAC addresses",
            ips.len(),
            macs.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(ips.len());
    for (ip, mac) in ips.iter().zip(macs) {
        let ip = ip.trim();
        let mac = mac.trim();
        if !is_valid_ip(ip) {
            return Err(WardenError::InvalidFormat(format!("invalid IP address: {}", ip)));
        }
        if !is_valid_mac(mac) {
            return Err(WardenError::InvalidFormat(format!("invalid MAC address: {}", mac)));
        }
        let device = DeviceRef::new(ip, normalize_mac(mac));
        for key in [&device.ip, &device.mac] {
            if !seen.insert(key.clone()) {
                return Err(WardenError::InvalidFormat(format!(
                    "{} appears more than once in the request",
                    key
                )));
            }
        }
        devices.push(device);
    }
    Ok(devices)
}
