//! Private and reserved address detection for SSRF hardening.
//!
//! A single predicate shared by endpoint validation (construction time) and
//! the resolving dialer (every DNS lookup). The standard library's
//! `Ipv4Addr::is_private` does not cover link-local, CGNAT, or the 0.0.0.0/8
//! block, so the ranges are spelled out here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Returns true when `host` is a textual IP address inside a private or
/// otherwise non-routable range.
///
/// Covered ranges: `127.0.0.0/8`, `10.0.0.0/8`, `172.16.0.0/12`,
/// `192.168.0.0/16`, `169.254.0.0/16`, `100.64.0.0/10` (CGNAT),
/// `0.0.0.0/8`, IPv6 `::1`, `fc00::/7`, `fe80::/10`, and IPv4-mapped IPv6
/// addresses whose embedded IPv4 matches one of the above.
///
/// Hostnames are not private by virtue of their name: anything that fails to
/// parse as an IP address returns false. Resolution-time checks are the
/// resolver's job.
pub fn is_private_address(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(addr) => is_private_ip(addr),
        Err(_) => false,
    }
}

/// Range check over an already-parsed address.
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    match a {
        0 | 10 | 127 => true,
        100 => (64..=127).contains(&b),
        169 => b == 254,
        172 => (16..=31).contains(&b),
        192 => b == 168,
        _ => false,
    }
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() {
        return true;
    }
    // ::ffff:a.b.c.d delegates to the embedded IPv4 ranges
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let head = addr.segments()[0];
    (head & 0xfe00) == 0xfc00 || (head & 0xffc0) == 0xfe80
}
