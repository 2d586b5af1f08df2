// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

// Network utility functions

use std::net::IpAddr;

/// Check if a host address is a loopback address
/// Supports IPv4 (127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts are treated as remote
    false
}

/// Join host and port for use in a URL or bind address.
/// Bare IPv6 literals are bracketed.
pub fn format_host_port(host: &str, port: u16) -> String {
    let needs_brackets = host.contains(':') && !host.starts_with('[');
    if needs_brackets {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
