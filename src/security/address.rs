use std::net::IpAddr;
use std::time::Duration;

/// Upper bound on the DNS lookup performed while classifying a host.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether `host` points at an address that must never be fetched.
///
/// Literal fast paths run first so the most common SSRF payloads are rejected
/// without touching DNS. A hostname is then resolved once; if any resolved
/// address is internal the host is blocked.
///
/// Resolution failures (and resolution timeouts) are treated as **not
/// blocked**: an unresolvable name will fail at connect time anyway, and a
/// transient DNS hiccup must not reject a legitimate external feed.
pub async fn is_blocked_host(host: &str) -> bool {
    let host = normalize_host(host);
    if host.is_empty() {
        return false;
    }

    if is_blocked_literal(&host) {
        return true;
    }

    // Already an IP literal that passed the checks above
    if host.parse::<IpAddr>().is_ok() {
        return false;
    }

    let lookup =
        tokio::time::timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host((host.as_str(), 0))).await;

    match lookup {
        Ok(Ok(addrs)) => {
            for addr in addrs {
                if is_blocked_ip(&addr.ip()) {
                    tracing::debug!(host = %host, ip = %addr.ip(), "Host resolves to internal address");
                    return true;
                }
            }
            false
        }
        Ok(Err(e)) => {
            tracing::debug!(host = %host, error = %e, "DNS lookup failed, allowing host");
            false
        }
        Err(_) => {
            tracing::debug!(host = %host, "DNS lookup timed out, allowing host");
            false
        }
    }
}

/// Classifies a host using only its textual form: the string fast paths plus
/// IP-literal parsing. Never performs I/O.
pub fn is_blocked_literal(host: &str) -> bool {
    let host = normalize_host(host);

    if matches_fast_path(&host) {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(ip) => is_blocked_ip(&ip),
        Err(_) => false,
    }
}

/// Returns true for loopback, link-local, RFC 1918 private, IPv6 unique-local,
/// multicast and unspecified addresses (IPv4-mapped IPv6 is unwrapped first).
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_unspecified()
                || ipv4.is_multicast()
        }
        IpAddr::V6(ipv6) => {
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_blocked_ip(&IpAddr::V4(mapped));
            }
            if ipv6.is_loopback() || ipv6.is_unspecified() || ipv6.is_multicast() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

fn matches_fast_path(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") || host == "::1" {
        return true;
    }
    if host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("169.254.")
    {
        return true;
    }
    // 172.16.0.0/12 spelled out: 172.16.* through 172.31.*
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some((second, _)) = rest.split_once('.') {
            if let Ok(octet) = second.parse::<u8>() {
                return (16..=31).contains(&octet);
            }
        }
    }
    false
}

/// Lowercases, strips IPv6 brackets and a trailing root dot.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}
