//! URL and interface plumbing shared by the client and server engines.

use std::net::IpAddr;

use url::Url;

use crate::errors::{NetError, Result};

/// Default port per scheme: `http`/`ws` 80, `https`/`wss` 443.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// Whether the scheme requires a TLS transport.
pub fn is_secure_scheme(scheme: &str) -> bool {
    matches!(scheme, "https" | "wss")
}

/// Host string of a parsed URL, with IPv6 brackets stripped.
pub fn url_host(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| NetError::Protocol(format!("URL {url} has no host")))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

/// Effective port of a parsed URL (explicit, else per scheme).
pub fn url_port(url: &Url) -> Result<u16> {
    url.port()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| NetError::Protocol(format!("URL {url} has no usable port")))
}

/// Path plus query, the request target for origin-form requests.
pub fn url_target(url: &Url) -> String {
    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Merge the query parameters of `from` into `onto`, keeping `onto`'s
/// values on key collisions. Used when following redirects.
pub fn merge_query(onto: &mut Url, from: &Url) {
    let existing: Vec<(String, String)> = onto
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let inherited: Vec<(String, String)> = from
        .query_pairs()
        .filter(|(k, _)| !existing.iter().any(|(ek, _)| ek == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if inherited.is_empty() {
        return;
    }
    let mut pairs = existing;
    pairs.extend(inherited);
    let mut serializer = onto.query_pairs_mut();
    serializer.clear();
    for (k, v) in &pairs {
        serializer.append_pair(k, v);
    }
    drop(serializer);
}

/// MAC address of `ip` from the kernel neighbour table, for the server's
/// admission callback. Best-effort: unknown peers and non-Linux hosts give
/// an empty string.
pub fn lookup_mac(ip: IpAddr) -> String {
    #[cfg(target_os = "linux")]
    {
        let needle = ip.to_string();
        if let Ok(table) = std::fs::read_to_string("/proc/net/arp") {
            for line in table.lines().skip(1) {
                let mut fields = line.split_whitespace();
                let entry_ip = fields.next().unwrap_or_default();
                if entry_ip != needle {
                    continue;
                }
                // IP address | HW type | Flags | HW address | Mask | Device
                if let Some(mac) = fields.nth(2) {
                    if mac != "00:00:00:00:00:00" {
                        return mac.to_string();
                    }
                }
            }
        }
        String::new()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = ip;
        String::new()
    }
}
