//! # SOCKS5
//!
//! The RFC 1928/1929 subset this framework speaks on both sides of the wire:
//! methods `0x00` (no auth) and `0x02` (username/password), command
//! `CONNECT`, address types IPv4, domain and IPv6. Multi-byte fields are
//! big-endian.
//!
//! The state machines consume bytes from the owning broker's read buffer and
//! emit complete wire messages; they never touch the socket themselves.

pub mod client;
pub mod server;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::errors::{NetError, Result};

/// Protocol version octet.
pub const VERSION: u8 = 0x05;
/// Username/password sub-negotiation version octet.
pub const AUTH_VERSION: u8 = 0x01;

/// Method bytes offered and selected during the greeting.
pub mod method {
    pub const NO_AUTH: u8 = 0x00;
    pub const USERPASS: u8 = 0x02;
    pub const NO_ACCEPTABLE: u8 = 0xFF;
}

/// Command bytes. Only CONNECT is supported.
pub mod cmd {
    pub const CONNECT: u8 = 0x01;
}

/// Address-type bytes.
pub mod atyp {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

/// Reply codes carried in the request response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Succeeded),
            0x01 => Some(Self::GeneralFailure),
            0x03 => Some(Self::NetworkUnreachable),
            0x04 => Some(Self::HostUnreachable),
            0x05 => Some(Self::ConnectionRefused),
            0x07 => Some(Self::CommandNotSupported),
            0x08 => Some(Self::AddressTypeNotSupported),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::GeneralFailure => "general SOCKS server failure",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::ConnectionRefused => "connection refused",
            Self::CommandNotSupported => "command not supported",
            Self::AddressTypeNotSupported => "address type not supported",
        }
    }

    /// Map a dial error to the closest reply code.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::HostUnreachable => Self::HostUnreachable,
            ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            _ => Self::GeneralFailure,
        }
    }
}

/// Destination requested through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Address family selector for the text/byte converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Strict text-to-binary conversion; IPv6 may be wrapped in brackets.
/// Text that does not parse under the requested family yields `None`.
pub fn ip_to_octets(text: &str, family: Family) -> Option<Vec<u8>> {
    match family {
        Family::V4 => text.parse::<Ipv4Addr>().ok().map(|ip| ip.octets().to_vec()),
        Family::V6 => {
            let trimmed = text
                .strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .unwrap_or(text);
            trimmed.parse::<Ipv6Addr>().ok().map(|ip| ip.octets().to_vec())
        }
    }
}

/// Binary-to-canonical-text conversion; the buffer must be exactly 4 or 16
/// bytes for the requested family.
pub fn octets_to_ip(buf: &[u8], family: Family) -> Option<String> {
    match family {
        Family::V4 => {
            let octets: [u8; 4] = buf.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        Family::V6 => {
            let octets: [u8; 16] = buf.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
    }
}

/// Append the wire encoding of `target` (ATYP + ADDR + PORT).
pub fn encode_addr(target: &TargetAddr, out: &mut Vec<u8>) {
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            out.push(atyp::IPV4);
            out.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            out.push(atyp::IPV6);
            out.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Domain(host, _) => {
            out.push(atyp::DOMAIN);
            out.push(host.len().min(u8::MAX as usize) as u8);
            out.extend_from_slice(&host.as_bytes()[..host.len().min(u8::MAX as usize)]);
        }
    }
    out.extend_from_slice(&target.port().to_be_bytes());
}

/// Decode ATYP + ADDR + PORT starting at `buf[0]`.
///
/// Returns `Ok(None)` while the buffer is still incomplete, otherwise the
/// target and the number of bytes consumed.
pub fn decode_addr(buf: &[u8]) -> Result<Option<(TargetAddr, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let (addr, used) = match buf[0] {
        atyp::IPV4 => {
            if buf.len() < 1 + 4 + 2 {
                return Ok(None);
            }
            let octets: [u8; 4] = buf[1..5].try_into().expect("length checked");
            (IpAddr::from(Ipv4Addr::from(octets)), 5)
        }
        atyp::IPV6 => {
            if buf.len() < 1 + 16 + 2 {
                return Ok(None);
            }
            let octets: [u8; 16] = buf[1..17].try_into().expect("length checked");
            (IpAddr::from(Ipv6Addr::from(octets)), 17)
        }
        atyp::DOMAIN => {
            if buf.len() < 2 {
                return Ok(None);
            }
            let len = buf[1] as usize;
            if buf.len() < 2 + len + 2 {
                return Ok(None);
            }
            let host = std::str::from_utf8(&buf[2..2 + len])
                .map_err(|_| NetError::Protocol("domain name is not valid UTF-8".into()))?
                .to_string();
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            return Ok(Some((TargetAddr::Domain(host, port), 2 + len + 2)));
        }
        other => {
            return Err(NetError::Protocol(format!(
                "unsupported SOCKS5 address type 0x{other:02x}"
            )))
        }
    };
    let port = u16::from_be_bytes([buf[used], buf[used + 1]]);
    Ok(Some((TargetAddr::Ip(SocketAddr::new(addr, port)), used + 2)))
}

/// Build the request reply: `05 REP 00 ATYP BND.ADDR BND.PORT`.
pub fn encode_reply(rep: Reply, bind: Option<SocketAddr>) -> Vec<u8> {
    let bind = bind.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut out = vec![VERSION, rep as u8, 0x00];
    encode_addr(&TargetAddr::Ip(bind), &mut out);
    out
}
