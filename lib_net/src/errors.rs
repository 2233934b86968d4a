//! Stable error taxonomy carried across the broker boundary.
//!
//! Transport and framing failures are caught at the broker boundary and
//! surfaced through `on_error` with a kind and a human message; the event
//! loop itself is never crashed by a single broker's failure.

use thiserror::Error;

/// Discriminant of [`NetError`], handed to `on_error` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket or TLS I/O failure.
    Transport,
    /// WebSocket accept mismatch, malformed HTTP status line, SOCKS5 version != 5.
    HandshakeInvalid,
    /// Server answered 401/407; retried once with credentials.
    AuthRequired,
    /// Credentials wrong or missing after the retry.
    AuthFailed,
    /// SOCKS5 REP != 0 or CONNECT answered non-2xx.
    Proxy,
    /// Read/write/connect deadline expired.
    Timeout,
    /// Orderly close by the peer.
    PeerClosed,
    /// Framing violation (chunked encoding, WS opcode).
    Protocol,
    /// File-descriptor ceiling or allocation failure.
    ResourceExhausted,
}

/// Library error type.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("handshake invalid: {0}")]
    HandshakeInvalid(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl NetError {
    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Transport(_) => ErrorKind::Transport,
            NetError::HandshakeInvalid(_) => ErrorKind::HandshakeInvalid,
            NetError::AuthRequired => ErrorKind::AuthRequired,
            NetError::AuthFailed(_) => ErrorKind::AuthFailed,
            NetError::Proxy(_) => ErrorKind::Proxy,
            NetError::Timeout(_) => ErrorKind::Timeout,
            NetError::PeerClosed => ErrorKind::PeerClosed,
            NetError::Protocol(_) => ErrorKind::Protocol,
            NetError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Whether the pipeline may transparently retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetError::AuthRequired | NetError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(NetError::PeerClosed.kind(), ErrorKind::PeerClosed);
        assert_eq!(NetError::Timeout("read").kind(), ErrorKind::Timeout);
        let io = NetError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(io.kind(), ErrorKind::Transport);
    }

    #[test]
    fn retryable_set() {
        assert!(NetError::AuthRequired.is_retryable());
        assert!(NetError::Timeout("connect").is_retryable());
        assert!(!NetError::PeerClosed.is_retryable());
        assert!(!NetError::AuthFailed("bad pass".into()).is_retryable());
    }
}
