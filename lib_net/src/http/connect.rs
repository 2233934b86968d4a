//! HTTP CONNECT tunnel establishment (client side).
//!
//! Sends `CONNECT host:port HTTP/1.1` to the configured proxy, optionally
//! answering one `407 Proxy-Authenticate` challenge, and reports success on
//! any 2xx status. Bytes that follow the response head belong to the tunnel.

use crate::auth::client::AuthClient;
use crate::auth::{Algorithm, AuthType, Credentials};
use crate::errors::{NetError, Result};
use crate::http::codec::{HttpCodec, Message, Request};

/// Progress report from [`ConnectSm::feed`].
#[derive(Debug)]
pub enum Step {
    /// More bytes are needed.
    Pending,
    /// Put these bytes on the wire (auth retry) and keep feeding.
    Send(Vec<u8>),
    /// The tunnel is established.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitResponse,
    Done,
    Failed,
}

/// CONNECT handshake machine.
pub struct ConnectSm {
    state: State,
    host: String,
    port: u16,
    auth: AuthClient,
    codec: HttpCodec,
    auth_attempted: bool,
}

impl ConnectSm {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        auth_type: AuthType,
        algorithm: Algorithm,
        credentials: Option<Credentials>,
    ) -> Self {
        let host = host.into();
        let mut auth = AuthClient::new(auth_type, algorithm);
        if let Some(creds) = credentials {
            auth.set_credentials(creds);
        }
        auth.set_uri(format!("{host}:{port}"));
        let mut codec = HttpCodec::response();
        codec.expect_connect_response(true);
        Self {
            state: State::Start,
            host,
            port,
            auth,
            codec,
            auth_attempted: false,
        }
    }

    /// First bytes on the wire.
    pub fn start(&mut self) -> Vec<u8> {
        self.state = State::AwaitResponse;
        self.request().encode()
    }

    pub fn is_handshake(&self) -> bool {
        self.state == State::Done
    }

    pub fn is_end(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Bytes that arrived after the 2xx head belong to the origin.
    pub fn take_residue(&mut self) -> Vec<u8> {
        self.codec.take_residue()
    }

    /// Feed proxy bytes; returns what to do next.
    pub fn feed(&mut self, data: &[u8]) -> Result<Step> {
        if self.state != State::AwaitResponse {
            return Err(NetError::Protocol("CONNECT fed outside the response wait".into()));
        }
        let Some(message) = self.codec.feed(data)? else {
            return Ok(Step::Pending);
        };
        let Message::Response(response) = message else {
            return Err(NetError::Protocol("request received where a response was due".into()));
        };
        if response.is_success() {
            self.state = State::Done;
            return Ok(Step::Done);
        }
        if response.code == 407 {
            let challenge = response
                .headers
                .get("Proxy-Authenticate")
                .ok_or_else(|| NetError::Proxy("407 without Proxy-Authenticate".into()))?;
            self.auth.set_header(challenge);
            // one retry with credentials; a stale nonce grants one more
            let allowed = !self.auth_attempted || self.auth.is_stale();
            if allowed && self.auth.credentials().is_some() {
                self.auth_attempted = true;
                self.codec.reset();
                self.codec.expect_connect_response(true);
                return Ok(Step::Send(self.request().encode()));
            }
            self.state = State::Failed;
            return Err(NetError::AuthFailed("proxy rejected the credentials".into()));
        }
        self.state = State::Failed;
        Err(NetError::Proxy(format!(
            "CONNECT answered {} {}",
            response.code, response.reason
        )))
    }

    fn request(&mut self) -> Request {
        let authority = format!("{}:{}", self.host, self.port);
        let mut request = Request::new("CONNECT", authority.clone());
        request.headers.set("Host", authority);
        request.headers.set("Proxy-Connection", "keep-alive");
        if let Some(value) = self.auth.header_value("CONNECT") {
            request.headers.set("Proxy-Authorization", value);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_connect_succeeds_on_200() {
        let mut sm = ConnectSm::new("origin.example", 443, AuthType::None, Algorithm::Md5, None);
        let wire = String::from_utf8(sm.start()).unwrap();
        assert!(wire.starts_with("CONNECT origin.example:443 HTTP/1.1\r\n"));
        assert!(wire.contains("Host: origin.example:443\r\n"));
        let step = sm.feed(b"HTTP/1.1 200 Connection Established\r\n\r\n").unwrap();
        assert!(matches!(step, Step::Done));
        assert!(sm.is_handshake());
    }

    #[test]
    fn basic_credentials_sent_upfront() {
        let mut sm = ConnectSm::new(
            "origin",
            443,
            AuthType::Basic,
            Algorithm::Md5,
            Some(Credentials::new("user", "pass")),
        );
        let wire = String::from_utf8(sm.start()).unwrap();
        assert!(wire.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn digest_challenge_retried_once() {
        let mut sm = ConnectSm::new(
            "origin",
            443,
            AuthType::Digest,
            Algorithm::Md5,
            Some(Credentials::new("user", "pass")),
        );
        let first = String::from_utf8(sm.start()).unwrap();
        assert!(!first.contains("Proxy-Authorization"));
        let challenge = "HTTP/1.1 407 Proxy Authentication Required\r\n\
                         Proxy-Authenticate: Digest realm=\"proxy\", nonce=\"n1\", qop=\"auth\"\r\n\
                         Content-Length: 0\r\n\r\n";
        let Step::Send(retry) = sm.feed(challenge.as_bytes()).unwrap() else {
            panic!("expected the retry request");
        };
        let retry = String::from_utf8(retry).unwrap();
        assert!(retry.contains("Proxy-Authorization: Digest username=\"user\""));
        assert!(retry.contains("uri=\"origin:443\""));
        // a second plain 407 is final
        let err = sm.feed(challenge.as_bytes()).unwrap_err();
        assert!(matches!(err, NetError::AuthFailed(_)));
    }

    #[test]
    fn residue_is_handed_to_the_tunnel() {
        let mut sm = ConnectSm::new("origin", 443, AuthType::None, Algorithm::Md5, None);
        let _ = sm.start();
        let step = sm
            .feed(b"HTTP/1.1 200 OK\r\n\r\n\x16\x03\x01app")
            .unwrap();
        assert!(matches!(step, Step::Done));
        assert_eq!(sm.take_residue(), b"\x16\x03\x01app");
    }

    #[test]
    fn non_2xx_is_proxy_error() {
        let mut sm = ConnectSm::new("origin", 443, AuthType::None, Algorithm::Md5, None);
        let _ = sm.start();
        let err = sm
            .feed(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, NetError::Proxy(_)));
    }
}
