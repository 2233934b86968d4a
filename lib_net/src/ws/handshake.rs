//! # WebSocket handshake
//!
//! Key/accept derivation, version check, subprotocol selection and
//! `permessage-deflate` negotiation for both ends of the upgrade:
//! - the client builds the `GET` upgrade request and verifies the echoed
//!   accept value;
//! - the server validates the request (version 13, key present), picks the
//!   first offered subprotocol it supports and honors
//!   `client_max_window_bits` clamped to `[8, 15]` (a bare token means 15).

#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha1::{Digest as _, Sha1};

use super::CompressMode;
use crate::errors::{NetError, Result};
use crate::http::codec::{Headers, Request, Response};

/// Handshake GUID fixed by RFC 6455.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// The only protocol version this framework speaks.
pub const WS_VERSION: u8 = 13;

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

/// `Sec-WebSocket-Key`: base64 of 16 random bytes.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

/// `Sec-WebSocket-Accept = base64(SHA-1(key ++ GUID))`.
pub fn accept_of(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Outcome of the permessage-deflate negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Window bits the client-to-server direction compresses with.
    pub client_max_window_bits: u8,
    /// Window bits the server-to-client direction compresses with.
    pub server_max_window_bits: u8,
    /// `perframe-deflate` instead of `permessage-deflate`.
    pub per_frame: bool,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            client_max_window_bits: MAX_WINDOW_BITS,
            server_max_window_bits: MAX_WINDOW_BITS,
            per_frame: false,
        }
    }
}

/// What both sides agreed on.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    pub subprotocol: Option<String>,
    pub deflate: Option<DeflateConfig>,
}

/// Parse a `Sec-WebSocket-Extensions` value into a deflate config.
///
/// Unknown extensions are ignored; absence of both deflate tokens yields
/// `None`. Window-bit values are clamped to `[8, 15]`; a bare
/// `client_max_window_bits` selects the maximum.
pub fn parse_extensions(value: &str) -> Option<DeflateConfig> {
    let mut config: Option<DeflateConfig> = None;
    for extension in value.split(',') {
        let mut parts = extension.split(';').map(str::trim);
        let Some(name) = parts.next() else { continue };
        let per_frame = match name {
            "permessage-deflate" => false,
            "perframe-deflate" => true,
            _ => continue,
        };
        let mut parsed = DeflateConfig { per_frame, ..DeflateConfig::default() };
        for param in parts {
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
                None => (param, None),
            };
            match key {
                "client_max_window_bits" => {
                    parsed.client_max_window_bits = clamp_window_bits(value);
                }
                "server_max_window_bits" => {
                    parsed.server_max_window_bits = clamp_window_bits(value);
                }
                _ => {}
            }
        }
        config = Some(parsed);
        break;
    }
    config
}

fn clamp_window_bits(value: Option<&str>) -> u8 {
    match value.and_then(|v| v.parse::<u8>().ok()) {
        Some(bits) => bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS),
        None => MAX_WINDOW_BITS,
    }
}

/// Client half of the upgrade.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    host: String,
    target: String,
    subprotocols: Vec<String>,
    compress: CompressMode,
}

impl ClientHandshake {
    pub fn new(
        host: impl Into<String>,
        target: impl Into<String>,
        subprotocols: Vec<String>,
        compress: CompressMode,
    ) -> Self {
        Self {
            key: generate_key(),
            host: host.into(),
            target: target.into(),
            subprotocols,
            compress,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the upgrade request; `extra` carries scheme headers such as
    /// `Authorization`.
    pub fn request(&self, extra: &Headers) -> Request {
        let mut request = Request::new("GET", self.target.as_str());
        request.headers.set("Host", self.host.as_str());
        request.headers.set("Upgrade", "websocket");
        request.headers.set("Connection", "Upgrade");
        request.headers.set("Sec-WebSocket-Key", self.key.as_str());
        request.headers.set("Sec-WebSocket-Version", WS_VERSION.to_string());
        if !self.subprotocols.is_empty() {
            request
                .headers
                .set("Sec-WebSocket-Protocol", self.subprotocols.join(", "));
        }
        match self.compress {
            CompressMode::PerMessage => {
                request
                    .headers
                    .set("Sec-WebSocket-Extensions", "permessage-deflate; client_max_window_bits");
            }
            CompressMode::PerFrame => {
                request
                    .headers
                    .set("Sec-WebSocket-Extensions", "perframe-deflate; client_max_window_bits");
            }
            CompressMode::None => {}
        }
        for (name, value) in extra.iter() {
            request.headers.set(name, value);
        }
        request
    }

    /// Validate the server's `101` answer against our own key.
    pub fn verify(&self, response: &Response) -> Result<Negotiated> {
        if response.code != 101 {
            return Err(NetError::HandshakeInvalid(format!(
                "upgrade answered {} {}",
                response.code, response.reason
            )));
        }
        let upgraded = response
            .headers
            .get("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if !upgraded {
            return Err(NetError::HandshakeInvalid("missing Upgrade: websocket".into()));
        }
        let accept = response
            .headers
            .get("Sec-WebSocket-Accept")
            .unwrap_or_default();
        if accept != accept_of(&self.key) {
            return Err(NetError::HandshakeInvalid(
                "Sec-WebSocket-Accept does not match the key".into(),
            ));
        }
        let subprotocol = response
            .headers
            .get("Sec-WebSocket-Protocol")
            .map(str::to_string);
        if let Some(chosen) = &subprotocol {
            if !self.subprotocols.iter().any(|s| s == chosen) {
                return Err(NetError::HandshakeInvalid(format!(
                    "server selected unoffered subprotocol {chosen:?}"
                )));
            }
        }
        let deflate = response
            .headers
            .get("Sec-WebSocket-Extensions")
            .and_then(parse_extensions);
        Ok(Negotiated { subprotocol, deflate })
    }
}

/// Server half of the upgrade.
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    subprotocols: Vec<String>,
    deflate: bool,
}

impl ServerHandshake {
    pub fn new(subprotocols: Vec<String>, deflate: bool) -> Self {
        Self { subprotocols, deflate }
    }

    /// Validate the upgrade request and produce the `101` answer plus the
    /// negotiated parameters.
    pub fn accept(&self, request: &Request) -> Result<(Response, Negotiated)> {
        let upgraded = request
            .headers
            .get("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if !upgraded {
            return Err(NetError::HandshakeInvalid("missing Upgrade: websocket".into()));
        }
        let version_ok = request
            .headers
            .get_all("Sec-WebSocket-Version")
            .any(|v| v.trim().parse::<u8>() == Ok(WS_VERSION));
        if !version_ok {
            return Err(NetError::HandshakeInvalid(format!(
                "unsupported WebSocket version, need {WS_VERSION}"
            )));
        }
        let key = request
            .headers
            .get("Sec-WebSocket-Key")
            .ok_or_else(|| NetError::HandshakeInvalid("missing Sec-WebSocket-Key".into()))?;

        // first client-offered subprotocol present in our supported set;
        // no match simply omits the header
        let subprotocol = request
            .headers
            .get_all("Sec-WebSocket-Protocol")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .find(|offer| self.subprotocols.iter().any(|s| s == offer))
            .map(str::to_string);

        let deflate = if self.deflate {
            request
                .headers
                .get_all("Sec-WebSocket-Extensions")
                .find_map(parse_extensions)
        } else {
            None
        };

        let mut response = Response::new(101);
        response.headers.set("Upgrade", "websocket");
        response.headers.set("Connection", "Upgrade");
        response.headers.set("Sec-WebSocket-Accept", accept_of(key));
        if let Some(subprotocol) = &subprotocol {
            response.headers.set("Sec-WebSocket-Protocol", subprotocol.as_str());
        }
        if let Some(config) = &deflate {
            let name = if config.per_frame { "perframe-deflate" } else { "permessage-deflate" };
            response.headers.set(
                "Sec-WebSocket-Extensions",
                format!("{name}; client_max_window_bits={}", config.client_max_window_bits),
            );
        }
        Ok((response, Negotiated { subprotocol, deflate }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_accept_fixture() {
        assert_eq!(
            accept_of("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_decode_to_16_bytes() {
        let key = generate_key();
        assert_eq!(BASE64.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn base64_round_trips_arbitrary_bytes() {
        for len in [0usize, 1, 2, 3, 17, 255] {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 % 256) as u8).collect();
            assert_eq!(BASE64.decode(BASE64.encode(&data)).unwrap(), data);
        }
        assert_eq!(BASE64.encode(b"u:p"), "dTpw");
    }

    fn upgrade_request(extensions: Option<&str>, protocols: Option<&str>) -> Request {
        let mut request = Request::new("GET", "/chat");
        request.headers.set("Host", "server.example.com");
        request.headers.set("Upgrade", "websocket");
        request.headers.set("Connection", "Upgrade");
        request.headers.set("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        request.headers.set("Sec-WebSocket-Version", "13");
        if let Some(ext) = extensions {
            request.headers.set("Sec-WebSocket-Extensions", ext);
        }
        if let Some(protocols) = protocols {
            request.headers.set("Sec-WebSocket-Protocol", protocols);
        }
        request
    }

    #[test]
    fn server_accept_round_trip() {
        let server = ServerHandshake::new(vec!["chat".into()], true);
        let (response, negotiated) = server
            .accept(&upgrade_request(None, Some("superchat, chat")))
            .unwrap();
        assert_eq!(response.code, 101);
        assert_eq!(
            response.headers.get("Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(negotiated.subprotocol.as_deref(), Some("chat"));
        assert!(negotiated.deflate.is_none());
    }

    #[test]
    fn no_subprotocol_match_omits_header() {
        let server = ServerHandshake::new(vec!["graphql-ws".into()], false);
        let (response, negotiated) = server
            .accept(&upgrade_request(None, Some("soap, wamp")))
            .unwrap();
        assert!(negotiated.subprotocol.is_none());
        assert!(!response.headers.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let server = ServerHandshake::new(Vec::new(), false);
        let mut request = upgrade_request(None, None);
        request.headers.set("Sec-WebSocket-Version", "8");
        assert!(server.accept(&request).is_err());
    }

    #[test]
    fn window_bits_clamped_and_bare_means_max() {
        let config = parse_extensions("permessage-deflate; client_max_window_bits=10").unwrap();
        assert_eq!(config.client_max_window_bits, 10);
        let config = parse_extensions("permessage-deflate; client_max_window_bits").unwrap();
        assert_eq!(config.client_max_window_bits, 15);
        let config = parse_extensions("permessage-deflate; client_max_window_bits=2").unwrap();
        assert_eq!(config.client_max_window_bits, 8);
        let config = parse_extensions("perframe-deflate").unwrap();
        assert!(config.per_frame);
        assert!(parse_extensions("x-webkit-frame").is_none());
    }

    #[test]
    fn client_verify_rejects_bad_accept() {
        let client =
            ClientHandshake::new("server", "/", Vec::new(), CompressMode::PerMessage);
        let mut response = Response::new(101);
        response.headers.set("Upgrade", "websocket");
        response.headers.set("Sec-WebSocket-Accept", "bogus");
        let err = client.verify(&response).unwrap_err();
        assert!(matches!(err, NetError::HandshakeInvalid(_)));
    }

    #[test]
    fn client_verify_full_round_trip() {
        let client = ClientHandshake::new(
            "server",
            "/socket",
            vec!["chat".into()],
            CompressMode::PerMessage,
        );
        let request = client.request(&Headers::new());
        assert_eq!(request.headers.get("Sec-WebSocket-Version"), Some("13"));
        let server = ServerHandshake::new(vec!["chat".into()], true);
        let (response, _) = server.accept(&request).unwrap();
        let negotiated = client.verify(&response).unwrap();
        assert_eq!(negotiated.subprotocol.as_deref(), Some("chat"));
        assert!(negotiated.deflate.is_some());
    }
}
