//! # HTTP Authentication Engine
//!
//! Basic and Digest authentication, usable from both sides of the wire:
//! - **issuer**: servers (and proxies) build `WWW-Authenticate` /
//!   `Proxy-Authenticate` challenges and verify `Authorization` /
//!   `Proxy-Authorization` responses ([`server::AuthServer`]);
//! - **responder**: clients parse challenges and compute the matching
//!   response header ([`client::AuthClient`]).
//!
//! Digest follows RFC 7616: `MD5`, `SHA-1`, `SHA-256`, `SHA-512` and their
//! `-sess` variants, `qop=auth`, hex `nc` counters, `stale` challenge
//! refresh. Responses are compared in constant time.

#![forbid(unsafe_code)]

pub mod client;
pub mod server;

use md5::Digest as _;

/// Authorization scheme negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Digest,
}

/// User credentials attached to a scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self { user: user.into(), pass: pass.into() }
    }
}

/// Digest hash algorithm, including the `-sess` session variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha1,
    Sha1Sess,
    Sha256,
    Sha256Sess,
    Sha512,
    Sha512Sess,
}

impl Algorithm {
    /// Parse the `algorithm=` token, case-insensitively.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-1" => Some(Self::Sha1),
            "SHA-1-SESS" => Some(Self::Sha1Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            "SHA-512" => Some(Self::Sha512),
            "SHA-512-SESS" => Some(Self::Sha512Sess),
            _ => None,
        }
    }

    /// Wire name of the algorithm.
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha1 => "SHA-1",
            Self::Sha1Sess => "SHA-1-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
            Self::Sha512 => "SHA-512",
            Self::Sha512Sess => "SHA-512-sess",
        }
    }

    pub fn is_sess(self) -> bool {
        matches!(
            self,
            Self::Md5Sess | Self::Sha1Sess | Self::Sha256Sess | Self::Sha512Sess
        )
    }

    /// Lowercase hex digest of `input` under this algorithm.
    pub fn hash(self, input: &str) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex::encode(md5::Md5::digest(input.as_bytes())),
            Self::Sha1 | Self::Sha1Sess => hex::encode(sha1::Sha1::digest(input.as_bytes())),
            Self::Sha256 | Self::Sha256Sess => {
                hex::encode(sha2::Sha256::digest(input.as_bytes()))
            }
            Self::Sha512 | Self::Sha512Sess => {
                hex::encode(sha2::Sha512::digest(input.as_bytes()))
            }
        }
    }
}

/// Parameters of one Digest exchange, parsed from or rendered into the
/// comma-separated `k="v"` header form.
#[derive(Debug, Clone, Default)]
pub struct DigestParams {
    pub algorithm: Algorithm,
    /// Unix seconds when the server minted `nonce`.
    pub stamp: i64,
    /// Hex request counter, strictly increasing per `(nonce, cnonce)`.
    pub nc: String,
    pub uri: String,
    pub qop: String,
    /// The computed `response=` value.
    pub resp: String,
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
    pub cnonce: String,
    pub stale: bool,
    pub user: String,
}

impl DigestParams {
    /// Parse a challenge or authorization parameter list (everything after
    /// the `Digest ` scheme token). Unknown keys are ignored.
    pub fn parse(params: &str) -> Self {
        let mut out = Self::default();
        for (key, value) in parse_kv_list(params) {
            match key.to_ascii_lowercase().as_str() {
                "algorithm" => {
                    if let Some(alg) = Algorithm::parse(&value) {
                        out.algorithm = alg;
                    }
                }
                "realm" => out.realm = value,
                "nonce" => out.nonce = value,
                "opaque" => out.opaque = value,
                "qop" => {
                    // the challenge may list several; pick plain auth
                    out.qop = value
                        .split(',')
                        .map(str::trim)
                        .find(|q| *q == "auth")
                        .unwrap_or_else(|| value.trim())
                        .to_string();
                }
                "nc" => out.nc = value,
                "cnonce" => out.cnonce = value,
                "uri" => out.uri = value,
                "response" => out.resp = value,
                "username" => out.user = value,
                "stale" => out.stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        out
    }
}

/// Split an auth header value into its scheme token and parameter tail.
/// The scheme comparison downstream is case-insensitive.
pub fn split_scheme(header: &str) -> (String, &str) {
    let trimmed = header.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest.trim_start()),
        None => (trimmed.to_ascii_lowercase(), ""),
    }
}

/// Parse a comma-separated `k="v"` list; quotes are optional for tokens.
pub fn parse_kv_list(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        // skip separators
        while i < bytes.len() && (bytes[i] == b',' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        let key = input[key_start..i].trim();
        if key.is_empty() {
            // malformed leading '=' or stray separator, step over it
            i += 1;
            continue;
        }
        if i >= bytes.len() || bytes[i] == b',' {
            // bare flag without a value
            out.push((key.to_string(), String::new()));
            continue;
        }
        i += 1; // consume '='
        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let v = &input[start..i];
            i += 1; // consume closing quote
            v.to_string()
        } else {
            let start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            input[start..i].trim().to_string()
        };
        out.push((key.to_string(), value));
    }
    out
}

/// Compute the Digest `response` value for the given credentials, request
/// method and exchange parameters.
pub fn digest_response(user: &str, pass: &str, method: &str, p: &DigestParams) -> String {
    let alg = p.algorithm;
    let mut ha1 = alg.hash(&format!("{user}:{}:{pass}", p.realm));
    if alg.is_sess() {
        ha1 = alg.hash(&format!("{ha1}:{}:{}", p.nonce, p.cnonce));
    }
    let ha2 = alg.hash(&format!("{}:{}", method.to_ascii_uppercase(), p.uri));
    if p.qop.is_empty() {
        alg.hash(&format!("{ha1}:{}:{ha2}", p.nonce))
    } else {
        alg.hash(&format!(
            "{ha1}:{}:{}:{}:{}:{ha2}",
            p.nonce, p.nc, p.cnonce, p.qop
        ))
    }
}

/// Timing-safe equality for hex digests.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_md5_fixture() {
        // RFC 2617 reference exchange
        let p = DigestParams {
            algorithm: Algorithm::Md5,
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            nc: "00000001".into(),
            cnonce: "0a4f113b".into(),
            qop: "auth".into(),
            uri: "/dir/index.html".into(),
            ..Default::default()
        };
        let resp = digest_response("Mufasa", "Circle Of Life", "GET", &p);
        assert_eq!(resp, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn response_is_deterministic() {
        let p = DigestParams {
            algorithm: Algorithm::Sha256,
            realm: "r".into(),
            nonce: "n".into(),
            nc: "00000001".into(),
            cnonce: "c".into(),
            qop: "auth".into(),
            uri: "/".into(),
            ..Default::default()
        };
        let a = digest_response("u", "p", "GET", &p);
        let b = digest_response("u", "p", "get", &p);
        assert_eq!(a, b);
        assert_ne!(a, digest_response("u", "p", "POST", &p));
    }

    #[test]
    fn algorithm_tokens_round_trip() {
        for alg in [
            Algorithm::Md5,
            Algorithm::Md5Sess,
            Algorithm::Sha1,
            Algorithm::Sha1Sess,
            Algorithm::Sha256,
            Algorithm::Sha256Sess,
            Algorithm::Sha512,
            Algorithm::Sha512Sess,
        ] {
            assert_eq!(Algorithm::parse(alg.name()), Some(alg));
        }
        assert_eq!(Algorithm::parse("md5-SESS"), Some(Algorithm::Md5Sess));
        assert_eq!(Algorithm::parse("SHA-384"), None);
    }

    #[test]
    fn kv_list_survives_malformed_input() {
        assert!(parse_kv_list("").is_empty());
        assert!(parse_kv_list("=,=,=").is_empty());
        let parsed = parse_kv_list("=x, realm=\"R\"");
        assert!(parsed.iter().any(|(k, v)| k == "realm" && v == "R"));
    }

    #[test]
    fn kv_list_quotes_optional() {
        let parsed = parse_kv_list(
            r#"realm="test@host", nonce=abc123, qop="auth,auth-int", stale=true"#,
        );
        let get = |k: &str| {
            parsed
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };
        assert_eq!(get("realm"), "test@host");
        assert_eq!(get("nonce"), "abc123");
        assert_eq!(get("qop"), "auth,auth-int");
        assert_eq!(get("stale"), "true");
    }

    #[test]
    fn challenge_parse_picks_auth_qop() {
        let p = DigestParams::parse(
            r#"realm="R", nonce="N", opaque="O", qop="auth-int, auth", algorithm=SHA-256, stale=TRUE"#,
        );
        assert_eq!(p.realm, "R");
        assert_eq!(p.qop, "auth");
        assert_eq!(p.algorithm, Algorithm::Sha256);
        assert!(p.stale);
    }

    #[test]
    fn scheme_split_ignores_case() {
        let (scheme, rest) = split_scheme("BASIC dTpw");
        assert_eq!(scheme, "basic");
        assert_eq!(rest, "dTpw");
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
