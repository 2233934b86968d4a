//! Client half of the authentication engine: parse a server challenge,
//! compute the matching `Authorization` / `Proxy-Authorization` value.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;

use super::{digest_response, split_scheme, Algorithm, AuthType, Credentials, DigestParams};

/// Per-connection client authenticator.
#[derive(Debug, Clone, Default)]
pub struct AuthClient {
    auth_type: AuthType,
    algorithm: Algorithm,
    credentials: Option<Credentials>,
    uri: String,
    digest: DigestParams,
    nc: u32,
}

impl AuthClient {
    pub fn new(auth_type: AuthType, algorithm: Algorithm) -> Self {
        Self { auth_type, algorithm, ..Self::default() }
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn set_type(&mut self, auth_type: AuthType, algorithm: Algorithm) {
        self.auth_type = auth_type;
        self.algorithm = algorithm;
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Request-target used for the Digest `uri=` parameter.
    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    /// Ingest a `WWW-Authenticate` / `Proxy-Authenticate` header value.
    ///
    /// A fresh or stale challenge restarts the `(cnonce, nc)` pair; Basic
    /// challenges only update the realm.
    pub fn set_header(&mut self, header: &str) {
        let (scheme, params) = split_scheme(header);
        match scheme.as_str() {
            "digest" => {
                let mut parsed = DigestParams::parse(params);
                if parsed.qop.is_empty() {
                    parsed.qop = "auth".into();
                }
                self.auth_type = AuthType::Digest;
                self.algorithm = parsed.algorithm;
                self.digest = parsed;
                self.nc = 0;
                self.digest.cnonce = new_cnonce();
            }
            "basic" => {
                self.auth_type = AuthType::Basic;
                self.digest.realm = DigestParams::parse(params).realm;
            }
            _ => {}
        }
    }

    /// True once a Digest challenge has been ingested.
    pub fn has_challenge(&self) -> bool {
        !self.digest.nonce.is_empty()
    }

    /// Whether the last challenge was flagged `stale=true` (retry allowed
    /// without counting as an auth failure).
    pub fn is_stale(&self) -> bool {
        self.digest.stale
    }

    /// Build the authorization header *value* for `method`, or `None` when
    /// nothing can be produced yet (no credentials, or Digest without a
    /// challenge).
    pub fn header_value(&mut self, method: &str) -> Option<String> {
        let creds = self.credentials.clone()?;
        match self.auth_type {
            AuthType::None => None,
            AuthType::Basic => {
                let token = BASE64.encode(format!("{}:{}", creds.user, creds.pass));
                Some(format!("Basic {token}"))
            }
            AuthType::Digest => {
                if self.digest.nonce.is_empty() {
                    return None;
                }
                self.nc += 1;
                let mut p = self.digest.clone();
                p.algorithm = self.algorithm;
                p.nc = format!("{:08x}", self.nc);
                p.uri = self.uri.clone();
                let response = digest_response(&creds.user, &creds.pass, method, &p);
                let mut value = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     algorithm={}, response=\"{}\"",
                    creds.user,
                    p.realm,
                    p.nonce,
                    p.uri,
                    p.algorithm.name(),
                    response
                );
                if !p.qop.is_empty() {
                    value.push_str(&format!(
                        ", qop={}, nc={}, cnonce=\"{}\"",
                        p.qop, p.nc, p.cnonce
                    ));
                }
                if !p.opaque.is_empty() {
                    value.push_str(&format!(", opaque=\"{}\"", p.opaque));
                }
                Some(value)
            }
        }
    }
}

fn new_cnonce() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_is_base64() {
        let mut auth = AuthClient::new(AuthType::Basic, Algorithm::Md5);
        auth.set_credentials(Credentials::new("u", "p"));
        assert_eq!(auth.header_value("GET").as_deref(), Some("Basic dTpw"));
    }

    #[test]
    fn digest_needs_challenge_first() {
        let mut auth = AuthClient::new(AuthType::Digest, Algorithm::Md5);
        auth.set_credentials(Credentials::new("u", "p"));
        assert!(auth.header_value("GET").is_none());
        auth.set_header(r#"Digest realm="R", nonce="abc", qop="auth", opaque="xyz""#);
        auth.set_uri("/index.html");
        let value = auth.header_value("GET").unwrap();
        assert!(value.starts_with("Digest username=\"u\""));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("opaque=\"xyz\""));
    }

    #[test]
    fn nc_increments_per_request() {
        let mut auth = AuthClient::new(AuthType::Digest, Algorithm::Md5);
        auth.set_credentials(Credentials::new("u", "p"));
        auth.set_header(r#"Digest realm="R", nonce="abc", qop=auth"#);
        auth.set_uri("/");
        let first = auth.header_value("GET").unwrap();
        let second = auth.header_value("GET").unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn stale_challenge_resets_counter() {
        let mut auth = AuthClient::new(AuthType::Digest, Algorithm::Md5);
        auth.set_credentials(Credentials::new("u", "p"));
        auth.set_header(r#"Digest realm="R", nonce="n1", qop=auth"#);
        auth.set_uri("/");
        let _ = auth.header_value("GET");
        let _ = auth.header_value("GET");
        auth.set_header(r#"Digest realm="R", nonce="n2", qop=auth, stale=true"#);
        assert!(auth.is_stale());
        let retry = auth.header_value("GET").unwrap();
        assert!(retry.contains("nc=00000001"));
        assert!(retry.contains("nonce=\"n2\""));
    }

    #[test]
    fn known_md5_vector_through_client() {
        let mut auth = AuthClient::new(AuthType::Digest, Algorithm::Md5);
        auth.set_credentials(Credentials::new("Mufasa", "Circle Of Life"));
        auth.set_header(
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", qop="auth""#,
        );
        auth.set_uri("/dir/index.html");
        // pin the cnonce to the reference value
        auth.digest.cnonce = "0a4f113b".into();
        let value = auth.header_value("GET").unwrap();
        assert!(value.contains("response=\"6629fae49393a05397450978507c4ef1\""));
    }
}
