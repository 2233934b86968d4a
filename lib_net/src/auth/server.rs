//! Server half of the authentication engine: mint challenges, verify
//! authorization headers against a pluggable credential lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;

use super::{
    constant_time_eq, digest_response, split_scheme, Algorithm, AuthType, DigestParams,
};
use crate::utils::now_unix;

/// Password lookup for Digest verification: `user -> Option<pass>`.
pub type ExtractPassFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
/// External verification for Basic: `(user, pass) -> bool`.
pub type AuthenticateFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Outcome of a verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Authorization verified.
    Good,
    /// Nonce expired or unknown; the client should retry against a fresh
    /// challenge carrying `stale=true`.
    Stale,
    /// Credentials wrong, missing or replayed.
    Fault,
}

struct NonceState {
    issued_at: i64,
    /// Last accepted `nc` per cnonce; the counter must strictly increase.
    counters: HashMap<String, u32>,
}

/// Per-listener server authenticator. Shared across accepted connections.
pub struct AuthServer {
    auth_type: AuthType,
    algorithm: Algorithm,
    realm: Mutex<String>,
    opaque: Mutex<String>,
    nonce_ttl_secs: i64,
    issued: Mutex<HashMap<String, NonceState>>,
    extract_pass: Mutex<Option<ExtractPassFn>>,
    authenticate: Mutex<Option<AuthenticateFn>>,
}

impl AuthServer {
    pub fn new(auth_type: AuthType, algorithm: Algorithm) -> Self {
        Self {
            auth_type,
            algorithm,
            realm: Mutex::new(default_realm()),
            opaque: Mutex::new(new_token()),
            nonce_ttl_secs: 300,
            issued: Mutex::new(HashMap::new()),
            extract_pass: Mutex::new(None),
            authenticate: Mutex::new(None),
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn set_realm(&self, realm: impl Into<String>) {
        let realm = realm.into();
        if !realm.is_empty() {
            *self.realm.lock().expect("auth realm poisoned") = realm;
        }
    }

    pub fn set_opaque(&self, opaque: impl Into<String>) {
        let opaque = opaque.into();
        if !opaque.is_empty() {
            *self.opaque.lock().expect("auth opaque poisoned") = opaque;
        }
    }

    pub fn set_extract_pass(&self, f: ExtractPassFn) {
        *self.extract_pass.lock().expect("auth callback poisoned") = Some(f);
    }

    pub fn set_authenticate(&self, f: AuthenticateFn) {
        *self.authenticate.lock().expect("auth callback poisoned") = Some(f);
    }

    /// Mint the challenge header *value* (for `WWW-Authenticate` or
    /// `Proxy-Authenticate`). Digest challenges register a fresh nonce.
    pub fn challenge(&self, stale: bool) -> String {
        let realm = self.realm.lock().expect("auth realm poisoned").clone();
        match self.auth_type {
            AuthType::Digest => {
                let nonce = self.mint_nonce();
                let opaque = self.opaque.lock().expect("auth opaque poisoned").clone();
                let mut value = format!(
                    "Digest realm=\"{realm}\", qop=\"auth\", nonce=\"{nonce}\", \
                     opaque=\"{opaque}\", algorithm={}",
                    self.algorithm.name()
                );
                if stale {
                    value.push_str(", stale=true");
                }
                value
            }
            _ => format!("Basic realm=\"{realm}\""),
        }
    }

    /// Verify an `Authorization` / `Proxy-Authorization` header value.
    pub fn check(&self, method: &str, header: &str) -> AuthStatus {
        if self.auth_type == AuthType::None {
            return AuthStatus::Good;
        }
        let (scheme, params) = split_scheme(header);
        match (self.auth_type, scheme.as_str()) {
            (AuthType::Basic, "basic") => self.check_basic(params),
            (AuthType::Digest, "digest") => self.check_digest(method, params),
            _ => AuthStatus::Fault,
        }
    }

    fn check_basic(&self, token: &str) -> AuthStatus {
        let decoded = match BASE64.decode(token.trim()) {
            Ok(raw) => match String::from_utf8(raw) {
                Ok(text) => text,
                Err(_) => return AuthStatus::Fault,
            },
            Err(_) => return AuthStatus::Fault,
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return AuthStatus::Fault;
        };
        if let Some(verify) = self.authenticate.lock().expect("auth callback poisoned").clone() {
            return if verify(user, pass) { AuthStatus::Good } else { AuthStatus::Fault };
        }
        if let Some(lookup) = self.extract_pass.lock().expect("auth callback poisoned").clone() {
            return match lookup(user) {
                Some(expected) if constant_time_eq(&expected, pass) => AuthStatus::Good,
                _ => AuthStatus::Fault,
            };
        }
        AuthStatus::Fault
    }

    fn check_digest(&self, method: &str, params: &str) -> AuthStatus {
        let parsed = DigestParams::parse(params);
        if parsed.user.is_empty() || parsed.resp.is_empty() || parsed.nonce.is_empty() {
            return AuthStatus::Fault;
        }
        let realm = self.realm.lock().expect("auth realm poisoned").clone();
        if parsed.realm != realm {
            return AuthStatus::Fault;
        }
        {
            let opaque = self.opaque.lock().expect("auth opaque poisoned").clone();
            if !parsed.opaque.is_empty() && parsed.opaque != opaque {
                return AuthStatus::Fault;
            }
        }

        // nonce bookkeeping: unknown or expired nonces are stale, replayed
        // counters are faults
        {
            let mut issued = self.issued.lock().expect("auth nonces poisoned");
            let Some(state) = issued.get_mut(&parsed.nonce) else {
                return AuthStatus::Stale;
            };
            if now_unix() - state.issued_at > self.nonce_ttl_secs {
                issued.remove(&parsed.nonce);
                return AuthStatus::Stale;
            }
            if !parsed.qop.is_empty() {
                let Ok(nc) = u32::from_str_radix(parsed.nc.trim(), 16) else {
                    return AuthStatus::Fault;
                };
                let last = state.counters.entry(parsed.cnonce.clone()).or_insert(0);
                if nc <= *last {
                    return AuthStatus::Fault;
                }
                *last = nc;
            }
        }

        let Some(lookup) = self.extract_pass.lock().expect("auth callback poisoned").clone()
        else {
            return AuthStatus::Fault;
        };
        let Some(pass) = lookup(&parsed.user) else {
            return AuthStatus::Fault;
        };
        let expected = digest_response(&parsed.user, &pass, method, &parsed);
        if constant_time_eq(&expected, &parsed.resp) {
            AuthStatus::Good
        } else {
            AuthStatus::Fault
        }
    }

    /// Nonce from a CSPRNG with the mint timestamp embedded up front.
    fn mint_nonce(&self) -> String {
        let now = now_unix();
        let mut raw = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut raw);
        let nonce = format!("{now:012x}{}", hex::encode(raw));
        let mut issued = self.issued.lock().expect("auth nonces poisoned");
        issued.retain(|_, state| now - state.issued_at <= self.nonce_ttl_secs);
        issued.insert(
            nonce.clone(),
            NonceState { issued_at: now, counters: HashMap::new() },
        );
        nonce
    }

    #[cfg(test)]
    fn expire_nonce(&self, nonce: &str, by_secs: i64) {
        if let Some(state) = self.issued.lock().unwrap().get_mut(nonce) {
            state.issued_at -= by_secs;
        }
    }
}

fn default_realm() -> String {
    "lib_net".to_string()
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::client::AuthClient;
    use crate::auth::Credentials;

    fn digest_server() -> AuthServer {
        let server = AuthServer::new(AuthType::Digest, Algorithm::Md5);
        server.set_realm("testrealm@host.com");
        server.set_extract_pass(Arc::new(|user| {
            (user == "Mufasa").then(|| "Circle Of Life".to_string())
        }));
        server
    }

    fn respond(challenge: &str, uri: &str) -> String {
        let mut client = AuthClient::new(AuthType::Digest, Algorithm::Md5);
        client.set_credentials(Credentials::new("Mufasa", "Circle Of Life"));
        client.set_header(challenge);
        client.set_uri(uri);
        client.header_value("GET").unwrap()
    }

    #[test]
    fn digest_round_trip() {
        let server = digest_server();
        let challenge = server.challenge(false);
        let authorization = respond(&challenge, "/dir/index.html");
        let (_, params) = split_scheme(&authorization);
        assert_eq!(server.check("GET", &authorization), AuthStatus::Good);
        // a replayed nc is a fault, not a stale retry
        assert_eq!(
            server.check_digest("GET", params),
            AuthStatus::Fault
        );
    }

    #[test]
    fn expired_nonce_is_stale() {
        let server = digest_server();
        let challenge = server.challenge(false);
        let p = DigestParams::parse(&challenge["Digest ".len()..]);
        server.expire_nonce(&p.nonce, 3600);
        let authorization = respond(&challenge, "/");
        assert_eq!(server.check("GET", &authorization), AuthStatus::Stale);
    }

    #[test]
    fn unknown_nonce_is_stale() {
        let server = digest_server();
        let authorization = respond(
            r#"Digest realm="testrealm@host.com", nonce="forged", qop="auth""#,
            "/",
        );
        assert_eq!(server.check("GET", &authorization), AuthStatus::Stale);
    }

    #[test]
    fn wrong_password_is_fault() {
        let server = digest_server();
        let challenge = server.challenge(false);
        let mut client = AuthClient::new(AuthType::Digest, Algorithm::Md5);
        client.set_credentials(Credentials::new("Mufasa", "Hakuna Matata"));
        client.set_header(&challenge);
        client.set_uri("/");
        let authorization = client.header_value("GET").unwrap();
        assert_eq!(server.check("GET", &authorization), AuthStatus::Fault);
    }

    #[test]
    fn basic_check_via_authenticate() {
        let server = AuthServer::new(AuthType::Basic, Algorithm::Md5);
        server.set_authenticate(Arc::new(|user, pass| user == "u" && pass == "p"));
        assert_eq!(server.check("GET", "Basic dTpw"), AuthStatus::Good);
        assert_eq!(server.check("GET", "basic dTpw"), AuthStatus::Good);
        assert_eq!(server.check("GET", "Basic dTpx"), AuthStatus::Fault);
    }

    #[test]
    fn stale_challenge_carries_flag() {
        let server = digest_server();
        assert!(server.challenge(true).contains("stale=true"));
        assert!(!server.challenge(false).contains("stale"));
    }
}
