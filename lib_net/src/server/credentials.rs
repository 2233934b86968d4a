//! Server-side user table backing Basic/Digest verification and the SOCKS5
//! username/password sub-negotiation.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::auth::constant_time_eq;

/// Mutable user/password table, shared across accepted connections.
/// Mutations land between loop turns (builder-style setup, admin updates).
#[derive(Default)]
pub struct CredentialStore {
    users: Mutex<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user: impl Into<String>, pass: impl Into<String>) {
        self.users
            .lock()
            .expect("credential store poisoned")
            .insert(user.into(), pass.into());
    }

    pub fn remove(&self, user: &str) {
        self.users.lock().expect("credential store poisoned").remove(user);
    }

    /// Password lookup (Digest needs the clear text to recompute HA1).
    pub fn extract_pass(&self, user: &str) -> Option<String> {
        self.users
            .lock()
            .expect("credential store poisoned")
            .get(user)
            .cloned()
    }

    /// Constant-time verification for Basic and SOCKS5.
    pub fn verify(&self, user: &str, pass: &str) -> bool {
        match self.extract_pass(user) {
            Some(expected) => constant_time_eq(&expected, pass),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().expect("credential store poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.lock().expect("credential store poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_and_extract() {
        let store = CredentialStore::new();
        assert!(store.is_empty());
        store.add("alice", "secret");
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify("alice", "Secret"));
        assert!(!store.verify("bob", "secret"));
        assert_eq!(store.extract_pass("alice").as_deref(), Some("secret"));
        store.remove("alice");
        assert!(!store.verify("alice", "secret"));
    }
}
