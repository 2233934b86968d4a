//! Server side of the SOCKS5 negotiation.
//!
//! The machine carries the three phases up to the point where the proxy
//! engine must dial the upstream; the engine then calls [`Socks5Server::complete`]
//! with the outcome to build the final reply.

use super::{cmd, decode_addr, method, encode_reply, Reply, TargetAddr, AUTH_VERSION, VERSION};
use crate::errors::{NetError, Result};

/// Credential check injected by the owning listener.
pub type VerifyFn = Box<dyn Fn(&str, &str) -> bool + Send>;

/// Progress report from [`Socks5Server::feed`].
pub enum Event {
    /// More bytes are needed.
    Pending,
    /// Put these bytes on the wire and keep feeding.
    Send(Vec<u8>),
    /// Put these bytes on the wire, then close: the client was rejected.
    Reject(Vec<u8>),
    /// Dial this target, then call [`Socks5Server::complete`].
    Connect(TargetAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitGreeting,
    AwaitAuth,
    AwaitRequest,
    AwaitUpstream,
    Done,
    Failed,
}

/// Three-phase SOCKS5 server machine.
pub struct Socks5Server {
    state: State,
    verify: Option<VerifyFn>,
    buf: Vec<u8>,
    authenticated_user: Option<String>,
}

impl Socks5Server {
    /// A `verify` callback makes username/password mandatory: clients that
    /// do not offer method `0x02` are rejected with `0xFF`.
    pub fn new(verify: Option<VerifyFn>) -> Self {
        Self {
            state: State::AwaitGreeting,
            verify,
            buf: Vec::new(),
            authenticated_user: None,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.state == State::Done
    }

    pub fn is_end(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// User accepted during the sub-negotiation, if any.
    pub fn user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    /// Bytes that arrived after the request belong to the tunnel.
    pub fn take_residue(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Feed client bytes; returns what to do next.
    pub fn feed(&mut self, data: &[u8]) -> Result<Event> {
        self.buf.extend_from_slice(data);
        match self.state {
            State::AwaitGreeting => self.greeting(),
            State::AwaitAuth => self.auth(),
            State::AwaitRequest => self.request(),
            State::AwaitUpstream => Ok(Event::Pending),
            State::Done | State::Failed => Ok(Event::Pending),
        }
    }

    /// Finish the request phase once the engine has dialed the upstream.
    /// Produces the wire reply and moves to the terminal state.
    pub fn complete(&mut self, rep: Reply, bind: Option<std::net::SocketAddr>) -> Vec<u8> {
        self.state = if rep == Reply::Succeeded { State::Done } else { State::Failed };
        encode_reply(rep, bind)
    }

    fn greeting(&mut self) -> Result<Event> {
        if self.buf.len() < 2 {
            return Ok(Event::Pending);
        }
        let version = self.buf[0];
        if version != VERSION {
            self.state = State::Failed;
            return Err(NetError::HandshakeInvalid(format!(
                "SOCKS version {version}, expected 5"
            )));
        }
        let nmethods = self.buf[1] as usize;
        if self.buf.len() < 2 + nmethods {
            return Ok(Event::Pending);
        }
        let methods: Vec<u8> = self.buf[2..2 + nmethods].to_vec();
        self.buf.drain(..2 + nmethods);
        if self.verify.is_some() {
            if methods.contains(&method::USERPASS) {
                self.state = State::AwaitAuth;
                Ok(Event::Send(vec![VERSION, method::USERPASS]))
            } else {
                self.state = State::Failed;
                Ok(Event::Reject(vec![VERSION, method::NO_ACCEPTABLE]))
            }
        } else if methods.contains(&method::NO_AUTH) {
            self.state = State::AwaitRequest;
            Ok(Event::Send(vec![VERSION, method::NO_AUTH]))
        } else {
            self.state = State::Failed;
            Ok(Event::Reject(vec![VERSION, method::NO_ACCEPTABLE]))
        }
    }

    fn auth(&mut self) -> Result<Event> {
        if self.buf.len() < 2 {
            return Ok(Event::Pending);
        }
        let version = self.buf[0];
        if version != AUTH_VERSION {
            self.state = State::Failed;
            return Err(NetError::HandshakeInvalid(format!(
                "userpass version {version}, expected 1"
            )));
        }
        let ulen = self.buf[1] as usize;
        if self.buf.len() < 2 + ulen + 1 {
            return Ok(Event::Pending);
        }
        let plen = self.buf[2 + ulen] as usize;
        if self.buf.len() < 3 + ulen + plen {
            return Ok(Event::Pending);
        }
        let user = String::from_utf8_lossy(&self.buf[2..2 + ulen]).into_owned();
        let pass = String::from_utf8_lossy(&self.buf[3 + ulen..3 + ulen + plen]).into_owned();
        self.buf.drain(..3 + ulen + plen);
        let verify = self.verify.as_ref().expect("auth phase without verifier");
        if verify(&user, &pass) {
            self.authenticated_user = Some(user);
            self.state = State::AwaitRequest;
            Ok(Event::Send(vec![AUTH_VERSION, 0x00]))
        } else {
            log::warn!("SOCKS5 credentials rejected for user {user:?}");
            self.state = State::Failed;
            Ok(Event::Reject(vec![AUTH_VERSION, 0x01]))
        }
    }

    fn request(&mut self) -> Result<Event> {
        if self.buf.len() < 4 {
            return Ok(Event::Pending);
        }
        if self.buf[0] != VERSION {
            self.state = State::Failed;
            return Err(NetError::HandshakeInvalid(format!(
                "SOCKS version {} in request, expected 5",
                self.buf[0]
            )));
        }
        let command = self.buf[1];
        // an unsupported ATYP earns the 0x08 reply, not a dropped socket
        let decoded = match decode_addr(&self.buf[3..]) {
            Ok(decoded) => decoded,
            Err(NetError::Protocol(_)) => {
                self.state = State::Failed;
                return Ok(Event::Reject(encode_reply(
                    Reply::AddressTypeNotSupported,
                    None,
                )));
            }
            Err(err) => return Err(err),
        };
        let Some((target, used)) = decoded else {
            return Ok(Event::Pending);
        };
        self.buf.drain(..3 + used);
        if command != cmd::CONNECT {
            self.state = State::Failed;
            return Ok(Event::Reject(encode_reply(Reply::CommandNotSupported, None)));
        }
        self.state = State::AwaitUpstream;
        Ok(Event::Connect(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_ipv4() -> Vec<u8> {
        vec![0x05, 0x01, 0x00, 0x01, 0xC0, 0xA8, 0x01, 0x01, 0x00, 0x50]
    }

    #[test]
    fn open_proxy_full_trace() {
        let mut sm = Socks5Server::new(None);
        let Event::Send(selected) = sm.feed(&[0x05, 0x01, 0x00]).unwrap() else {
            panic!("expected method selection");
        };
        assert_eq!(selected, [0x05, 0x00]);
        let Event::Connect(target) = sm.feed(&connect_ipv4()).unwrap() else {
            panic!("expected connect");
        };
        assert_eq!(target, TargetAddr::Ip("192.168.1.1:80".parse().unwrap()));
        let reply = sm.complete(Reply::Succeeded, None);
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(sm.is_handshake());
    }

    #[test]
    fn auth_required_but_not_offered() {
        let mut sm = Socks5Server::new(Some(Box::new(|_, _| true)));
        let Event::Reject(reply) = sm.feed(&[0x05, 0x01, 0x00]).unwrap() else {
            panic!("expected reject");
        };
        assert_eq!(reply, [0x05, 0xFF]);
        assert!(sm.is_end());
    }

    #[test]
    fn userpass_accept_and_reject() {
        let verify: VerifyFn = Box::new(|u, p| u == "alice" && p == "secret");
        let mut sm = Socks5Server::new(Some(verify));
        let Event::Send(selected) = sm.feed(&[0x05, 0x02, 0x00, 0x02]).unwrap() else {
            panic!("expected method selection");
        };
        assert_eq!(selected, [0x05, 0x02]);
        // 01 ULEN USER PLEN PASS
        let mut auth = vec![0x01, 5];
        auth.extend_from_slice(b"alice");
        auth.push(6);
        auth.extend_from_slice(b"secret");
        let Event::Send(status) = sm.feed(&auth).unwrap() else {
            panic!("expected auth status");
        };
        assert_eq!(status, [0x01, 0x00]);
        assert_eq!(sm.user(), Some("alice"));

        let mut sm = Socks5Server::new(Some(Box::new(|_, _| false)));
        let _ = sm.feed(&[0x05, 0x01, 0x02]).unwrap();
        let mut auth = vec![0x01, 3];
        auth.extend_from_slice(b"bob");
        auth.push(3);
        auth.extend_from_slice(b"pwd");
        let Event::Reject(status) = sm.feed(&auth).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(status, [0x01, 0x01]);
    }

    #[test]
    fn non_connect_command_rejected() {
        let mut sm = Socks5Server::new(None);
        let _ = sm.feed(&[0x05, 0x01, 0x00]).unwrap();
        // BIND request
        let req = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
        let Event::Reject(reply) = sm.feed(&req).unwrap() else {
            panic!("expected reject");
        };
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
    }

    #[test]
    fn unsupported_atyp_rejected() {
        let mut sm = Socks5Server::new(None);
        let _ = sm.feed(&[0x05, 0x01, 0x00]).unwrap();
        let Event::Reject(reply) = sm.feed(&[0x05, 0x01, 0x00, 0x05, 0, 0]).unwrap() else {
            panic!("expected reject");
        };
        assert_eq!(reply[1], Reply::AddressTypeNotSupported as u8);
        assert!(sm.is_end());
    }

    #[test]
    fn domain_request_resolves_later() {
        let mut sm = Socks5Server::new(None);
        let _ = sm.feed(&[0x05, 0x01, 0x00]).unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        let Event::Connect(target) = sm.feed(&req).unwrap() else {
            panic!("expected connect");
        };
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 443));
    }

    #[test]
    fn failed_dial_maps_to_reply() {
        let mut sm = Socks5Server::new(None);
        let _ = sm.feed(&[0x05, 0x01, 0x00]).unwrap();
        let _ = sm.feed(&connect_ipv4()).unwrap();
        let reply = sm.complete(Reply::ConnectionRefused, None);
        assert_eq!(reply[1], 0x05);
        assert!(sm.is_end());
        assert!(!sm.is_handshake());
    }
}
