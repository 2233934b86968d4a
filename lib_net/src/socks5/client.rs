//! Client side of the SOCKS5 negotiation.
//!
//! Greeting, optional username/password sub-negotiation, CONNECT request.
//! The machine is fed from the broker's read buffer and hands back the next
//! bytes to put on the wire.

use super::{
    cmd, decode_addr, encode_addr, method, Reply, TargetAddr, AUTH_VERSION, VERSION,
};
use crate::auth::Credentials;
use crate::errors::{NetError, Result};

/// Progress report from [`Socks5Client::feed`].
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// More bytes are needed.
    Pending,
    /// Put these bytes on the wire and keep feeding.
    Send(Vec<u8>),
    /// The tunnel is established.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeting,
    AwaitMethod,
    AwaitAuth,
    AwaitReply,
    Done,
    Failed,
}

/// Three-phase SOCKS5 client machine.
#[derive(Debug)]
pub struct Socks5Client {
    state: State,
    target: TargetAddr,
    credentials: Option<Credentials>,
    buf: Vec<u8>,
}

impl Socks5Client {
    pub fn new(target: TargetAddr, credentials: Option<Credentials>) -> Self {
        Self { state: State::Greeting, target, credentials, buf: Vec::new() }
    }

    /// First bytes on the wire: `05 NMETHODS METHODS…`.
    pub fn greeting(&mut self) -> Vec<u8> {
        self.state = State::AwaitMethod;
        match &self.credentials {
            Some(_) => vec![VERSION, 2, method::NO_AUTH, method::USERPASS],
            None => vec![VERSION, 1, method::NO_AUTH],
        }
    }

    /// Negotiation finished successfully.
    pub fn is_handshake(&self) -> bool {
        self.state == State::Done
    }

    /// Negotiation reached a terminal state (success or failure).
    pub fn is_end(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Bytes that arrived after the final reply belong to the application.
    pub fn take_residue(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Feed proxy bytes; returns what to do next.
    pub fn feed(&mut self, data: &[u8]) -> Result<Step> {
        self.buf.extend_from_slice(data);
        loop {
            match self.state {
                State::Greeting => {
                    return Err(NetError::Protocol(
                        "greeting not sent before feeding".into(),
                    ))
                }
                State::AwaitMethod => {
                    if self.buf.len() < 2 {
                        return Ok(Step::Pending);
                    }
                    let (version, selected) = (self.buf[0], self.buf[1]);
                    self.buf.drain(..2);
                    if version != VERSION {
                        self.state = State::Failed;
                        return Err(NetError::HandshakeInvalid(format!(
                            "SOCKS version {version}, expected 5"
                        )));
                    }
                    match selected {
                        method::NO_AUTH => {
                            self.state = State::AwaitReply;
                            return Ok(Step::Send(self.request()));
                        }
                        method::USERPASS => {
                            let Some(creds) = self.credentials.clone() else {
                                self.state = State::Failed;
                                return Err(NetError::Proxy(
                                    "proxy demands credentials, none configured".into(),
                                ));
                            };
                            self.state = State::AwaitAuth;
                            return Ok(Step::Send(encode_userpass(&creds)));
                        }
                        method::NO_ACCEPTABLE => {
                            self.state = State::Failed;
                            return Err(NetError::Proxy(
                                "proxy rejected every offered method".into(),
                            ));
                        }
                        other => {
                            self.state = State::Failed;
                            return Err(NetError::Proxy(format!(
                                "proxy selected unsupported method 0x{other:02x}"
                            )));
                        }
                    }
                }
                State::AwaitAuth => {
                    if self.buf.len() < 2 {
                        return Ok(Step::Pending);
                    }
                    let (version, status) = (self.buf[0], self.buf[1]);
                    self.buf.drain(..2);
                    if version != AUTH_VERSION {
                        self.state = State::Failed;
                        return Err(NetError::HandshakeInvalid(format!(
                            "userpass version {version}, expected 1"
                        )));
                    }
                    if status != 0 {
                        self.state = State::Failed;
                        return Err(NetError::Proxy("proxy rejected the credentials".into()));
                    }
                    self.state = State::AwaitReply;
                    return Ok(Step::Send(self.request()));
                }
                State::AwaitReply => {
                    if self.buf.len() < 4 {
                        return Ok(Step::Pending);
                    }
                    if self.buf[0] != VERSION {
                        self.state = State::Failed;
                        return Err(NetError::HandshakeInvalid(format!(
                            "SOCKS version {} in reply, expected 5",
                            self.buf[0]
                        )));
                    }
                    let Some((_bind, used)) = decode_addr(&self.buf[3..])? else {
                        return Ok(Step::Pending);
                    };
                    let rep = self.buf[1];
                    self.buf.drain(..3 + used);
                    if rep != Reply::Succeeded as u8 {
                        self.state = State::Failed;
                        let message = Reply::from_u8(rep)
                            .map(Reply::message)
                            .unwrap_or("unknown reply code");
                        return Err(NetError::Proxy(format!(
                            "CONNECT refused: {message} (0x{rep:02x})"
                        )));
                    }
                    self.state = State::Done;
                    return Ok(Step::Done);
                }
                State::Done | State::Failed => return Ok(Step::Done),
            }
        }
    }

    /// `05 CMD 00 ATYP ADDR PORT` for the configured target.
    fn request(&self) -> Vec<u8> {
        let mut out = vec![VERSION, cmd::CONNECT, 0x00];
        encode_addr(&self.target, &mut out);
        out
    }
}

fn encode_userpass(creds: &Credentials) -> Vec<u8> {
    let user = creds.user.as_bytes();
    let pass = creds.pass.as_bytes();
    let mut out = Vec::with_capacity(3 + user.len() + pass.len());
    out.push(AUTH_VERSION);
    out.push(user.len().min(u8::MAX as usize) as u8);
    out.extend_from_slice(&user[..user.len().min(u8::MAX as usize)]);
    out.push(pass.len().min(u8::MAX as usize) as u8);
    out.extend_from_slice(&pass[..pass.len().min(u8::MAX as usize)]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetAddr {
        TargetAddr::Ip("192.168.1.1:80".parse().unwrap())
    }

    #[test]
    fn no_auth_connect_trace() {
        let mut sm = Socks5Client::new(target(), None);
        assert_eq!(sm.greeting(), [0x05, 0x01, 0x00]);
        // server picks no-auth
        let Step::Send(request) = sm.feed(&[0x05, 0x00]).unwrap() else {
            panic!("expected the CONNECT request");
        };
        assert_eq!(
            request,
            [0x05, 0x01, 0x00, 0x01, 0xC0, 0xA8, 0x01, 0x01, 0x00, 0x50]
        );
        // success reply with a zero bind address
        let step = sm
            .feed(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(step, Step::Done);
        assert!(sm.is_handshake());
    }

    #[test]
    fn userpass_sub_negotiation() {
        let mut sm = Socks5Client::new(target(), Some(Credentials::new("user", "pass")));
        assert_eq!(sm.greeting(), [0x05, 0x02, 0x00, 0x02]);
        let Step::Send(auth) = sm.feed(&[0x05, 0x02]).unwrap() else {
            panic!("expected the auth message");
        };
        assert_eq!(auth[0], 0x01);
        assert_eq!(auth[1], 4);
        assert_eq!(&auth[2..6], b"user");
        assert_eq!(auth[6], 4);
        assert_eq!(&auth[7..], b"pass");
        let Step::Send(_request) = sm.feed(&[0x01, 0x00]).unwrap() else {
            panic!("expected the CONNECT request");
        };
    }

    #[test]
    fn refusal_reply_is_proxy_error() {
        let mut sm = Socks5Client::new(target(), None);
        let _ = sm.greeting();
        let _ = sm.feed(&[0x05, 0x00]).unwrap();
        let err = sm
            .feed(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap_err();
        assert!(matches!(err, NetError::Proxy(_)));
        assert!(sm.is_end());
        assert!(!sm.is_handshake());
    }

    #[test]
    fn wrong_version_is_fatal() {
        let mut sm = Socks5Client::new(target(), None);
        let _ = sm.greeting();
        let err = sm.feed(&[0x04, 0x00]).unwrap_err();
        assert!(matches!(err, NetError::HandshakeInvalid(_)));
    }

    #[test]
    fn fragmented_reply_is_reassembled() {
        let mut sm = Socks5Client::new(target(), None);
        let _ = sm.greeting();
        let _ = sm.feed(&[0x05, 0x00]).unwrap();
        assert_eq!(sm.feed(&[0x05, 0x00, 0x00]).unwrap(), Step::Pending);
        assert_eq!(sm.feed(&[0x01, 0, 0, 0]).unwrap(), Step::Pending);
        assert_eq!(sm.feed(&[0, 0, 0]).unwrap(), Step::Done);
    }

    #[test]
    fn residue_after_success_is_preserved() {
        let mut sm = Socks5Client::new(target(), None);
        let _ = sm.greeting();
        let _ = sm.feed(&[0x05, 0x00]).unwrap();
        let mut reply = vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        reply.extend_from_slice(b"early app bytes");
        assert_eq!(sm.feed(&reply).unwrap(), Step::Done);
        assert_eq!(sm.take_residue(), b"early app bytes");
    }

    #[test]
    fn credentials_demanded_but_missing() {
        let mut sm = Socks5Client::new(target(), None);
        let _ = sm.greeting();
        let err = sm.feed(&[0x05, 0x02]).unwrap_err();
        assert!(matches!(err, NetError::Proxy(_)));
    }
}
