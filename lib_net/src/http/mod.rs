//! HTTP/1.1 message codec and the CONNECT tunnel state machine.

pub mod codec;
pub mod connect;

pub use codec::{Headers, HttpCodec, Message, Request, Response};
