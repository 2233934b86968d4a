//! WebSocket handshake validation and frame codec.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, Opcode, WsMessage};
pub use handshake::{accept_of, generate_key, ClientHandshake, Negotiated, ServerHandshake};

/// Payload compression requested for a WebSocket scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    #[default]
    None,
    /// `permessage-deflate`
    PerMessage,
    /// `perframe-deflate` (legacy peers)
    PerFrame,
}
