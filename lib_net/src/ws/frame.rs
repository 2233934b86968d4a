//! WebSocket frame codec: masking, 16/64-bit extended lengths, control
//! frames, fragmentation reassembly and the negotiated per-message DEFLATE
//! transform.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use rand::RngCore;

use crate::errors::{NetError, Result};

/// Frame opcodes. Reserved opcodes are framing violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1: payload compressed under the negotiated deflate extension.
    pub rsv1: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { fin: true, rsv1: false, opcode, payload }
    }

    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload)
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Serialize; client-to-server frames are masked with 4 random bytes.
    pub fn encode(&self, mask: bool) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);
        let mut b0 = (self.opcode as u8) & 0x0F;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        out.push(b0);
        let mask_bit = if mask { 0x80 } else { 0x00 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        if mask {
            let mut key = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut key);
            out.extend_from_slice(&key);
            out.extend(self.payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        } else {
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Decode one frame from the head of `buf`.
    ///
    /// Returns `Ok(None)` while incomplete, otherwise the frame and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let b0 = buf[0];
        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        if b0 & 0x30 != 0 {
            return Err(NetError::Protocol("RSV2/RSV3 set without negotiation".into()));
        }
        let opcode = Opcode::from_u8(b0 & 0x0F)
            .ok_or_else(|| NetError::Protocol(format!("reserved opcode 0x{:x}", b0 & 0x0F)))?;
        let b1 = buf[1];
        let masked = b1 & 0x80 != 0;
        let mut offset = 2usize;
        let len = match b1 & 0x7F {
            126 => {
                if buf.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                offset += 2;
                len
            }
            127 => {
                if buf.len() < offset + 8 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes(buf[2..10].try_into().expect("length checked"));
                offset += 8;
                usize::try_from(len)
                    .map_err(|_| NetError::ResourceExhausted("64-bit frame length".into()))?
            }
            short => short as usize,
        };
        if opcode.is_control() {
            if !fin {
                return Err(NetError::Protocol("fragmented control frame".into()));
            }
            if len > 125 {
                return Err(NetError::Protocol("control frame longer than 125 bytes".into()));
            }
        }
        if len > max_payload {
            return Err(NetError::ResourceExhausted(format!(
                "frame of {len} bytes exceeds the {max_payload} byte cap"
            )));
        }
        let key = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key: [u8; 4] = buf[offset..offset + 4].try_into().expect("length checked");
            offset += 4;
            Some(key)
        } else {
            None
        };
        if buf.len() < offset + len {
            return Ok(None);
        }
        let mut payload = buf[offset..offset + len].to_vec();
        if let Some(key) = key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        Ok(Some((Frame { fin, rsv1, opcode, payload }, offset + len)))
    }
}

/// A complete message surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

/// Reassembles fragmented data frames into messages. Control frames are
/// surfaced immediately and may interleave with fragments.
#[derive(Debug)]
pub struct Assembler {
    opcode: Option<Opcode>,
    compressed: bool,
    data: Vec<u8>,
    max_message: usize,
}

impl Assembler {
    pub fn new(max_message: usize) -> Self {
        Self { opcode: None, compressed: false, data: Vec::new(), max_message }
    }

    /// Push one decoded frame; `inflate` is the negotiated deflate codec, if
    /// any. Returns a message when one completes.
    pub fn push(&mut self, frame: Frame, inflate: Option<&mut DeflateCodec>) -> Result<Option<WsMessage>> {
        match frame.opcode {
            Opcode::Ping => return Ok(Some(WsMessage::Ping(frame.payload))),
            Opcode::Pong => return Ok(Some(WsMessage::Pong(frame.payload))),
            Opcode::Close => {
                let close = if frame.payload.len() >= 2 {
                    let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                    let reason = String::from_utf8_lossy(&frame.payload[2..]).into_owned();
                    Some((code, reason))
                } else {
                    None
                };
                return Ok(Some(WsMessage::Close(close)));
            }
            Opcode::Text | Opcode::Binary => {
                if self.opcode.is_some() {
                    return Err(NetError::Protocol(
                        "data frame while a fragmented message is open".into(),
                    ));
                }
                self.opcode = Some(frame.opcode);
                self.compressed = frame.rsv1;
                self.data = frame.payload;
            }
            Opcode::Continuation => {
                if self.opcode.is_none() {
                    return Err(NetError::Protocol("continuation without a first fragment".into()));
                }
                self.data.extend_from_slice(&frame.payload);
            }
        }
        if self.data.len() > self.max_message {
            return Err(NetError::ResourceExhausted(format!(
                "message exceeds the {} byte cap",
                self.max_message
            )));
        }
        if !frame.fin {
            return Ok(None);
        }
        let opcode = self.opcode.take().expect("fin without an open message");
        let mut data = std::mem::take(&mut self.data);
        if self.compressed {
            let Some(codec) = inflate else {
                return Err(NetError::Protocol("compressed frame without negotiation".into()));
            };
            data = codec.decompress(&data)?;
            self.compressed = false;
        }
        match opcode {
            Opcode::Text => {
                let text = String::from_utf8(data)
                    .map_err(|_| NetError::Protocol("text message is not valid UTF-8".into()))?;
                Ok(Some(WsMessage::Text(text)))
            }
            _ => Ok(Some(WsMessage::Binary(data))),
        }
    }
}

/// Stateful per-message DEFLATE transform with context takeover.
///
/// The miniz backend is fixed at a 15-bit window; a smaller negotiated
/// window only bounds what the peer may send, which a 15-bit inflater
/// always accepts.
pub struct DeflateCodec {
    deflate: Compress,
    inflate: Decompress,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DeflateCodec {
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::fast(), false),
            inflate: Decompress::new(false),
        }
    }

    /// Compress a message payload, stripping the trailing `00 00 FF FF`.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut chunk = [0u8; 4096];
        let mut consumed = 0usize;
        loop {
            let before_in = self.deflate.total_in();
            let before_out = self.deflate.total_out();
            let status = self
                .deflate
                .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| NetError::Protocol(format!("deflate failed: {e}")))?;
            consumed += (self.deflate.total_in() - before_in) as usize;
            let produced = (self.deflate.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if status == Status::StreamEnd || (consumed >= input.len() && produced < chunk.len()) {
                break;
            }
        }
        if out.ends_with(&[0x00, 0x00, 0xFF, 0xFF]) {
            out.truncate(out.len() - 4);
        }
        Ok(out)
    }

    /// Inflate a message payload, re-appending the `00 00 FF FF` trailer.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut framed = input.to_vec();
        framed.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
        let mut out = Vec::with_capacity(input.len() * 2 + 64);
        let mut chunk = [0u8; 4096];
        let mut consumed = 0usize;
        loop {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress(&framed[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| NetError::Protocol(format!("inflate failed: {e}")))?;
            consumed += (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if status == Status::StreamEnd || (consumed >= framed.len() && produced < chunk.len()) {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 16 * 1024 * 1024;

    #[test]
    fn unmasked_round_trip() {
        let frame = Frame::new(Opcode::Text, b"Hello".to_vec());
        let wire = frame.encode(false);
        assert_eq!(wire, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        let (decoded, used) = Frame::decode(&wire, CAP).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn masked_round_trip() {
        let frame = Frame::new(Opcode::Binary, vec![7u8; 300]);
        let wire = frame.encode(true);
        // 16-bit extended length + mask bit
        assert_eq!(wire[1], 0x80 | 126);
        let (decoded, _) = Frame::decode(&wire, CAP).unwrap().unwrap();
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn incomplete_frames_need_more() {
        let wire = Frame::new(Opcode::Text, vec![1u8; 200]).encode(true);
        for cut in [1, 2, 3, 5, wire.len() - 1] {
            assert!(Frame::decode(&wire[..cut], CAP).unwrap().is_none());
        }
    }

    #[test]
    fn reserved_opcode_is_protocol_error() {
        assert!(matches!(
            Frame::decode(&[0x83, 0x00], CAP),
            Err(NetError::Protocol(_))
        ));
    }

    #[test]
    fn oversize_control_frame_rejected() {
        let mut frame = Frame::ping(vec![0u8; 126]);
        frame.fin = true;
        let wire = frame.encode(false);
        assert!(Frame::decode(&wire, CAP).is_err());
    }

    #[test]
    fn fragmented_text_reassembles() {
        let mut assembler = Assembler::new(CAP);
        let mut first = Frame::new(Opcode::Text, b"Hel".to_vec());
        first.fin = false;
        assert!(assembler.push(first, None).unwrap().is_none());
        // control frames interleave freely
        let pong = assembler
            .push(Frame::pong(b"hb".to_vec()), None)
            .unwrap()
            .unwrap();
        assert_eq!(pong, WsMessage::Pong(b"hb".to_vec()));
        let rest = Frame { fin: true, rsv1: false, opcode: Opcode::Continuation, payload: b"lo".to_vec() };
        let message = assembler.push(rest, None).unwrap().unwrap();
        assert_eq!(message, WsMessage::Text("Hello".into()));
    }

    #[test]
    fn continuation_without_start_is_error() {
        let mut assembler = Assembler::new(CAP);
        let frame = Frame { fin: true, rsv1: false, opcode: Opcode::Continuation, payload: vec![] };
        assert!(assembler.push(frame, None).is_err());
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let mut assembler = Assembler::new(CAP);
        let message = assembler
            .push(Frame::close(1000, "bye"), None)
            .unwrap()
            .unwrap();
        assert_eq!(message, WsMessage::Close(Some((1000, "bye".into()))));
    }

    #[test]
    fn deflate_round_trip_with_context_takeover() {
        let mut sender = DeflateCodec::new();
        let mut receiver = DeflateCodec::new();
        for text in ["compressible compressible compressible", "again again again"] {
            let squeezed = sender.compress(text.as_bytes()).unwrap();
            let restored = receiver.decompress(&squeezed).unwrap();
            assert_eq!(restored, text.as_bytes());
        }
    }

    #[test]
    fn compressed_message_through_assembler() {
        let mut sender = DeflateCodec::new();
        let mut receiver = DeflateCodec::new();
        let payload = sender.compress(b"deflated body").unwrap();
        let frame = Frame { fin: true, rsv1: true, opcode: Opcode::Binary, payload };
        let mut assembler = Assembler::new(CAP);
        let message = assembler.push(frame, Some(&mut receiver)).unwrap().unwrap();
        assert_eq!(message, WsMessage::Binary(b"deflated body".to_vec()));
    }

    #[test]
    fn compressed_frame_without_negotiation_is_error() {
        let frame = Frame { fin: true, rsv1: true, opcode: Opcode::Text, payload: vec![1, 2] };
        let mut assembler = Assembler::new(CAP);
        assert!(assembler.push(frame, None).is_err());
    }
}
