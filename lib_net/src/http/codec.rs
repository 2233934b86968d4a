//! # HTTP/1.1 message codec
//!
//! Incremental request/response framing over the broker's read buffer:
//! CRLF-delimited head (parsed with `httparse`), case-insensitive header
//! lookup, `Content-Length`, `Transfer-Encoding: chunked` and
//! close-delimited bodies. One codec instance parses one direction of one
//! connection; `reset` rearms it for the next message (pipelining keeps any
//! surplus bytes).

#![forbid(unsafe_code)]

use crate::errors::{NetError, Result};

const MAX_HEADERS: usize = 64;
/// Hard cap on a buffered head; beyond this the peer is attacking or broken.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Ordered, case-insensitive header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Append without replacing.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// A parsed or to-be-sent request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Serialize head and body. A `Content-Length` is filled in unless the
    /// message is chunked or already carries one.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        self.headers.write_to(&mut out);
        if !self.body.is_empty()
            && !self.headers.contains("Content-Length")
            && !self.headers.contains("Transfer-Encoding")
        {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// A parsed or to-be-sent response.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: reason_phrase(code).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(code: u16, body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        let mut response = Self::new(code);
        response.body = body.into();
        response.headers.set("Content-Type", content_type);
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.code, self.reason).as_bytes());
        self.headers.write_to(&mut out);
        if !self.headers.contains("Content-Length")
            && !self.headers.contains("Transfer-Encoding")
            && body_allowed(self.code)
        {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// One decoded HTTP message.
#[derive(Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// `Connection: close` (or HTTP/1.0 default) on either side.
pub fn wants_close(headers: &Headers) -> bool {
    headers
        .get("Connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(usize),
    Chunked(ChunkPhase),
    Close,
}

#[derive(Debug)]
enum Head {
    Request { method: String, target: String, headers: Headers },
    Response { code: u16, reason: String, headers: Headers },
}

/// Incremental one-direction HTTP parser.
#[derive(Debug)]
pub struct HttpCodec {
    kind: Kind,
    state: State,
    buf: Vec<u8>,
    head: Option<Head>,
    framing: Framing,
    body: Vec<u8>,
    /// Responses to HEAD (and 1xx/204/304) have a head but no body bytes.
    head_request: bool,
    /// A successful CONNECT response ends at the head; what follows is the
    /// tunnel, not a body.
    connect_response: bool,
}

impl HttpCodec {
    /// Parser for requests (server side).
    pub fn request() -> Self {
        Self::new(Kind::Request)
    }

    /// Parser for responses (client side).
    pub fn response() -> Self {
        Self::new(Kind::Response)
    }

    fn new(kind: Kind) -> Self {
        Self {
            kind,
            state: State::Head,
            buf: Vec::new(),
            head: None,
            framing: Framing::None,
            body: Vec::new(),
            head_request: false,
            connect_response: false,
        }
    }

    /// The next response being parsed answers a HEAD request.
    pub fn expect_head_response(&mut self, yes: bool) {
        self.head_request = yes;
    }

    /// The next response being parsed answers a CONNECT request.
    pub fn expect_connect_response(&mut self, yes: bool) {
        self.connect_response = yes;
    }

    /// Rearm for the next message on the same connection, keeping surplus
    /// input.
    pub fn reset(&mut self) {
        self.state = State::Head;
        self.head = None;
        self.framing = Framing::None;
        self.body = Vec::new();
        self.head_request = false;
        self.connect_response = false;
    }

    /// Surplus bytes after the current message (connection upgrades).
    pub fn take_residue(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Whether unparsed input is buffered.
    pub fn has_residue(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feed input; returns a complete message as soon as one is available.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Message>> {
        self.buf.extend_from_slice(data);
        loop {
            match self.state {
                State::Head => {
                    if !self.parse_head()? {
                        return Ok(None);
                    }
                }
                State::Body => {
                    if !self.advance_body()? {
                        return Ok(None);
                    }
                }
                State::Done => return Ok(Some(self.take_message())),
            }
        }
    }

    /// Signal end-of-stream: close-delimited bodies complete here.
    pub fn finish(&mut self) -> Result<Option<Message>> {
        match (self.state, self.framing) {
            (State::Body, Framing::Close) => {
                self.body.append(&mut self.buf);
                self.state = State::Done;
                Ok(Some(self.take_message()))
            }
            (State::Head, _) if self.buf.is_empty() && self.head.is_none() => Ok(None),
            (State::Done, _) => Ok(Some(self.take_message())),
            _ => Err(NetError::PeerClosed),
        }
    }

    fn parse_head(&mut self) -> Result<bool> {
        if self.buf.len() > MAX_HEAD_BYTES {
            return Err(NetError::Protocol("HTTP head exceeds 64 KiB".into()));
        }
        let parsed = match self.kind {
            Kind::Request => {
                let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut req = httparse::Request::new(&mut slots);
                match req.parse(&self.buf) {
                    Ok(httparse::Status::Complete(used)) => {
                        let headers = copy_headers(req.headers);
                        let head = Head::Request {
                            method: req.method.unwrap_or_default().to_string(),
                            target: req.path.unwrap_or_default().to_string(),
                            headers,
                        };
                        Some((head, used))
                    }
                    Ok(httparse::Status::Partial) => None,
                    Err(e) => {
                        return Err(NetError::HandshakeInvalid(format!(
                            "malformed request head: {e}"
                        )))
                    }
                }
            }
            Kind::Response => {
                let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut resp = httparse::Response::new(&mut slots);
                match resp.parse(&self.buf) {
                    Ok(httparse::Status::Complete(used)) => {
                        let headers = copy_headers(resp.headers);
                        let head = Head::Response {
                            code: resp.code.unwrap_or_default(),
                            reason: resp.reason.unwrap_or_default().to_string(),
                            headers,
                        };
                        Some((head, used))
                    }
                    Ok(httparse::Status::Partial) => None,
                    Err(e) => {
                        return Err(NetError::HandshakeInvalid(format!(
                            "malformed status line or headers: {e}"
                        )))
                    }
                }
            }
        };
        let Some((head, used)) = parsed else {
            return Ok(false);
        };
        self.buf.drain(..used);
        self.framing = self.pick_framing(&head)?;
        self.head = Some(head);
        self.state = if self.framing == Framing::None { State::Done } else { State::Body };
        Ok(true)
    }

    fn pick_framing(&self, head: &Head) -> Result<Framing> {
        let (headers, code) = match head {
            Head::Request { headers, .. } => (headers, None),
            Head::Response { headers, code, .. } => (headers, Some(*code)),
        };
        if let Some(code) = code {
            if self.head_request || !body_allowed(code) {
                return Ok(Framing::None);
            }
            if self.connect_response && (200..300).contains(&code) {
                return Ok(Framing::None);
            }
        }
        let chunked = headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Framing::Chunked(ChunkPhase::Size));
        }
        if let Some(length) = headers.get("Content-Length") {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| NetError::Protocol(format!("bad Content-Length {length:?}")))?;
            return Ok(if length == 0 { Framing::None } else { Framing::Length(length) });
        }
        match self.kind {
            // requests without explicit framing carry no body
            Kind::Request => Ok(Framing::None),
            Kind::Response => Ok(Framing::Close),
        }
    }

    fn advance_body(&mut self) -> Result<bool> {
        match self.framing {
            Framing::None => {
                self.state = State::Done;
                Ok(true)
            }
            Framing::Length(total) => {
                let missing = total - self.body.len();
                let take = missing.min(self.buf.len());
                self.body.extend(self.buf.drain(..take));
                if self.body.len() == total {
                    self.state = State::Done;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Framing::Close => {
                self.body.append(&mut self.buf);
                Ok(false)
            }
            Framing::Chunked(_) => self.advance_chunked(),
        }
    }

    fn advance_chunked(&mut self) -> Result<bool> {
        loop {
            let Framing::Chunked(phase) = self.framing else { unreachable!() };
            match phase {
                ChunkPhase::Size => {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        return Ok(false);
                    };
                    let line = std::str::from_utf8(&self.buf[..line_end])
                        .map_err(|_| NetError::Protocol("chunk size is not ASCII".into()))?;
                    let size_token = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_token, 16).map_err(|_| {
                        NetError::Protocol(format!("bad chunk size {size_token:?}"))
                    })?;
                    self.buf.drain(..line_end + 2);
                    self.framing = Framing::Chunked(if size == 0 {
                        ChunkPhase::Trailer
                    } else {
                        ChunkPhase::Data(size)
                    });
                }
                ChunkPhase::Data(remaining) => {
                    let take = remaining.min(self.buf.len());
                    self.body.extend(self.buf.drain(..take));
                    if take == remaining {
                        self.framing = Framing::Chunked(ChunkPhase::DataCrlf);
                    } else {
                        self.framing = Framing::Chunked(ChunkPhase::Data(remaining - take));
                        return Ok(false);
                    }
                }
                ChunkPhase::DataCrlf => {
                    if self.buf.len() < 2 {
                        return Ok(false);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(NetError::Protocol("chunk data not CRLF-terminated".into()));
                    }
                    self.buf.drain(..2);
                    self.framing = Framing::Chunked(ChunkPhase::Size);
                }
                ChunkPhase::Trailer => {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        return Ok(false);
                    };
                    let empty = line_end == 0;
                    self.buf.drain(..line_end + 2);
                    if empty {
                        self.state = State::Done;
                        return Ok(true);
                    }
                    // trailer headers are consumed and dropped
                }
            }
        }
    }

    fn take_message(&mut self) -> Message {
        self.state = State::Head;
        self.framing = Framing::None;
        let body = std::mem::take(&mut self.body);
        match self.head.take().expect("message taken without a head") {
            Head::Request { method, target, headers } => {
                Message::Request(Request { method, target, headers, body })
            }
            Head::Response { code, reason, headers } => {
                Message::Response(Response { code, reason, headers, body })
            }
        }
    }
}

fn copy_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::new();
    for h in parsed {
        headers.append(h.name, String::from_utf8_lossy(h.value).into_owned());
    }
    headers
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn body_allowed(code: u16) -> bool {
    !(code < 200 || code == 204 || code == 304)
}

/// Canonical reason phrase for the codes this framework emits.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(codec: &mut HttpCodec, bytes: &[u8]) -> Option<Message> {
        codec.feed(bytes).unwrap()
    }

    #[test]
    fn content_length_response() {
        let mut codec = HttpCodec::response();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let Some(Message::Response(resp)) = feed_all(&mut codec, wire) else {
            panic!("expected a response");
        };
        assert_eq!(resp.code, 200);
        assert_eq!(resp.headers.get("content-type"), Some("text/plain"));
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn split_delivery() {
        let mut codec = HttpCodec::response();
        assert!(feed_all(&mut codec, b"HTTP/1.1 200 OK\r\nContent-Le").is_none());
        assert!(feed_all(&mut codec, b"ngth: 4\r\n\r\nbo").is_none());
        let Some(Message::Response(resp)) = feed_all(&mut codec, b"dy") else {
            panic!("expected completion");
        };
        assert_eq!(resp.body, b"body");
    }

    #[test]
    fn chunked_body_with_extension_and_trailer() {
        let mut codec = HttpCodec::response();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trail: 1\r\n\r\n";
        let Some(Message::Response(resp)) = feed_all(&mut codec, wire) else {
            panic!("expected a response");
        };
        assert_eq!(resp.body, b"Wikipedia");
    }

    #[test]
    fn chunked_violation_is_protocol_error() {
        let mut codec = HttpCodec::response();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWikiXX";
        let err = codec.feed(wire).unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[test]
    fn close_delimited_body_ends_at_eof() {
        let mut codec = HttpCodec::response();
        assert!(feed_all(&mut codec, b"HTTP/1.1 200 OK\r\n\r\npartial").is_none());
        assert!(feed_all(&mut codec, b" stream").is_none());
        let Some(Message::Response(resp)) = codec.finish().unwrap() else {
            panic!("expected completion at EOF");
        };
        assert_eq!(resp.body, b"partial stream");
    }

    #[test]
    fn request_without_framing_has_no_body() {
        let mut codec = HttpCodec::request();
        let Some(Message::Request(req)) = feed_all(&mut codec, b"GET /p?q=1 HTTP/1.1\r\nHost: h\r\n\r\n")
        else {
            panic!("expected a request");
        };
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/p?q=1");
        assert!(req.body.is_empty());
    }

    #[test]
    fn pipelined_requests() {
        let mut codec = HttpCodec::request();
        let wire = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let Some(Message::Request(first)) = feed_all(&mut codec, wire) else {
            panic!("expected first request");
        };
        assert_eq!(first.target, "/a");
        codec.reset();
        let Some(Message::Request(second)) = feed_all(&mut codec, b"") else {
            panic!("expected second request");
        };
        assert_eq!(second.target, "/b");
    }

    #[test]
    fn malformed_status_line_is_handshake_invalid() {
        let mut codec = HttpCodec::response();
        let err = codec.feed(b"NOT-HTTP garbage\r\n\r\n").unwrap_err();
        assert!(matches!(err, NetError::HandshakeInvalid(_)));
    }

    #[test]
    fn encode_fills_content_length() {
        let mut req = Request::new("POST", "/submit");
        req.headers.set("Host", "example.com");
        req.body = b"abc".to_vec();
        let wire = String::from_utf8(req.encode()).unwrap();
        assert!(wire.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("X-Custom", "1");
        headers.append("x-custom", "2");
        assert_eq!(headers.get("X-CUSTOM"), Some("1"));
        assert_eq!(headers.get_all("x-Custom").count(), 2);
        headers.set("X-CUSTOM", "3");
        assert_eq!(headers.get_all("x-custom").count(), 1);
    }

    #[test]
    fn connection_close_detection() {
        let mut headers = Headers::new();
        assert!(!wants_close(&headers));
        headers.set("Connection", "keep-alive, Close");
        assert!(wants_close(&headers));
    }

    #[test]
    fn no_body_codes_complete_without_body() {
        let mut codec = HttpCodec::response();
        let Some(Message::Response(resp)) = feed_all(&mut codec, b"HTTP/1.1 204 No Content\r\n\r\n")
        else {
            panic!("expected a response");
        };
        assert_eq!(resp.code, 204);
        assert!(resp.body.is_empty());
    }
}
