//! RFC 6455 client-side framing and handshake validation
//!
//! The codec is push-based: feed it raw bytes and collect the events it
//! yields. The first phase parses the HTTP 101 upgrade response and checks
//! `Sec-WebSocket-Accept`; after that, frames are decoded, unmasked if
//! needed, and reassembled across continuations.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha1::{Digest, Sha1};

/*
     0                   1                   2                   3
     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-------+-+-------------+-------------------------------+
    |F|R|R|R| opcode|M| Payload len | Extended payload length       |
    |I|S|S|S|   (4) |A|     (7)     |          (16/64)              |
    |N|V|V|V|       |S|             | (if payload len==126/127)     |
    | |1|2|3|       |K|             |                               |
    +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
    |     Extended payload length continued, if payload len == 127  |
    + - - - - - - - - - - - - - - - +-------------------------------+
    |                               | Masking-key, if MASK set to 1 |
    +-------------------------------+-------------------------------+
    | Masking-key (continued)       | Payload Data                  |
    +-------------------------------- - - - - - - - - - - - - - - - +
*/

const FLAG_FIN: u8 = 0b1000_0000;
const FLAG_MASK: u8 = 0b1000_0000;
const RESERVED_BIT_MASK: u8 = 0b0111_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const PAYLOAD_LENGTH_7_MASK: u8 = 0b0111_1111;

const OPCODE_CONTINUATION: u8 = 0x00;
const OPCODE_TEXT: u8 = 0x01;
const OPCODE_BINARY: u8 = 0x02;
const OPCODE_CLOSE: u8 = 0x08;
const OPCODE_PING: u8 = 0x09;
const OPCODE_PONG: u8 = 0x0a;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// One decoded event from the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// The upgrade handshake completed and frames may flow.
    Ready,
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
    /// Protocol violation; the connection is unusable afterwards.
    Error(String),
}

enum Phase {
    Handshake,
    Data,
    Failed,
}

struct PartialMessage {
    opcode: u8,
    payload: Vec<u8>,
}

pub struct WebSocketCodec {
    session_key: String,
    phase: Phase,
    buffer: Vec<u8>,
    partial: Option<PartialMessage>,
}

impl Default for WebSocketCodec {
    fn default() -> Self {
        let mut key_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut key_bytes);
        WebSocketCodec {
            session_key: BASE64.encode(key_bytes),
            phase: Phase::Handshake,
            buffer: Vec::new(),
            partial: None,
        }
    }
}

/// `base64(sha1(key + guid))`, the expected `Sec-WebSocket-Accept` value.
pub fn accept_signature(session_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(session_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

impl WebSocketCodec {
    pub fn new() -> WebSocketCodec {
        WebSocketCodec::default()
    }

    /// The random `Sec-WebSocket-Key` this codec expects to see echoed.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Client handshake request for `path` on `host:port`.
    pub fn handshake_request(&self, path: &str, host: &str, port: u16, authorization: &str) -> Vec<u8> {
        format!(
            "GET {path} HTTP/1.1\r\n\
             Authorization: Basic {authorization}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Host: {host}:{port}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             \r\n",
            key = self.session_key,
        )
        .into_bytes()
    }

    pub fn text(&self, message: &[u8]) -> Vec<u8> {
        encode_frame(OPCODE_TEXT, message)
    }

    pub fn binary(&self, message: &[u8]) -> Vec<u8> {
        encode_frame(OPCODE_BINARY, message)
    }

    pub fn ping(&self, message: &[u8]) -> Vec<u8> {
        encode_frame(OPCODE_PING, message)
    }

    pub fn pong(&self, message: &[u8]) -> Vec<u8> {
        encode_frame(OPCODE_PONG, message)
    }

    pub fn close(&self, message: &[u8]) -> Vec<u8> {
        encode_frame(OPCODE_CLOSE, message)
    }

    /// Consume a chunk from the wire and return the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<WsEvent> {
        match self.phase {
            Phase::Failed => Vec::new(),
            Phase::Handshake => self.feed_handshake(chunk),
            Phase::Data => {
                self.buffer.extend_from_slice(chunk);
                self.drain_frames()
            }
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> Vec<WsEvent> {
        self.phase = Phase::Failed;
        vec![WsEvent::Error(message.into())]
    }

    fn feed_handshake(&mut self, chunk: &[u8]) -> Vec<WsEvent> {
        self.buffer.extend_from_slice(chunk);
        let Some(head_end) = find_header_end(&self.buffer) else {
            return Vec::new();
        };

        let head = self.buffer[..head_end].to_vec();
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Vec::new(),
            Err(err) => return self.fail(format!("failed to parse HTTP response: {err}")),
        }
        if response.code != Some(101) {
            return self.fail(format!(
                "response status must be 101 ({} {})",
                response.code.unwrap_or(0),
                response.reason.unwrap_or("")
            ));
        }
        let header = |name: &str| -> Option<String> {
            response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| String::from_utf8_lossy(h.value).to_string())
        };
        if !header("connection").is_some_and(|v| v.eq_ignore_ascii_case("upgrade")) {
            return self.fail("response must carry Connection: Upgrade");
        }
        if !header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
            return self.fail("response must carry Upgrade: websocket");
        }
        match header("sec-websocket-accept") {
            Some(signature) if signature == accept_signature(&self.session_key) => {}
            _ => return self.fail("response must carry a valid Sec-WebSocket-Accept"),
        }

        self.buffer.drain(..head_end);
        self.phase = Phase::Data;
        let mut events = vec![WsEvent::Ready];
        events.extend(self.drain_frames());
        events
    }

    fn drain_frames(&mut self) -> Vec<WsEvent> {
        let mut events = Vec::new();
        loop {
            match decode_frame(&self.buffer, self.partial.is_some()) {
                DecodeStatus::NeedMoreData => return events,
                DecodeStatus::Error(message) => {
                    events.extend(self.fail(message));
                    return events;
                }
                DecodeStatus::Frame(frame) => {
                    let payload = frame.payload;
                    match frame.opcode {
                        OPCODE_TEXT | OPCODE_BINARY => {
                            if frame.expect_continuation {
                                self.partial =
                                    Some(PartialMessage { opcode: frame.opcode, payload });
                            } else if frame.opcode == OPCODE_TEXT {
                                events.push(WsEvent::Text(payload));
                            } else {
                                events.push(WsEvent::Binary(payload));
                            }
                        }
                        OPCODE_CONTINUATION => match self.partial.as_mut() {
                            Some(partial) => {
                                partial.payload.extend_from_slice(&payload);
                                if !frame.expect_continuation {
                                    let complete = self.partial.take().unwrap();
                                    if complete.opcode == OPCODE_TEXT {
                                        events.push(WsEvent::Text(complete.payload));
                                    } else {
                                        events.push(WsEvent::Binary(complete.payload));
                                    }
                                }
                            }
                            None => {
                                events.extend(self.fail("unexpected continuation frame"));
                                return events;
                            }
                        },
                        OPCODE_CLOSE => events.push(WsEvent::Close(payload)),
                        OPCODE_PING => events.push(WsEvent::Ping(payload)),
                        OPCODE_PONG => events.push(WsEvent::Pong(payload)),
                        other => {
                            events.extend(self.fail(format!("unexpected frame type: {other}")));
                            return events;
                        }
                    }
                    self.buffer.drain(..frame.consumed);
                }
            }
        }
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n").map(|pos| pos + 4)
}

fn is_control_frame(opcode: u8) -> bool {
    matches!(opcode, OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG)
}

fn is_data_frame(opcode: u8) -> bool {
    matches!(opcode, OPCODE_TEXT | OPCODE_BINARY)
}

struct DecodedFrame {
    opcode: u8,
    payload: Vec<u8>,
    consumed: usize,
    expect_continuation: bool,
}

enum DecodeStatus {
    Frame(DecodedFrame),
    NeedMoreData,
    Error(String),
}

fn decode_frame(data: &[u8], expecting_continuation: bool) -> DecodeStatus {
    if data.len() < 2 {
        return DecodeStatus::NeedMoreData;
    }
    let first = data[0];
    if first & RESERVED_BIT_MASK != 0 {
        return DecodeStatus::Error("reserved bit used".into());
    }
    let expect_continuation = first & FLAG_FIN == 0;
    let opcode = first & OPCODE_MASK;

    if expect_continuation && is_control_frame(opcode) {
        return DecodeStatus::Error("fragmented control frame".into());
    }
    if is_data_frame(opcode) && expecting_continuation {
        return DecodeStatus::Error("expected continuation frame".into());
    }

    let second = data[1];
    let masked = second & FLAG_MASK != 0;
    let length_7 = second & PAYLOAD_LENGTH_7_MASK;
    if is_control_frame(opcode) && length_7 > 125 {
        return DecodeStatus::Error("control frame is too long".into());
    }

    let (header_length, payload_length) = match length_7 {
        127 => {
            if data.len() < 10 {
                return DecodeStatus::NeedMoreData;
            }
            (10usize, u64::from_be_bytes(data[2..10].try_into().unwrap()) as usize)
        }
        126 => {
            if data.len() < 4 {
                return DecodeStatus::NeedMoreData;
            }
            (4usize, u16::from_be_bytes([data[2], data[3]]) as usize)
        }
        _ => (2usize, length_7 as usize),
    };

    let masking_key_size = if masked { 4 } else { 0 };
    if data.len() < header_length + masking_key_size + payload_length {
        return DecodeStatus::NeedMoreData;
    }

    let mut payload =
        data[header_length + masking_key_size..header_length + masking_key_size + payload_length]
            .to_vec();
    if masked {
        let masking_key = &data[header_length..header_length + 4];
        mask_payload(masking_key, &mut payload);
    }

    DecodeStatus::Frame(DecodedFrame {
        opcode,
        payload,
        consumed: header_length + masking_key_size + payload_length,
        expect_continuation,
    })
}

fn mask_payload(masking_key: &[u8], payload: &mut [u8]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= masking_key[index % masking_key.len()];
    }
}

fn encode_payload_length(length: usize, out: &mut Vec<u8>) {
    if length <= 125 {
        out.push(length as u8 | FLAG_MASK);
    } else if length <= 0xffff {
        out.push(126 | FLAG_MASK);
        out.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        out.push(127 | FLAG_MASK);
        out.extend_from_slice(&(length as u64).to_be_bytes());
    }
}

/// Client frames are always masked and always FIN.
fn encode_frame(opcode: u8, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + message.len());
    out.push(opcode | FLAG_FIN);
    encode_payload_length(message.len(), &mut out);
    let mut masking_key = [0u8; 4];
    rand::rng().fill_bytes(&mut masking_key);
    out.extend_from_slice(&masking_key);
    let payload_start = out.len();
    out.extend_from_slice(message);
    mask_payload(&masking_key, &mut out[payload_start..]);
    out
}
