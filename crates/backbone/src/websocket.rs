//! RFC 6455 handshake and framing for sniffed WebSocket channels.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::message::FrameError;
use crate::sniff::find_header_end;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SUPPORTED_VERSION: &str = "13";

pub const END_FRAME: u8 = 0x80;
pub const TEXT_FRAME: u8 = 0x81;
pub const BINARY_FRAME: u8 = 0x82;
pub const PING_FRAME: u8 = 0x89;
pub const PONG_FRAME: u8 = 0x8A;
pub const CLOSE_FRAME: u8 = 0x08;

const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub path: String,
    pub key: String,
}

impl Handshake {
    /// Parses an upgrade request. Returns `Ok(None)` until the header is
    /// complete, otherwise the handshake and the header length consumed.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        let Some(end) = find_header_end(data) else {
            return Ok(None);
        };
        let text =
            std::str::from_utf8(&data[..end]).map_err(|_| FrameError::Malformed("upgrade request"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        if parts.next() != Some("GET") {
            return Err(FrameError::Malformed("upgrade request line"));
        }
        let path = parts.next().unwrap_or("/").to_string();

        let mut key = None;
        let mut upgrade = false;
        let mut version_ok = false;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("sec-websocket-key") {
                key = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("upgrade") {
                upgrade = value.eq_ignore_ascii_case("websocket");
            } else if name.eq_ignore_ascii_case("sec-websocket-version") {
                version_ok = value == SUPPORTED_VERSION;
            }
        }

        if !upgrade {
            return Err(FrameError::Malformed("upgrade header"));
        }
        if !version_ok {
            return Err(FrameError::Malformed("websocket version"));
        }
        let key = key.ok_or(FrameError::Malformed("websocket key"))?;
        Ok(Some((Self { path, key }, end)))
    }

    pub fn response(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&self.key)
        )
        .into_bytes()
    }
}

/// Builds the client side of the upgrade request.
pub fn client_request(host: &str, path: &str, key: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {SUPPORTED_VERSION}\r\n\r\n"
    )
    .into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            mask: None,
            payload,
        }
    }

    pub fn control(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload,
        }
    }

    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 14);

    let fin = if frame.fin { END_FRAME } else { 0 };
    out.push(fin | frame.opcode.as_u8());

    let mask_bit = if frame.mask.is_some() { MASK_BIT } else { 0 };
    if len <= MAX_CONTROL_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match frame.mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }
    out
}

/// Incremental frame parser over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    staging: Vec<u8>,
    require_mask: bool,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(require_mask: bool, max_payload: usize) -> Self {
        Self {
            staging: Vec::new(),
            require_mask,
            max_payload,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.staging.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.staging.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let data = &self.staging;
        if data.len() < 2 {
            return Ok(None);
        }

        let fin = data[0] & END_FRAME != 0;
        if data[0] & 0x70 != 0 {
            return Err(FrameError::Malformed("websocket reserved bits"));
        }
        let opcode =
            Opcode::from_u8(data[0] & 0x0F).ok_or(FrameError::Malformed("websocket opcode"))?;
        let masked = data[1] & MASK_BIT != 0;
        if self.require_mask && !masked {
            return Err(FrameError::Malformed("unmasked client frame"));
        }

        let mut pos = 2;
        let len = match data[1] & 0x7F {
            LEN_16 => {
                if data.len() < pos + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[2], data[3]]) as u64;
                pos += 2;
                len
            }
            LEN_64 => {
                if data.len() < pos + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                pos += 8;
                u64::from_be_bytes(raw)
            }
            short => short as u64,
        };

        if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(FrameError::Malformed("websocket control frame"));
        }
        if len > self.max_payload as u64 {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let mask = if masked {
            if data.len() < pos + 4 {
                return Ok(None);
            }
            let key = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
            pos += 4;
            Some(key)
        } else {
            None
        };

        let len = len as usize;
        if data.len() < pos + len {
            return Ok(None);
        }

        let mut payload = data[pos..pos + len].to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        self.staging.drain(..pos + len);

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload,
        }))
    }
}

/// Result of decoding one read's worth of WebSocket bytes.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Reassembled application payloads, in order.
    pub data: Vec<u8>,
    /// Control replies (pong, close) that must go out before anything else.
    pub replies: Vec<u8>,
    pub closed: bool,
}

/// Server-side WebSocket session: reassembles fragmented messages, answers
/// pings and close, and wraps outgoing bytes as binary frames.
#[derive(Debug)]
pub struct WebSocketCodec {
    decoder: FrameDecoder,
    fragment: Option<Vec<u8>>,
    max_payload: usize,
    closed: bool,
}

impl WebSocketCodec {
    pub fn server(max_payload: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(true, max_payload),
            fragment: None,
            max_payload,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, FrameError> {
        let mut out = Decoded::default();
        if self.closed {
            return Ok(out);
        }
        self.decoder.feed(bytes);

        while let Some(frame) = self.decoder.next_frame()? {
            match frame.opcode {
                Opcode::Ping => {
                    out.replies
                        .extend(encode_frame(&Frame::control(Opcode::Pong, frame.payload)));
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let status = frame.payload.get(..2).map(<[u8]>::to_vec).unwrap_or_default();
                    out.replies
                        .extend(encode_frame(&Frame::control(Opcode::Close, status)));
                    out.closed = true;
                    self.closed = true;
                    break;
                }
                Opcode::Text | Opcode::Binary => {
                    if self.fragment.is_some() {
                        return Err(FrameError::Malformed("interleaved websocket message"));
                    }
                    if frame.fin {
                        out.data.extend_from_slice(&frame.payload);
                    } else {
                        self.fragment = Some(frame.payload);
                    }
                }
                Opcode::Continuation => {
                    let Some(mut partial) = self.fragment.take() else {
                        return Err(FrameError::Malformed("orphan websocket continuation"));
                    };
                    let len = partial.len() + frame.payload.len();
                    if len > self.max_payload {
                        return Err(FrameError::MessageTooLarge {
                            len,
                            max: self.max_payload,
                        });
                    }
                    partial.extend_from_slice(&frame.payload);
                    if frame.fin {
                        out.data.extend_from_slice(&partial);
                    } else {
                        self.fragment = Some(partial);
                    }
                }
            }
        }

        Ok(out)
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        encode_frame(&Frame::binary(payload.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_frame_sizes_round_trip() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            for mask in [None, Some([0x37, 0xFA, 0x21, 0x3D])] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let frame = Frame {
                    fin: true,
                    opcode: Opcode::Binary,
                    mask,
                    payload,
                };
                let wire = encode_frame(&frame);

                let header = match len {
                    0..=125 => 2,
                    126..=65535 => 4,
                    _ => 10,
                } + if mask.is_some() { 4 } else { 0 };
                assert_eq!(wire.len(), header + len, "len {len} mask {mask:?}");

                let mut decoder = FrameDecoder::new(false, 1 << 20);
                decoder.feed(&wire);
                let decoded = decoder.next_frame().unwrap().unwrap();
                assert_eq!(decoded, frame, "len {len} mask {mask:?}");
                assert_eq!(decoder.buffered(), 0);
            }
        }
    }

    #[test]
    fn test_frame_type_bytes() {
        assert_eq!(encode_frame(&Frame::control(Opcode::Ping, vec![]))[0], PING_FRAME);
        assert_eq!(encode_frame(&Frame::control(Opcode::Pong, vec![]))[0], PONG_FRAME);
        assert_eq!(encode_frame(&Frame::binary(vec![]))[0], BINARY_FRAME);
        let text = Frame {
            fin: true,
            opcode: Opcode::Text,
            mask: None,
            payload: vec![],
        };
        assert_eq!(encode_frame(&text)[0], TEXT_FRAME);
        assert_eq!(encode_frame(&Frame::control(Opcode::Close, vec![]))[0] & 0x0F, CLOSE_FRAME);
    }

    #[test]
    fn test_server_rejects_unmasked_frames() {
        let mut codec = WebSocketCodec::server(1024);
        let wire = encode_frame(&Frame::binary(b"hi".to_vec()));
        assert!(codec.decode(&wire).is_err());
    }

    #[test]
    fn test_codec_reassembles_and_answers_ping() {
        let key = [1, 2, 3, 4];
        let mut wire = encode_frame(
            &Frame {
                fin: false,
                opcode: Opcode::Binary,
                mask: None,
                payload: b"hel".to_vec(),
            }
            .masked(key),
        );
        wire.extend(encode_frame(&Frame::control(Opcode::Ping, b"p".to_vec()).masked(key)));
        wire.extend(encode_frame(
            &Frame {
                fin: true,
                opcode: Opcode::Continuation,
                mask: None,
                payload: b"lo".to_vec(),
            }
            .masked(key),
        ));

        let mut codec = WebSocketCodec::server(1024);
        // Split mid-frame to exercise buffering.
        let first = codec.decode(&wire[..5]).unwrap();
        assert!(first.data.is_empty());
        let rest = codec.decode(&wire[5..]).unwrap();
        assert_eq!(rest.data, b"hello");
        assert_eq!(rest.replies, encode_frame(&Frame::control(Opcode::Pong, b"p".to_vec())));
        assert!(!rest.closed);
    }

    #[test]
    fn test_fragmented_message_is_bounded() {
        let key = [7, 7, 7, 7];
        let fragment = |fin: bool, opcode: Opcode, len: usize| {
            encode_frame(
                &Frame {
                    fin,
                    opcode,
                    mask: None,
                    payload: vec![0xAB; len],
                }
                .masked(key),
            )
        };

        let mut codec = WebSocketCodec::server(1024);
        assert!(codec.decode(&fragment(false, Opcode::Binary, 1000)).unwrap().data.is_empty());
        let err = codec
            .decode(&fragment(false, Opcode::Continuation, 1000))
            .unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge { len: 2000, max: 1024 }));

        let mut codec = WebSocketCodec::server(1024);
        codec.decode(&fragment(false, Opcode::Binary, 1000)).unwrap();
        let decoded = codec.decode(&fragment(true, Opcode::Continuation, 24)).unwrap();
        assert_eq!(decoded.data.len(), 1024);
    }

    #[test]
    fn test_close_is_echoed() {
        let mut codec = WebSocketCodec::server(1024);
        let wire = encode_frame(&Frame::control(Opcode::Close, vec![0x03, 0xE8]).masked([9, 9, 9, 9]));
        let decoded = codec.decode(&wire).unwrap();
        assert!(decoded.closed);
        assert!(codec.is_closed());
        assert_eq!(
            decoded.replies,
            encode_frame(&Frame::control(Opcode::Close, vec![0x03, 0xE8]))
        );
    }

    #[test]
    fn test_handshake_parse_and_response() {
        let request = client_request("localhost", "/game", "dGhlIHNhbXBsZSBub25jZQ==");
        let (handshake, consumed) = Handshake::parse(&request).unwrap().unwrap();
        assert_eq!(consumed, request.len());
        assert_eq!(handshake.path, "/game");

        let response = String::from_utf8(handshake.response()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        assert_eq!(Handshake::parse(&request[..10]).unwrap(), None);
    }
}
