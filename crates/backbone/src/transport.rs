use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reliable::{ReliableConfig, ReliableSession};
use crate::websocket::WebSocketCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Stream,
    Datagram,
    ReliableDatagram,
    WebSocket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stream => "tcp",
            Transport::Datagram => "udp",
            Transport::ReliableDatagram => "rudp",
            Transport::WebSocket => "websocket",
        }
    }

    /// Datagram bundles must not split a message across buffers.
    pub fn aligned_bundles(&self) -> bool {
        matches!(self, Transport::Datagram)
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, Transport::Datagram | Transport::ReliableDatagram)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bytes that came off the endpoint after transport decoding.
#[derive(Debug, Default)]
pub(crate) struct Incoming {
    /// Native-framed bytes, one entry per delivered unit.
    pub chunks: Vec<Vec<u8>>,
    /// Pre-framed control traffic to send back (pong, close, handshake).
    pub replies: Vec<Vec<u8>>,
    pub closed: bool,
}

/// Per-channel transport state; the variant follows [`Transport`].
#[derive(Debug)]
pub(crate) enum TransportState {
    Stream,
    Datagram,
    Reliable(ReliableSession),
    WebSocket(WebSocketCodec),
}

impl TransportState {
    pub fn new(transport: Transport, reliable: &ReliableConfig, max_payload: usize) -> Self {
        match transport {
            Transport::Stream => TransportState::Stream,
            Transport::Datagram => TransportState::Datagram,
            Transport::ReliableDatagram => {
                TransportState::Reliable(ReliableSession::new(reliable.clone()))
            }
            Transport::WebSocket => TransportState::WebSocket(WebSocketCodec::server(max_payload)),
        }
    }

    pub fn decode(&mut self, bytes: &[u8], now: Instant) -> Result<Incoming> {
        let mut incoming = Incoming::default();
        match self {
            TransportState::Stream | TransportState::Datagram => {
                incoming.chunks.push(bytes.to_vec());
            }
            TransportState::Reliable(session) => {
                incoming.chunks = session.receive(bytes, now)?;
            }
            TransportState::WebSocket(codec) => {
                let decoded = codec.decode(bytes)?;
                if !decoded.data.is_empty() {
                    incoming.chunks.push(decoded.data);
                }
                if !decoded.replies.is_empty() {
                    incoming.replies.push(decoded.replies);
                }
                incoming.closed = decoded.closed;
            }
        }
        Ok(incoming)
    }

    /// Frames one outgoing buffer. `None` means it goes out as-is.
    pub fn encode(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            TransportState::Stream | TransportState::Datagram => Ok(None),
            TransportState::Reliable(session) => session.send(payload).map(Some),
            TransportState::WebSocket(codec) => Ok(Some(codec.encode(payload))),
        }
    }

    /// Called after the endpoint accepted a buffer produced by `encode`.
    pub fn on_sent(&mut self, now: Instant) {
        if let TransportState::Reliable(session) = self {
            session.confirm_sent(now);
        }
    }

    /// Timer-driven output: retransmissions and bare acks.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<Vec<u8>>> {
        match self {
            TransportState::Reliable(session) => session.poll(now),
            _ => Ok(Vec::new()),
        }
    }

    pub fn reliable(&self) -> Option<&ReliableSession> {
        match self {
            TransportState::Reliable(session) => Some(session),
            _ => None,
        }
    }
}
