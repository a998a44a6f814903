//! Native message framing.
//!
//! Every logical message is `[id: u16][len: u16][payload]`, little-endian.
//! Messages registered with a fixed payload length omit the length field.
//! A variable payload of `0xFFFF` bytes or more stores `0xFFFF` in the u16
//! and follows it with a `u32` extended length.

use std::collections::HashMap;

use thiserror::Error;

pub type MessageId = u16;

pub const MESSAGE_ID_LEN: usize = 2;
pub const MESSAGE_LENGTH_LEN: usize = 2;
pub const MESSAGE_LENGTH_EXT_LEN: usize = 4;
pub const EXTENDED_LENGTH_MARKER: u16 = 0xFFFF;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown message id {0}")]
    UnknownMessage(MessageId),
    #[error("message {id} declares {len} bytes, limit is {max}")]
    LengthExceeded { id: MessageId, len: usize, max: usize },
    #[error("message {id} is fixed at {expected} bytes but carried {actual}")]
    FixedLengthMismatch {
        id: MessageId,
        expected: usize,
        actual: usize,
    },
    #[error("field read past the end of the payload")]
    Truncated,
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("websocket frame of {len} bytes, limit is {max}")]
    FrameTooLarge { len: u64, max: usize },
    #[error("fragmented websocket message grew to {len} bytes, limit is {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSpec {
    pub id: MessageId,
    pub name: &'static str,
    pub fixed_len: Option<u16>,
}

impl MessageSpec {
    pub const fn variable(id: MessageId, name: &'static str) -> Self {
        Self {
            id,
            name,
            fixed_len: None,
        }
    }

    pub const fn fixed(id: MessageId, name: &'static str, len: u16) -> Self {
        Self {
            id,
            name,
            fixed_len: Some(len),
        }
    }

    pub fn header_len(&self) -> usize {
        match self.fixed_len {
            Some(_) => MESSAGE_ID_LEN,
            None => MESSAGE_ID_LEN + MESSAGE_LENGTH_LEN,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageTable {
    specs: HashMap<MessageId, MessageSpec>,
}

impl MessageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(specs: &[MessageSpec]) -> Self {
        let mut table = Self::new();
        for spec in specs {
            table.register(*spec);
        }
        table
    }

    /// Returns false when the id is already taken.
    pub fn register(&mut self, spec: MessageSpec) -> bool {
        if self.specs.contains_key(&spec.id) {
            log::warn!(
                "message id {} already registered, ignoring {}",
                spec.id,
                spec.name
            );
            return false;
        }
        self.specs.insert(spec.id, spec);
        true
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageSpec> {
        self.specs.get(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.specs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn name(&self, id: MessageId) -> &'static str {
        self.specs.get(&id).map(|s| s.name).unwrap_or("<unknown>")
    }
}

/// One complete message handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn reader(&self) -> crate::field::FieldReader<'_> {
        crate::field::FieldReader::new(&self.payload)
    }

    /// Re-frames the message exactly as it appeared on the wire.
    pub fn to_wire(&self, spec: &MessageSpec) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 8);
        out.extend_from_slice(&self.id.to_le_bytes());
        if spec.fixed_len.is_none() {
            write_length(&mut out, self.payload.len());
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

pub(crate) fn write_length(out: &mut Vec<u8>, len: usize) {
    if len >= EXTENDED_LENGTH_MARKER as usize {
        out.extend_from_slice(&EXTENDED_LENGTH_MARKER.to_le_bytes());
        out.extend_from_slice(&(len as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(len as u16).to_le_bytes());
    }
}

/// Reassembles a byte stream into messages. Partial headers and payloads
/// stay buffered until the rest arrives.
#[derive(Debug)]
pub struct MessageReader {
    staging: Vec<u8>,
    cursor: usize,
    max_len: usize,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl MessageReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            staging: Vec::with_capacity(4096),
            cursor: 0,
            max_len,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.cursor > 0 && self.cursor * 2 >= self.staging.len() {
            self.staging.drain(..self.cursor);
            self.cursor = 0;
        }
        self.staging.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.staging.len() - self.cursor
    }

    pub fn reset(&mut self) {
        self.staging.clear();
        self.cursor = 0;
    }

    pub fn next_message(&mut self, table: &MessageTable) -> Result<Option<Message>, FrameError> {
        let data = &self.staging[self.cursor..];
        if data.len() < MESSAGE_ID_LEN {
            return Ok(None);
        }

        let id = u16::from_le_bytes([data[0], data[1]]);
        let spec = table.get(id).ok_or(FrameError::UnknownMessage(id))?;

        let (header_len, payload_len) = match spec.fixed_len {
            Some(len) => (MESSAGE_ID_LEN, len as usize),
            None => {
                if data.len() < MESSAGE_ID_LEN + MESSAGE_LENGTH_LEN {
                    return Ok(None);
                }
                let short = u16::from_le_bytes([data[2], data[3]]);
                if short == EXTENDED_LENGTH_MARKER {
                    let header = MESSAGE_ID_LEN + MESSAGE_LENGTH_LEN + MESSAGE_LENGTH_EXT_LEN;
                    if data.len() < header {
                        return Ok(None);
                    }
                    let ext = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                    (header, ext as usize)
                } else {
                    (MESSAGE_ID_LEN + MESSAGE_LENGTH_LEN, short as usize)
                }
            }
        };

        if payload_len > self.max_len {
            return Err(FrameError::LengthExceeded {
                id,
                len: payload_len,
                max: self.max_len,
            });
        }

        if data.len() < header_len + payload_len {
            return Ok(None);
        }

        let payload = data[header_len..header_len + payload_len].to_vec();
        self.cursor += header_len + payload_len;
        if self.cursor == self.staging.len() {
            self.staging.clear();
            self.cursor = 0;
        }

        Ok(Some(Message { id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING: MessageSpec = MessageSpec::fixed(10, "ping", 4);
    const CHAT: MessageSpec = MessageSpec::variable(11, "chat");

    fn table() -> MessageTable {
        MessageTable::with(&[PING, CHAT])
    }

    #[test]
    fn test_reader_handles_byte_by_byte_delivery() {
        let msg = Message {
            id: CHAT.id,
            payload: b"hello".to_vec(),
        };
        let wire = msg.to_wire(&CHAT);

        let mut reader = MessageReader::default();
        let table = table();
        for (i, byte) in wire.iter().enumerate() {
            reader.feed(std::slice::from_ref(byte));
            let result = reader.next_message(&table).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(msg.clone()));
            }
        }
    }

    #[test]
    fn test_fixed_length_message_has_no_length_field() {
        let msg = Message {
            id: PING.id,
            payload: vec![1, 2, 3, 4],
        };
        let wire = msg.to_wire(&PING);
        assert_eq!(wire.len(), 6);

        let mut reader = MessageReader::default();
        reader.feed(&wire);
        assert_eq!(reader.next_message(&table()).unwrap(), Some(msg));
    }

    #[test]
    fn test_extended_length() {
        let msg = Message {
            id: CHAT.id,
            payload: vec![7u8; 70_000],
        };
        let wire = msg.to_wire(&CHAT);
        assert_eq!(&wire[2..4], &[0xFF, 0xFF]);
        assert_eq!(wire.len(), 8 + 70_000);

        let mut reader = MessageReader::default();
        reader.feed(&wire);
        assert_eq!(reader.next_message(&table()).unwrap(), Some(msg));
    }

    #[test]
    fn test_unknown_id_is_malformed() {
        let mut reader = MessageReader::default();
        reader.feed(&[0xAB, 0xCD, 0, 0]);
        assert_eq!(
            reader.next_message(&table()),
            Err(FrameError::UnknownMessage(0xCDAB))
        );
    }

    #[test]
    fn test_length_limit() {
        let mut reader = MessageReader::new(16);
        reader.feed(&[11, 0, 100, 0]);
        assert!(matches!(
            reader.next_message(&table()),
            Err(FrameError::LengthExceeded { len: 100, .. })
        ));
    }

    #[test]
    fn test_several_messages_in_one_feed() {
        let mut wire = Message {
            id: PING.id,
            payload: vec![0; 4],
        }
        .to_wire(&PING);
        wire.extend(
            Message {
                id: CHAT.id,
                payload: b"x".to_vec(),
            }
            .to_wire(&CHAT),
        );

        let mut reader = MessageReader::default();
        reader.feed(&wire);
        let table = table();
        assert_eq!(reader.next_message(&table).unwrap().unwrap().id, PING.id);
        assert_eq!(reader.next_message(&table).unwrap().unwrap().id, CHAT.id);
        assert!(reader.next_message(&table).unwrap().is_none());
        assert_eq!(reader.buffered(), 0);
    }
}
