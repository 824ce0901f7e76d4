//! The unit of work moving through the engine.
//!
//! Wire encoding, big-endian:
//! `timestamp(8) || attempts(2) || id(16) || body`

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::EngineError;

pub const MSG_ID_LENGTH: usize = 16;
/// Smallest valid encoded message: header with an empty body.
pub const MSG_MIN_SIZE: usize = 8 + 2 + MSG_ID_LENGTH;

/// Opaque 16-byte message identifier; ASCII hex, printable on the wire
/// as-is.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MSG_ID_LENGTH]);

impl MessageId {
    pub fn from_u64(v: u64) -> Self {
        let mut buf = [0u8; MSG_ID_LENGTH];
        let hex = b"0123456789abcdef";
        for (i, slot) in buf.iter_mut().enumerate() {
            let shift = 60 - 4 * i;
            *slot = hex[((v >> shift) & 0xf) as usize];
        }
        MessageId(buf)
    }

    pub fn from_slice(s: &[u8]) -> Result<Self, EngineError> {
        if s.len() != MSG_ID_LENGTH {
            return Err(EngineError::BadMessage(format!(
                "invalid message id length {}",
                s.len()
            )));
        }
        let mut buf = [0u8; MSG_ID_LENGTH];
        buf.copy_from_slice(s);
        Ok(MessageId(buf))
    }

    pub fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ids are ASCII hex by construction
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Vec<u8>,

    // runtime state, never serialized
    pub delivery_ts: i64,
    pub client_id: i64,
    pub priority: i64,
    pub index: usize,
    /// DPUB delay carried from the publish path to the channel.
    pub deferred_ns: i64,
}

impl Message {
    pub fn new(id: MessageId, body: Vec<u8>) -> Self {
        Self {
            id,
            timestamp: ems_utils::time::now_ns(),
            attempts: 0,
            body,
            delivery_ts: 0,
            client_id: 0,
            priority: 0,
            index: usize::MAX,
            deferred_ns: 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        MSG_MIN_SIZE + self.body.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.put_slice(&self.id.0);
        buf.put_slice(&self.body);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Message, EngineError> {
        if data.len() < MSG_MIN_SIZE {
            return Err(EngineError::BadMessage(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let timestamp = buf.get_i64();
        let attempts = buf.get_u16();
        let id = MessageId::from_slice(&buf[..MSG_ID_LENGTH])?;
        buf.advance(MSG_ID_LENGTH);

        let mut m = Message::new(id, buf.to_vec());
        m.timestamp = timestamp;
        m.attempts = attempts;
        Ok(m)
    }
}

/// Per-topic id source: wall-clock seed plus a sequence, so ids stay
/// monotonic within a topic and unique across restarts.
pub struct IdFactory {
    next: AtomicU64,
}

impl IdFactory {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(ems_utils::time::now_ns() as u64),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId::from_u64(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdFactory {
    fn default() -> Self {
        Self::new()
    }
}
