//! Replicated consumer-op encoding
//!
//! Delivery-state updates travel through the consensus log as compact
//! binary entries: [Opcode: 1] followed by big-endian fields. Parsing uses
//! a bounds-checked cursor so a torn entry surfaces as an error instead of
//! a panic.

use bytes::{BufMut, Bytes, BytesMut};

pub const OP_UPDATE_DELIVERED: u8 = 0x01;
pub const OP_UPDATE_ACK: u8 = 0x02;
pub const OP_UPDATE_SKIP: u8 = 0x03;
pub const OP_DELETE: u8 = 0x04;

/// Delivery-state update flowing through the consensus log.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerOp {
    /// `deliver_msg` outcome: must commit before the wire sees the message.
    Delivered {
        deliver_seq: u64,
        stream_seq: u64,
        delivery_count: u64,
        timestamp_ns: i64,
    },
    /// Ack floor movement for (deliver_seq, stream_seq).
    Ack { deliver_seq: u64, stream_seq: u64 },
    /// Cursor jumped over a filtered gap; replicas advance to `stream_seq`.
    Skip { stream_seq: u64 },
    /// Consumer removal.
    Delete,
}

impl ConsumerOp {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(33);
        match self {
            ConsumerOp::Delivered {
                deliver_seq,
                stream_seq,
                delivery_count,
                timestamp_ns,
            } => {
                buf.put_u8(OP_UPDATE_DELIVERED);
                buf.put_u64(*deliver_seq);
                buf.put_u64(*stream_seq);
                buf.put_u64(*delivery_count);
                buf.put_i64(*timestamp_ns);
            }
            ConsumerOp::Ack {
                deliver_seq,
                stream_seq,
            } => {
                buf.put_u8(OP_UPDATE_ACK);
                buf.put_u64(*deliver_seq);
                buf.put_u64(*stream_seq);
            }
            ConsumerOp::Skip { stream_seq } => {
                buf.put_u8(OP_UPDATE_SKIP);
                buf.put_u64(*stream_seq);
            }
            ConsumerOp::Delete => {
                buf.put_u8(OP_DELETE);
            }
        }
        buf.freeze()
    }

    pub fn parse(entry: &Bytes) -> Result<Self, String> {
        let mut cursor = EntryCursor::new(entry.clone());
        let opcode = cursor.read_u8()?;
        match opcode {
            OP_UPDATE_DELIVERED => Ok(ConsumerOp::Delivered {
                deliver_seq: cursor.read_u64()?,
                stream_seq: cursor.read_u64()?,
                delivery_count: cursor.read_u64()?,
                timestamp_ns: cursor.read_i64()?,
            }),
            OP_UPDATE_ACK => Ok(ConsumerOp::Ack {
                deliver_seq: cursor.read_u64()?,
                stream_seq: cursor.read_u64()?,
            }),
            OP_UPDATE_SKIP => Ok(ConsumerOp::Skip {
                stream_seq: cursor.read_u64()?,
            }),
            OP_DELETE => Ok(ConsumerOp::Delete),
            _ => Err(format!("Unknown consumer opcode: 0x{:02X}", opcode)),
        }
    }
}

// ==========================================
// CURSOR
// ==========================================

pub struct EntryCursor {
    data: Bytes,
    offset: usize,
}

impl EntryCursor {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    fn has_remaining(&self, len: usize) -> bool {
        self.offset + len <= self.data.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, String> {
        if !self.has_remaining(1) {
            return Err("Entry too short for u8".to_string());
        }
        let val = self.data[self.offset];
        self.offset += 1;
        Ok(val)
    }

    pub fn read_u64(&mut self) -> Result<u64, String> {
        if !self.has_remaining(8) {
            return Err("Entry too short for u64".to_string());
        }
        let val = u64::from_be_bytes(
            self.data[self.offset..self.offset + 8].try_into().unwrap(),
        );
        self.offset += 8;
        Ok(val)
    }

    pub fn read_i64(&mut self) -> Result<i64, String> {
        self.read_u64().map(|v| v as i64)
    }
}
