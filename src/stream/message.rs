//! Stored messages, outbound envelopes, and status header encoding.
//!
//! Status replies are header-only messages: a `NATS/1.0 <code> <desc>`
//! status line followed by optional header fields and a blank line.

use bytes::{BufMut, Bytes, BytesMut};

/// A message at rest in a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub subject: String,
    pub headers: Option<Bytes>,
    pub payload: Bytes,
    pub seq: u64,
    pub timestamp_ns: i64,
}

/// A message headed for the wire. The outbound queue owned by the stream is
/// the only path out of the broker.
///
/// `deliver_to` is the wire destination (deliver subject or a pull reply
/// inbox); `subject` stays the message's own subject so clients see where
/// it was stored.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub deliver_to: String,
    pub subject: String,
    pub reply: String,
    pub headers: Option<Bytes>,
    pub payload: Bytes,
}

impl Envelope {
    pub fn status(deliver_to: String, code: u16, description: &str) -> Self {
        Self {
            subject: deliver_to.clone(),
            deliver_to,
            reply: String::new(),
            headers: Some(StatusHeaders::new(code, description).into_bytes()),
            payload: Bytes::new(),
        }
    }

    pub fn status_with(
        deliver_to: String,
        code: u16,
        description: &str,
        fields: &[(&str, u64)],
    ) -> Self {
        let mut hdr = StatusHeaders::new(code, description);
        for (name, value) in fields {
            hdr = hdr.field_u64(name, *value);
        }
        Self {
            subject: deliver_to.clone(),
            deliver_to,
            reply: String::new(),
            headers: Some(hdr.into_bytes()),
            payload: Bytes::new(),
        }
    }

    /// Total byte weight used for flow-control accounting.
    pub fn wire_len(&self) -> usize {
        self.subject.len()
            + self.reply.len()
            + self.headers.as_ref().map(|h| h.len()).unwrap_or(0)
            + self.payload.len()
    }
}

/// Append one field to an existing header block (or start a plain one).
pub fn append_header(headers: Option<&Bytes>, name: &str, value: &str) -> Bytes {
    match headers {
        None => StatusHeaders::plain().field(name, value).into_bytes(),
        Some(existing) => {
            let mut buf = BytesMut::with_capacity(existing.len() + name.len() + value.len() + 4);
            // The block ends with a blank line; splice the field in front of it.
            let body = existing
                .strip_suffix(b"\r\n")
                .unwrap_or(&existing[..]);
            buf.put_slice(body);
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n\r\n");
            buf.freeze()
        }
    }
}

// ==========================================
// STATUS CODES
// ==========================================

pub const STATUS_IDLE_HEARTBEAT: (u16, &str) = (100, "Idle Heartbeat");
pub const STATUS_BAD_REQUEST: (u16, &str) = (400, "Bad Request");
pub const STATUS_FLOW_CONTROL: (u16, &str) = (100, "FlowControl Request");
pub const STATUS_NO_MESSAGES: (u16, &str) = (404, "No Messages");
pub const STATUS_REQUEST_TIMEOUT: (u16, &str) = (408, "Request Timeout");
pub const STATUS_INTEREST_EXPIRED: (u16, &str) = (408, "Interest Expired");
pub const STATUS_NO_FLOW_RESPONSE: (u16, &str) = (408, "No Flow Response");
pub const STATUS_CONSUMER_DELETED: (u16, &str) = (409, "Consumer Deleted");
pub const STATUS_CONSUMER_IS_PUSH: (u16, &str) = (409, "Consumer is push based");
pub const STATUS_MAX_WAITING: (u16, &str) = (409, "Exceeded MaxWaiting");
pub const STATUS_MAX_REQUEST_BATCH: (u16, &str) = (409, "Exceeded MaxRequestBatch");
pub const STATUS_MAX_REQUEST_EXPIRES: (u16, &str) = (409, "Exceeded MaxRequestExpires");
pub const STATUS_MAX_REQUEST_MAX_BYTES: (u16, &str) = (409, "Exceeded MaxRequestMaxBytes");
pub const STATUS_BATCH_COMPLETED: (u16, &str) = (409, "Batch Completed");
pub const STATUS_MSG_SIZE_EXCEEDS: (u16, &str) = (409, "Message Size Exceeds MaxBytes");
pub const STATUS_LEADERSHIP_CHANGE: (u16, &str) = (409, "Leadership Change");
pub const STATUS_WRONG_PIN_ID: (u16, &str) = (423, "Nats-Wrong-Pin-Id");

// ==========================================
// HEADER NAMES
// ==========================================

pub const HDR_PREFIX: &str = "NATS/1.0";
pub const HDR_PENDING_MESSAGES: &str = "Nats-Pending-Messages";
pub const HDR_PENDING_BYTES: &str = "Nats-Pending-Bytes";
pub const HDR_MSG_SIZE: &str = "Nats-Msg-Size";
pub const HDR_PIN_ID: &str = "Nats-Pin-Id";
pub const HDR_LAST_CONSUMER: &str = "Nats-Last-Consumer";
pub const HDR_LAST_STREAM: &str = "Nats-Last-Stream";
pub const HDR_CONSUMER_STALLED: &str = "Nats-Consumer-Stalled";

// ==========================================
// STATUS HEADER BUILDER
// ==========================================

pub struct StatusHeaders {
    buf: BytesMut,
}

impl StatusHeaders {
    pub fn new(code: u16, description: &str) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(HDR_PREFIX.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(code.to_string().as_bytes());
        if !description.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(description.as_bytes());
        }
        buf.put_slice(b"\r\n");
        Self { buf }
    }

    /// Plain header block with no status line.
    pub fn plain() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(HDR_PREFIX.as_bytes());
        buf.put_slice(b"\r\n");
        Self { buf }
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.buf.put_slice(name.as_bytes());
        self.buf.put_slice(b": ");
        self.buf.put_slice(value.as_bytes());
        self.buf.put_slice(b"\r\n");
        self
    }

    pub fn field_u64(self, name: &str, value: u64) -> Self {
        self.field(name, &value.to_string())
    }

    pub fn into_bytes(mut self) -> Bytes {
        self.buf.put_slice(b"\r\n");
        self.buf.freeze()
    }
}

/// Extract the numeric status code out of an encoded header block.
pub fn status_code(headers: &Bytes) -> Option<u16> {
    let line = headers.split(|b| *b == b'\r').next()?;
    let code = line.get(HDR_PREFIX.len() + 1..HDR_PREFIX.len() + 4)?;
    std::str::from_utf8(code).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_block_encoding() {
        let hdr = StatusHeaders::new(408, "Request Timeout")
            .field_u64(HDR_PENDING_MESSAGES, 3)
            .field_u64(HDR_PENDING_BYTES, 0)
            .into_bytes();
        let text = std::str::from_utf8(&hdr).unwrap();
        assert!(text.starts_with("NATS/1.0 408 Request Timeout\r\n"));
        assert!(text.contains("Nats-Pending-Messages: 3\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(status_code(&hdr), Some(408));
    }

    #[test]
    fn test_status_envelope() {
        let env = Envelope::status("reply.inbox".into(), 404, "No Messages");
        assert_eq!(status_code(env.headers.as_ref().unwrap()), Some(404));
        assert!(env.payload.is_empty());
    }
}
