//! Ack wire format
//!
//! Every delivery carries a reply subject encoding the full delivery
//! coordinates; the payload of a message published to that subject selects
//! the ack sub-operation.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::consumer::errors::ConsumerError;
use crate::utils::utils_time::parse_duration;

pub const ACK_SUBJECT_PREFIX: &str = "$JS.ACK";
pub const ACK_SUBJECT_TOKENS: usize = 9;

pub const ACK_ACK: &[u8] = b"+ACK";
pub const ACK_OK: &[u8] = b"+OK";
pub const ACK_NEXT: &[u8] = b"+NXT";
pub const ACK_NAK: &[u8] = b"-NAK";
pub const ACK_PROGRESS: &[u8] = b"+WPI";
pub const ACK_TERM: &[u8] = b"+TERM";

/// `$JS.ACK.<stream>.<consumer>.<dc>.<sseq>.<dseq>.<ts>.<pending>`
#[derive(Debug, Clone, PartialEq)]
pub struct AckReply {
    pub stream: String,
    pub consumer: String,
    pub delivery_count: u64,
    pub stream_seq: u64,
    pub deliver_seq: u64,
    pub timestamp_ns: i64,
    pub pending: u64,
}

impl AckReply {
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}.{}.{}.{}",
            ACK_SUBJECT_PREFIX,
            self.stream,
            self.consumer,
            self.delivery_count,
            self.stream_seq,
            self.deliver_seq,
            self.timestamp_ns,
            self.pending
        )
    }

    pub fn parse(subject: &str) -> Result<Self, ConsumerError> {
        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.len() != ACK_SUBJECT_TOKENS || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return Err(ConsumerError::BadRequest(format!(
                "malformed ack subject '{}'",
                subject
            )));
        }
        let num = |i: usize| -> Result<u64, ConsumerError> {
            tokens[i].parse().map_err(|_| {
                ConsumerError::BadRequest(format!("malformed ack subject token '{}'", tokens[i]))
            })
        };
        Ok(Self {
            stream: tokens[2].to_string(),
            consumer: tokens[3].to_string(),
            delivery_count: num(4)?,
            stream_seq: num(5)?,
            deliver_seq: num(6)?,
            timestamp_ns: num(7)? as i64,
            pending: num(8)?,
        })
    }
}

// ==========================================
// ACK OPERATIONS
// ==========================================

#[derive(Debug, Clone, PartialEq)]
pub enum AckOp {
    Ack,
    /// Negative ack, optionally asking for the redelivery to wait.
    Nak { delay: Option<Duration> },
    /// Work-in-progress: reset the ack-wait clock.
    Progress,
    /// Stop redelivering; `reason` feeds the terminated advisory.
    Term { reason: String },
    /// Ack plus an inlined next-message request.
    Next { body: Bytes },
}

#[derive(Deserialize)]
struct NakOptions {
    #[serde(default)]
    delay: i64,
}

impl AckOp {
    pub fn parse(payload: &Bytes) -> AckOp {
        if payload.is_empty() {
            return AckOp::Ack;
        }
        if starts_with_token(payload, ACK_ACK) || starts_with_token(payload, ACK_OK) {
            return AckOp::Ack;
        }
        if payload.starts_with(ACK_NEXT) {
            return AckOp::Next {
                body: payload.slice(ACK_NEXT.len()..),
            };
        }
        if payload.starts_with(ACK_NAK) {
            let tail = String::from_utf8_lossy(&payload[ACK_NAK.len()..]);
            let tail = tail.trim();
            let delay = if tail.is_empty() {
                None
            } else if tail.starts_with('{') {
                serde_json::from_str::<NakOptions>(tail)
                    .ok()
                    .filter(|o| o.delay > 0)
                    .map(|o| Duration::from_nanos(o.delay as u64))
            } else {
                parse_duration(tail)
            };
            return AckOp::Nak { delay };
        }
        if starts_with_token(payload, ACK_PROGRESS) {
            return AckOp::Progress;
        }
        if payload.starts_with(ACK_TERM) {
            let reason = String::from_utf8_lossy(&payload[ACK_TERM.len()..])
                .trim()
                .to_string();
            return AckOp::Term { reason };
        }
        AckOp::Ack
    }
}

fn starts_with_token(payload: &[u8], token: &[u8]) -> bool {
    payload == token || (payload.starts_with(token) && payload.get(token.len()) == Some(&b' '))
}
