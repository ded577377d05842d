//! Pull-request waiting queue
//!
//! A bounded FIFO of outstanding next-message requests. Admission, byte
//! budgets, expiry, and heartbeat scheduling live on the request; the
//! dispatch selection (priority groups, interest checks) is driven by the
//! delivery loop.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::consumer::errors::ConsumerError;

/// `$JS.API.CONSUMER.MSG.NEXT.<stream>.<consumer>`
pub fn next_request_subject(stream: &str, consumer: &str) -> String {
    format!("$JS.API.CONSUMER.MSG.NEXT.{}.{}", stream, consumer)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityGroupRequest {
    pub group: String,
    pub id: String,
    pub min_pending: u64,
    pub min_ack_pending: u64,
}

/// Parsed body of a next-message request. Times are nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NextRequest {
    pub expires: i64,
    pub batch: usize,
    pub max_bytes: usize,
    pub no_wait: bool,
    pub idle_heartbeat: i64,
    pub priority_group: Option<PriorityGroupRequest>,
}

impl NextRequest {
    /// Empty body means a single message; a bare ASCII integer is a batch
    /// size; anything else must be the JSON form.
    pub fn parse(body: &Bytes) -> Result<Self, ConsumerError> {
        let trimmed: &[u8] = {
            let mut b = &body[..];
            while b.first() == Some(&b' ') {
                b = &b[1..];
            }
            b
        };
        if trimmed.is_empty() {
            return Ok(Self {
                batch: 1,
                ..Default::default()
            });
        }
        if trimmed.iter().all(|b| b.is_ascii_digit()) {
            let batch = std::str::from_utf8(trimmed)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    ConsumerError::BadRequest("malformed batch size".to_string())
                })?;
            return Ok(Self {
                batch,
                ..Default::default()
            });
        }
        let mut req: NextRequest = serde_json::from_slice(trimmed)
            .map_err(|e| ConsumerError::BadRequest(format!("malformed next request: {}", e)))?;
        if req.batch == 0 {
            req.batch = 1;
        }
        Ok(req)
    }
}

// ==========================================
// WAITING REQUEST
// ==========================================

#[derive(Debug, Clone)]
pub struct WaitingRequest {
    /// Where served messages (and terminal statuses) go.
    pub reply: String,
    /// Subject whose interest existence keeps the request alive.
    pub interest: String,
    pub batch: usize,
    pub delivered: usize,
    pub max_bytes: usize,
    pub bytes_delivered: usize,
    /// Absolute deadline in unix nanoseconds; 0 = never expires.
    pub expires_ns: i64,
    pub hb_interval_ns: i64,
    pub hb_next_ns: i64,
    pub no_wait: bool,
    pub group: Option<PriorityGroupRequest>,
    pub received_ns: i64,
}

impl WaitingRequest {
    pub fn from_request(req: &NextRequest, reply: String, now_ns: i64) -> Self {
        Self {
            interest: reply.clone(),
            reply,
            batch: req.batch,
            delivered: 0,
            max_bytes: req.max_bytes,
            bytes_delivered: 0,
            expires_ns: if req.expires > 0 { now_ns + req.expires } else { 0 },
            hb_interval_ns: req.idle_heartbeat,
            hb_next_ns: if req.idle_heartbeat > 0 {
                now_ns + req.idle_heartbeat
            } else {
                0
            },
            no_wait: req.no_wait,
            group: req.priority_group.clone(),
            received_ns: now_ns,
        }
    }

    pub fn expired(&self, now_ns: i64) -> bool {
        self.expires_ns > 0 && now_ns >= self.expires_ns
    }

    pub fn remaining(&self) -> usize {
        self.batch.saturating_sub(self.delivered)
    }

    pub fn remaining_bytes(&self) -> usize {
        self.max_bytes.saturating_sub(self.bytes_delivered)
    }

    /// A byte budget exists and `size` does not fit in what is left.
    pub fn over_byte_budget(&self, size: usize) -> bool {
        self.max_bytes > 0 && size > self.remaining_bytes()
    }

    pub fn record_delivery(&mut self, size: usize) {
        self.delivered += 1;
        self.bytes_delivered += size;
    }

    pub fn done(&self) -> bool {
        self.remaining() == 0
    }
}

// ==========================================
// WAIT QUEUE
// ==========================================

#[derive(Debug)]
pub struct WaitQueue {
    reqs: VecDeque<WaitingRequest>,
    max: usize,
}

impl WaitQueue {
    pub fn new(max: usize) -> Self {
        Self {
            reqs: VecDeque::new(),
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.reqs.len() >= self.max
    }

    /// Admission. A full queue hands the request back to the caller so it
    /// can answer (or silently drop, in heartbeat mode).
    pub fn push(&mut self, wr: WaitingRequest) -> Result<(), WaitingRequest> {
        if self.is_full() {
            return Err(wr);
        }
        self.reqs.push_back(wr);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<WaitingRequest> {
        self.reqs.pop_front()
    }

    pub fn front(&self) -> Option<&WaitingRequest> {
        self.reqs.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut WaitingRequest> {
        self.reqs.front_mut()
    }

    /// Rotate the head to the back (priority-group cycling).
    pub fn cycle(&mut self) {
        if let Some(wr) = self.reqs.pop_front() {
            self.reqs.push_back(wr);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitingRequest> {
        self.reqs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WaitingRequest> {
        self.reqs.iter_mut()
    }

    pub fn drain_all(&mut self) -> Vec<WaitingRequest> {
        self.reqs.drain(..).collect()
    }

    /// Earliest instant anything in the queue needs timer attention.
    pub fn next_deadline_ns(&self) -> Option<i64> {
        let mut next: Option<i64> = None;
        for wr in &self.reqs {
            for candidate in [wr.expires_ns, wr.hb_next_ns] {
                if candidate > 0 {
                    next = Some(next.map_or(candidate, |n| n.min(candidate)));
                }
            }
        }
        next
    }
}
