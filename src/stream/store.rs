//! Message store capability
//!
//! The consumer never touches the log directly: it consumes this trait.
//! `MemoryStore` is the in-process implementation backing tests and
//! embedders that do not need durability.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::stream::message::StoredMessage;
use crate::stream::subject;
use crate::utils::utils_time::now_ns;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No message at that sequence (never existed or out of range).
    NotFound,
    /// The sequence existed but was deleted (purge, per-message delete).
    Deleted,
    /// No matching message at or beyond the requested sequence. Carries how
    /// far the scan advanced so callers can jump their cursor over the gap.
    Eof { last_seq: u64 },
    Closed,
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "no message found"),
            StoreError::Deleted => write!(f, "message was deleted"),
            StoreError::Eof { last_seq } => write!(f, "end of stream (scanned to {})", last_seq),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::Io(msg) => write!(f, "store io error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// O(1) snapshot of the stream's sequence space.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FastState {
    pub first_seq: u64,
    pub last_seq: u64,
    pub msgs: u64,
}

pub trait MessageStore: Send + Sync {
    fn load_msg(&self, seq: u64) -> Result<StoredMessage, StoreError>;

    /// First message with `seq >= from_seq` matching `filter` (None = any).
    fn load_next_msg(&self, filter: Option<&str>, from_seq: u64)
        -> Result<StoredMessage, StoreError>;

    /// Multi-filter variant: first message matching any of `filters`.
    fn load_next_msg_multi(
        &self,
        filters: &[String],
        from_seq: u64,
    ) -> Result<StoredMessage, StoreError>;

    fn fast_state(&self) -> FastState;

    /// Lowest sequence with a timestamp at or after `t`.
    fn seq_for_time(&self, t: DateTime<Utc>) -> u64;

    fn subject_for_seq(&self, seq: u64) -> Option<String>;

    /// Number of messages from `from_seq` onward matching `filter`, and the
    /// last sequence the count is valid through.
    fn num_pending(&self, from_seq: u64, filter: Option<&str>, last_per_subject: bool)
        -> (u64, u64);

    /// Greatest sequence per distinct subject among messages matching any
    /// filter, capped at `up_to` (0 = no cap). Ascending order.
    fn multi_last_seqs(&self, filters: &[String], up_to: u64) -> Vec<u64>;
}

// ==========================================
// MEMORY STORE
// ==========================================

struct MemoryStoreInner {
    log: VecDeque<Option<StoredMessage>>,
    first_seq: u64,
    last_seq: u64,
    msgs: u64,
}

pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                log: VecDeque::new(),
                first_seq: 1,
                last_seq: 0,
                msgs: 0,
            }),
        }
    }

    pub fn append(&self, subject: &str, headers: Option<Bytes>, payload: Bytes) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.last_seq + 1;
        inner.log.push_back(Some(StoredMessage {
            subject: subject.to_string(),
            headers,
            payload,
            seq,
            timestamp_ns: now_ns(),
        }));
        inner.last_seq = seq;
        inner.msgs += 1;
        seq
    }

    /// Remove a single message, leaving a hole in the sequence space.
    pub fn remove_msg(&self, seq: u64) -> bool {
        let mut inner = self.inner.lock();
        if seq < inner.first_seq || seq > inner.last_seq {
            return false;
        }
        let idx = (seq - inner.first_seq) as usize;
        let removed = match inner.log.get_mut(idx) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        };
        if removed {
            inner.msgs -= 1;
        }
        removed
    }

    /// Drop everything up to and including `seq`.
    pub fn purge_up_to(&self, seq: u64) {
        let mut inner = self.inner.lock();
        while inner.first_seq <= seq && inner.first_seq <= inner.last_seq {
            if let Some(Some(_)) = inner.log.pop_front() {
                inner.msgs -= 1;
            }
            inner.first_seq += 1;
        }
    }

    fn matches(msg: &StoredMessage, filter: Option<&str>) -> bool {
        match filter {
            Some(f) => subject::subject_matches(f, &msg.subject),
            None => true,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryStore {
    fn load_msg(&self, seq: u64) -> Result<StoredMessage, StoreError> {
        let inner = self.inner.lock();
        if seq < inner.first_seq || seq > inner.last_seq {
            return Err(StoreError::NotFound);
        }
        let idx = (seq - inner.first_seq) as usize;
        match inner.log.get(idx) {
            Some(Some(msg)) => Ok(msg.clone()),
            Some(None) => Err(StoreError::Deleted),
            None => Err(StoreError::NotFound),
        }
    }

    fn load_next_msg(
        &self,
        filter: Option<&str>,
        from_seq: u64,
    ) -> Result<StoredMessage, StoreError> {
        let inner = self.inner.lock();
        let start = from_seq.max(inner.first_seq);
        for seq in start..=inner.last_seq {
            let idx = (seq - inner.first_seq) as usize;
            if let Some(Some(msg)) = inner.log.get(idx) {
                if Self::matches(msg, filter) {
                    return Ok(msg.clone());
                }
            }
        }
        Err(StoreError::Eof {
            last_seq: inner.last_seq,
        })
    }

    fn load_next_msg_multi(
        &self,
        filters: &[String],
        from_seq: u64,
    ) -> Result<StoredMessage, StoreError> {
        let inner = self.inner.lock();
        let start = from_seq.max(inner.first_seq);
        for seq in start..=inner.last_seq {
            let idx = (seq - inner.first_seq) as usize;
            if let Some(Some(msg)) = inner.log.get(idx) {
                if filters.iter().any(|f| subject::subject_matches(f, &msg.subject)) {
                    return Ok(msg.clone());
                }
            }
        }
        Err(StoreError::Eof {
            last_seq: inner.last_seq,
        })
    }

    fn fast_state(&self) -> FastState {
        let inner = self.inner.lock();
        FastState {
            first_seq: inner.first_seq,
            last_seq: inner.last_seq,
            msgs: inner.msgs,
        }
    }

    fn seq_for_time(&self, t: DateTime<Utc>) -> u64 {
        let target_ns = t.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let inner = self.inner.lock();
        for seq in inner.first_seq..=inner.last_seq {
            let idx = (seq - inner.first_seq) as usize;
            if let Some(Some(msg)) = inner.log.get(idx) {
                if msg.timestamp_ns >= target_ns {
                    return seq;
                }
            }
        }
        inner.last_seq + 1
    }

    fn subject_for_seq(&self, seq: u64) -> Option<String> {
        self.load_msg(seq).ok().map(|m| m.subject)
    }

    fn num_pending(
        &self,
        from_seq: u64,
        filter: Option<&str>,
        last_per_subject: bool,
    ) -> (u64, u64) {
        if last_per_subject {
            let filters = match filter {
                Some(f) => vec![f.to_string()],
                None => vec![WILDCARD_ALL.to_string()],
            };
            let lasts = self.multi_last_seqs(&filters, 0);
            let count = lasts.iter().filter(|s| **s >= from_seq).count() as u64;
            return (count, self.fast_state().last_seq);
        }
        let inner = self.inner.lock();
        let start = from_seq.max(inner.first_seq);
        let mut count = 0;
        for seq in start..=inner.last_seq {
            let idx = (seq - inner.first_seq) as usize;
            if let Some(Some(msg)) = inner.log.get(idx) {
                if Self::matches(msg, filter) {
                    count += 1;
                }
            }
        }
        (count, inner.last_seq)
    }

    fn multi_last_seqs(&self, filters: &[String], up_to: u64) -> Vec<u64> {
        let inner = self.inner.lock();
        let cap = if up_to == 0 { inner.last_seq } else { up_to.min(inner.last_seq) };
        let mut last_by_subject: std::collections::HashMap<&str, u64> =
            std::collections::HashMap::new();
        for seq in inner.first_seq..=cap {
            let idx = (seq - inner.first_seq) as usize;
            if let Some(Some(msg)) = inner.log.get(idx) {
                if filters.iter().any(|f| subject::subject_matches(f, &msg.subject)) {
                    last_by_subject.insert(msg.subject.as_str(), seq);
                }
            }
        }
        let mut seqs: Vec<u64> = last_by_subject.into_values().collect();
        seqs.sort_unstable();
        seqs
    }
}

const WILDCARD_ALL: &str = ">";
