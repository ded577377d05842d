//! Consumer cursor state: delivery sequences, ack floors, pending table,
//! redelivery bookkeeping.
//!
//! This is the pure state machine with no concurrency primitives; the
//! consumer owns it behind its lock and operates on it sequentially.
//!
//! Tracked per consumer:
//! - `stream_seq` / `deliver_seq`: the NEXT stream / delivery sequence
//! - ack floors: highest contiguous acked (delivery, stream) sequences
//! - pending: delivered but not yet acked, keyed by stream sequence
//! - redeliver: FIFO of sequences awaiting re-send (O(1) membership)

use std::collections::{HashMap, VecDeque};

use hashlink::LinkedHashSet;
use serde::{Deserialize, Serialize};

use crate::consumer::config::{AckPolicy, ConsumerConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub deliver_seq: u64,
    pub timestamp_ns: i64,
}

/// Persistent cursor. This is what the consumer store writes and what a
/// replica rebuilds from committed delivery-state updates.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsumerCursor {
    /// Next stream sequence to deliver. May jump over filtered gaps.
    pub stream_seq: u64,
    /// Next consumer delivery sequence.
    pub deliver_seq: u64,
    /// Contiguous-acked high-water marks.
    pub ack_floor: SequencePair,
    pub pending: HashMap<u64, PendingDelivery>,
    /// Total delivery count per stream sequence, present once > 1.
    pub redelivery_count: HashMap<u64, u64>,
}

impl ConsumerCursor {
    pub fn starting_at(stream_seq: u64) -> Self {
        Self {
            stream_seq,
            deliver_seq: 1,
            ack_floor: SequencePair {
                consumer_seq: 0,
                stream_seq: stream_seq.saturating_sub(1),
            },
            pending: HashMap::new(),
            redelivery_count: HashMap::new(),
        }
    }

    pub fn num_ack_pending(&self) -> usize {
        self.pending.len()
    }

    /// Replica-side apply of a committed delivered-state update. The leader
    /// uses the same transition so both sides stay in lockstep.
    pub fn apply_delivered(&mut self, dseq: u64, sseq: u64, dc: u64, ts_ns: i64, ack: AckPolicy) {
        if dseq + 1 > self.deliver_seq {
            self.deliver_seq = dseq + 1;
        }
        if sseq + 1 > self.stream_seq {
            self.stream_seq = sseq + 1;
        }
        if ack == AckPolicy::None {
            self.ack_floor = SequencePair {
                consumer_seq: dseq,
                stream_seq: sseq,
            };
            return;
        }
        // A zero delivery sequence in pending is invalid and never stored.
        if dseq == 0 {
            tracing::warn!("Refusing pending entry with zero delivery sequence (sseq={})", sseq);
            return;
        }
        self.pending.insert(
            sseq,
            PendingDelivery {
                deliver_seq: dseq,
                timestamp_ns: ts_ns,
            },
        );
        if dc > 1 {
            self.redelivery_count.insert(sseq, dc);
        }
    }

    /// Remove an acked entry and advance floors contiguously. Idempotent:
    /// re-acking returns false and moves nothing.
    pub fn apply_ack(&mut self, dseq: u64, sseq: u64) -> bool {
        let entry = match self.pending.remove(&sseq) {
            Some(p) => p,
            None => return false,
        };
        self.redelivery_count.remove(&sseq);
        if self.pending.is_empty() {
            self.ack_floor = SequencePair {
                consumer_seq: self.deliver_seq.saturating_sub(1),
                stream_seq: self.stream_seq.saturating_sub(1),
            };
            return true;
        }
        let acked_dseq = if entry.deliver_seq > 0 { entry.deliver_seq } else { dseq };
        if acked_dseq == self.ack_floor.consumer_seq + 1 {
            self.ack_floor = SequencePair {
                consumer_seq: acked_dseq,
                stream_seq: sseq,
            };
            // Walk forward to the next still-pending entry; every stream
            // sequence below it is acked (or was never delivered).
            for ss in sseq + 1..self.stream_seq {
                if let Some(p) = self.pending.get(&ss) {
                    if p.deliver_seq > 0 {
                        self.ack_floor = SequencePair {
                            consumer_seq: p.deliver_seq - 1,
                            stream_seq: ss - 1,
                        };
                    }
                    break;
                }
            }
        }
        true
    }

    /// Cumulative ack: everything at or below (dseq, sseq) is acked.
    /// Walks whichever is shorter: the sequence range or the pending map.
    /// Returns the stream sequences that actually left pending.
    pub fn apply_ack_all(&mut self, dseq: u64, sseq: u64) -> Vec<u64> {
        let from = self.ack_floor.stream_seq + 1;
        self.ack_floor = SequencePair {
            consumer_seq: dseq,
            stream_seq: sseq,
        };
        let mut removed = Vec::new();
        let range_len = sseq.saturating_sub(from) + 1;
        if range_len < self.pending.len() as u64 {
            for ss in from..=sseq {
                if self.pending.remove(&ss).is_some() {
                    removed.push(ss);
                }
                self.redelivery_count.remove(&ss);
            }
        } else {
            removed = self.pending.keys().copied().filter(|k| *k <= sseq).collect();
            removed.sort_unstable();
            for k in &removed {
                self.pending.remove(k);
            }
            self.redelivery_count.retain(|k, _| *k > sseq);
        }
        if self.pending.is_empty() {
            self.ack_floor = SequencePair {
                consumer_seq: self.deliver_seq.saturating_sub(1),
                stream_seq: self.stream_seq.saturating_sub(1),
            };
        }
        removed
    }
}

// ==========================================
// DELIVERY STATE (leader-side working set)
// ==========================================

/// Skip list for `last_per_subject` warmup: the per-subject last sequences
/// are served first, then the cursor resumes past the snapshot point.
#[derive(Clone, Debug)]
pub struct SkipList {
    pub seqs: VecDeque<u64>,
    pub resume: u64,
}

impl SkipList {
    pub fn new(seqs: Vec<u64>, resume: u64) -> Self {
        Self {
            seqs: seqs.into(),
            resume,
        }
    }
}

/// The leader's working state: persistent cursor plus volatile redelivery
/// scheduling and cached num-pending accounting.
#[derive(Debug, Default)]
pub struct DeliveryState {
    pub cursor: ConsumerCursor,
    /// Redelivery FIFO. Insertion order is delivery order; membership is
    /// O(1), and a sequence appears at most once.
    pub redeliver: LinkedHashSet<u64>,
    pub skip_list: Option<SkipList>,
    /// Incremental scan cursor for interest/workqueue retention cleanup.
    pub check_floor: u64,
    /// Cached count of matching stream messages not yet delivered, and the
    /// stream sequence the count was computed at.
    pub num_pending: u64,
    pub num_pending_floor: u64,
}

impl DeliveryState {
    pub fn new(cursor: ConsumerCursor) -> Self {
        Self {
            cursor,
            ..Default::default()
        }
    }

    // --- Redelivery queue ---

    pub fn add_redeliver(&mut self, seqs: &[u64]) {
        for seq in seqs {
            self.redeliver.insert(*seq);
        }
    }

    pub fn pop_redeliver(&mut self) -> Option<u64> {
        self.redeliver.pop_front()
    }

    pub fn queued_for_redelivery(&self, seq: u64) -> bool {
        self.redeliver.contains(&seq)
    }

    pub fn remove_redeliver(&mut self, seq: u64) -> bool {
        self.redeliver.remove(&seq)
    }

    // --- Delivery counters ---

    /// Deliveries so far for `seq` (1 once delivered, no entry kept until
    /// the first redelivery).
    pub fn delivery_count(&self, seq: u64) -> u64 {
        self.cursor.redelivery_count.get(&seq).copied().unwrap_or(1)
    }

    pub fn inc_delivery_count(&mut self, seq: u64) -> u64 {
        let e = self.cursor.redelivery_count.entry(seq).or_insert(1);
        *e += 1;
        *e
    }

    /// Saturates: a count already at the floor is removed, never wrapped.
    pub fn dec_delivery_count(&mut self, seq: u64) {
        match self.cursor.redelivery_count.get_mut(&seq) {
            Some(e) if *e > 2 => *e -= 1,
            Some(_) => {
                self.cursor.redelivery_count.remove(&seq);
            }
            None => {}
        }
    }

    /// Whether one more delivery of `seq` would exceed the limit.
    pub fn max_deliver_reached(&self, seq: u64, max_deliver: i64) -> bool {
        max_deliver > 0 && self.delivery_count(seq) >= max_deliver as u64
    }

    // --- Delivery registration ---

    /// Assign the next delivery sequence for `sseq` and record it pending
    /// (or advance floors directly under ack-none).
    pub fn register_delivery(
        &mut self,
        sseq: u64,
        ts_ns: i64,
        ack: AckPolicy,
        redelivery: bool,
    ) -> (u64, u64) {
        let dseq = self.cursor.deliver_seq;
        let dc = if redelivery {
            self.inc_delivery_count(sseq)
        } else {
            1
        };
        self.cursor.deliver_seq = dseq + 1;
        if !redelivery {
            self.cursor.stream_seq = sseq + 1;
        }
        match ack {
            AckPolicy::None => {
                self.cursor.ack_floor = SequencePair {
                    consumer_seq: dseq,
                    stream_seq: self.cursor.stream_seq - 1,
                };
            }
            _ => {
                self.cursor.pending.insert(
                    sseq,
                    PendingDelivery {
                        deliver_seq: dseq,
                        timestamp_ns: ts_ns,
                    },
                );
                if dc > 1 {
                    self.cursor.redelivery_count.insert(sseq, dc);
                }
            }
        }
        (dseq, dc)
    }

    // --- Ack-side transitions ---

    pub fn process_ack(&mut self, dseq: u64, sseq: u64) -> bool {
        let acked = self.cursor.apply_ack(dseq, sseq);
        if acked {
            self.remove_redeliver(sseq);
        }
        acked
    }

    pub fn process_ack_all(&mut self, dseq: u64, sseq: u64) -> Vec<u64> {
        let removed = self.cursor.apply_ack_all(dseq, sseq);
        let drop: Vec<u64> = self
            .redeliver
            .iter()
            .copied()
            .filter(|s| *s <= sseq)
            .collect();
        for seq in drop {
            self.redeliver.remove(&seq);
        }
        removed
    }

    /// Reset the pending clock so the ack-wait timer elects `sseq` exactly
    /// `delay` from now. No delay means immediate redelivery.
    pub fn process_nak(
        &mut self,
        sseq: u64,
        now_ns: i64,
        ack_wait_ns: i64,
        delay_ns: Option<i64>,
    ) -> bool {
        match delay_ns {
            Some(delay) => match self.cursor.pending.get_mut(&sseq) {
                Some(p) => {
                    p.timestamp_ns = now_ns - ack_wait_ns + delay;
                    self.remove_redeliver(sseq);
                    true
                }
                None => false,
            },
            None => {
                if self.cursor.pending.contains_key(&sseq) {
                    self.add_redeliver(&[sseq]);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Working-progress: push the ack deadline out by resetting the clock.
    pub fn process_progress(&mut self, sseq: u64, now_ns: i64) -> bool {
        match self.cursor.pending.get_mut(&sseq) {
            Some(p) => {
                p.timestamp_ns = now_ns;
                true
            }
            None => false,
        }
    }

    // --- Ack-wait expiry ---

    /// Walk pending, drop stale entries, promote expired ones to the
    /// redelivery queue (timestamps rebased so redelivery order equals the
    /// original delivery order), and report the next deadline.
    pub fn expire_pending(
        &mut self,
        now_ns: i64,
        cfg: &ConsumerConfig,
        stream_first_seq: u64,
    ) -> Option<i64> {
        let mut expired: Vec<u64> = Vec::new();
        let mut stale: Vec<u64> = Vec::new();
        let mut next: Option<i64> = None;

        for (&seq, p) in &self.cursor.pending {
            if seq <= self.cursor.ack_floor.stream_seq || seq < stream_first_seq {
                stale.push(seq);
                continue;
            }
            let dc = self.cursor.redelivery_count.get(&seq).copied().unwrap_or(1);
            // Entries AT the limit still get queued once: the delivery path
            // retires them with the delivery-exceeded advisory.
            if cfg.max_deliver > 0 && dc > cfg.max_deliver as u64 {
                continue;
            }
            let deadline = cfg.ack_deadline(dc).as_nanos() as i64;
            let elapsed = now_ns - p.timestamp_ns;
            if elapsed >= deadline {
                if !self.redeliver.contains(&seq) {
                    expired.push(seq);
                }
            } else {
                let remaining = deadline - elapsed;
                next = Some(next.map_or(remaining, |n: i64| n.min(remaining)));
            }
        }

        for seq in stale {
            self.cursor.pending.remove(&seq);
            self.cursor.redelivery_count.remove(&seq);
            self.remove_redeliver(seq);
        }
        if self.cursor.pending.is_empty() {
            self.cursor.ack_floor = SequencePair {
                consumer_seq: self.cursor.deliver_seq.saturating_sub(1),
                stream_seq: self.cursor.stream_seq.saturating_sub(1),
            };
        }

        if !expired.is_empty() {
            expired.sort_unstable();
            let off = now_ns - self.cursor.pending[&expired[0]].timestamp_ns;
            for &seq in &expired {
                if let Some(p) = self.cursor.pending.get_mut(&seq) {
                    p.timestamp_ns += off;
                }
            }
            self.add_redeliver(&expired);
        }
        next
    }

    // --- Num-pending cache ---

    pub fn set_num_pending(&mut self, count: u64, floor: u64) {
        self.num_pending = count;
        self.num_pending_floor = floor;
    }

    pub fn dec_num_pending(&mut self) {
        self.num_pending = self.num_pending.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn explicit_cfg() -> ConsumerConfig {
        let mut cfg = ConsumerConfig {
            durable_name: Some("t".to_string()),
            ack_wait: Duration::from_millis(100),
            ..Default::default()
        };
        cfg.max_ack_pending = 1000;
        cfg
    }

    fn deliver_n(state: &mut DeliveryState, n: u64) {
        for sseq in state.cursor.stream_seq..state.cursor.stream_seq + n {
            state.register_delivery(sseq, 0, AckPolicy::Explicit, false);
        }
    }

    fn invariants_hold(state: &DeliveryState) -> bool {
        let c = &state.cursor;
        if c.ack_floor.consumer_seq > c.deliver_seq.saturating_sub(1) {
            return false;
        }
        if c.ack_floor.stream_seq > c.stream_seq.saturating_sub(1) {
            return false;
        }
        for (seq, p) in &c.pending {
            if *seq >= c.stream_seq || *seq <= c.ack_floor.stream_seq {
                return false;
            }
            if p.deliver_seq > c.deliver_seq.saturating_sub(1) {
                return false;
            }
        }
        if c.pending.is_empty()
            && (c.ack_floor.consumer_seq != c.deliver_seq.saturating_sub(1)
                || c.ack_floor.stream_seq != c.stream_seq.saturating_sub(1))
        {
            return false;
        }
        true
    }

    #[test]
    fn test_roundtrip_deliver_then_ack_all_sequences() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        deliver_n(&mut state, 3);
        assert_eq!(state.cursor.num_ack_pending(), 3);
        for (dseq, sseq) in [(1, 1), (2, 2), (3, 3)] {
            assert!(state.process_ack(dseq, sseq));
            assert!(invariants_hold(&state));
        }
        assert_eq!(state.cursor.ack_floor, SequencePair { consumer_seq: 3, stream_seq: 3 });
        assert!(state.cursor.pending.is_empty());
    }

    #[test]
    fn test_ack_idempotent() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        deliver_n(&mut state, 2);
        assert!(state.process_ack(1, 1));
        let floor = state.cursor.ack_floor;
        assert!(!state.process_ack(1, 1));
        assert_eq!(state.cursor.ack_floor, floor);
        assert!(invariants_hold(&state));
    }

    #[test]
    fn test_floor_holds_at_gap_then_jumps() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        deliver_n(&mut state, 5);
        state.process_ack(1, 1);
        state.process_ack(3, 3);
        // Can't cross the hole at seq 2.
        assert_eq!(state.cursor.ack_floor.stream_seq, 1);
        state.process_ack(2, 2);
        // Jumps past 3 to just before the next pending entry (4).
        assert_eq!(state.cursor.ack_floor, SequencePair { consumer_seq: 3, stream_seq: 3 });
        assert!(invariants_hold(&state));
    }

    #[test]
    fn test_ack_all() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        deliver_n(&mut state, 10);
        state.process_ack_all(7, 7);
        assert_eq!(state.cursor.num_ack_pending(), 3);
        assert_eq!(state.cursor.ack_floor, SequencePair { consumer_seq: 7, stream_seq: 7 });
        assert!(invariants_hold(&state));
    }

    #[test]
    fn test_ack_none_advances_floors() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let (dseq, dc) = state.register_delivery(1, 0, AckPolicy::None, false);
        assert_eq!((dseq, dc), (1, 1));
        assert!(state.cursor.pending.is_empty());
        assert_eq!(state.cursor.ack_floor, SequencePair { consumer_seq: 1, stream_seq: 1 });
        assert!(invariants_hold(&state));
    }

    #[test]
    fn test_redeliver_queue_membership() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        deliver_n(&mut state, 3);
        state.add_redeliver(&[2, 3, 2]);
        assert!(state.queued_for_redelivery(2));
        assert_eq!(state.redeliver.len(), 2);
        assert_eq!(state.pop_redeliver(), Some(2));
        assert!(!state.queued_for_redelivery(2));
    }

    #[test]
    fn test_nak_delay_rewrites_clock() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let now = 1_000_000_000i64;
        state.register_delivery(1, now, AckPolicy::Explicit, false);
        let ack_wait = Duration::from_millis(100).as_nanos() as i64;
        let delay = Duration::from_millis(250).as_nanos() as i64;
        assert!(state.process_nak(1, now, ack_wait, Some(delay)));
        let p = state.cursor.pending[&1];
        // Timer math: deadline fires exactly `delay` from now.
        assert_eq!(p.timestamp_ns + ack_wait, now + delay);
    }

    #[test]
    fn test_expire_pending_rebases_in_order() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let cfg = explicit_cfg();
        let base = 1_000_000_000i64;
        state.register_delivery(1, base, AckPolicy::Explicit, false);
        state.register_delivery(2, base + 10, AckPolicy::Explicit, false);
        state.register_delivery(3, base + 20, AckPolicy::Explicit, false);

        let now = base + Duration::from_millis(150).as_nanos() as i64;
        let next = state.expire_pending(now, &cfg, 1);
        assert!(next.is_none());
        assert_eq!(state.redeliver.len(), 3);
        assert_eq!(state.pop_redeliver(), Some(1));
        // Rebase preserves relative order of the original delivery clocks.
        let t1 = state.cursor.pending[&1].timestamp_ns;
        let t2 = state.cursor.pending[&2].timestamp_ns;
        let t3 = state.cursor.pending[&3].timestamp_ns;
        assert!(t1 <= t2 && t2 <= t3);
        assert_eq!(t1, now);
    }

    #[test]
    fn test_expire_pending_reports_next_deadline() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let cfg = explicit_cfg();
        let base = 1_000_000_000i64;
        state.register_delivery(1, base, AckPolicy::Explicit, false);
        let now = base + Duration::from_millis(40).as_nanos() as i64;
        let next = state.expire_pending(now, &cfg, 1).unwrap();
        assert_eq!(next, Duration::from_millis(60).as_nanos() as i64);
        assert!(state.redeliver.is_empty());
    }

    #[test]
    fn test_backoff_deadline_by_delivery_count() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let mut cfg = explicit_cfg();
        cfg.backoff = vec![Duration::from_millis(50), Duration::from_millis(500)];
        cfg.ack_wait = cfg.backoff[0];
        let base = 1_000_000_000i64;
        state.register_delivery(1, base, AckPolicy::Explicit, false);
        state.inc_delivery_count(1); // second delivery -> second backoff step
        let now = base + Duration::from_millis(100).as_nanos() as i64;
        let next = state.expire_pending(now, &cfg, 1).unwrap();
        assert_eq!(next, Duration::from_millis(400).as_nanos() as i64);
    }

    #[test]
    fn test_expire_queues_at_max_deliver_once() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let mut cfg = explicit_cfg();
        cfg.max_deliver = 2;
        let base = 1_000_000_000i64;
        state.register_delivery(1, base, AckPolicy::Explicit, false);
        state.inc_delivery_count(1); // dc = 2 = max
        let now = base + Duration::from_secs(10).as_nanos() as i64;
        // At the limit the entry is queued one last time so the delivery
        // path can retire it with the exceeded advisory.
        assert!(state.expire_pending(now, &cfg, 1).is_none());
        assert!(state.queued_for_redelivery(1));
        // Beyond the limit it is ignored.
        state.inc_delivery_count(1);
        state.remove_redeliver(1);
        assert!(state.expire_pending(now, &cfg, 1).is_none());
        assert!(state.redeliver.is_empty());
    }

    #[test]
    fn test_dec_delivery_count_saturates() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        state.dec_delivery_count(9); // absent: no-op, no wrap
        state.inc_delivery_count(1);
        assert_eq!(state.delivery_count(1), 2);
        state.dec_delivery_count(1);
        assert_eq!(state.delivery_count(1), 1);
        state.dec_delivery_count(1);
        assert_eq!(state.delivery_count(1), 1);
    }

    #[test]
    fn test_stale_pending_dropped_below_stream_first_seq() {
        let mut state = DeliveryState::new(ConsumerCursor::starting_at(1));
        let cfg = explicit_cfg();
        deliver_n(&mut state, 2);
        // Stream got purged up to seq 5.
        let next = state.expire_pending(2_000_000_000, &cfg, 5);
        assert!(next.is_none());
        assert!(state.cursor.pending.is_empty());
        // Floors snap to the delivered edge once nothing is pending.
        assert_eq!(state.cursor.ack_floor.consumer_seq, state.cursor.deliver_seq - 1);
    }
}
