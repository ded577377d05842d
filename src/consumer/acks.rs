//! Ack pipeline and replication apply path
//!
//! Inbound ack-subject messages are classified and applied under the
//! consumer lock. Replicated consumers turn every floor movement into a
//! consensus proposal; the client's confirmation (and any buffered
//! delivery) is released only once the entry commits.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::advisory::AdvisoryEvent;
use crate::cluster::ConsumerOp;
use crate::consumer::ack::{AckOp, AckReply};
use crate::consumer::config::AckPolicy;
use crate::consumer::core::{AckIntake, Consumer, ConsumerInner, PullIntake};
use crate::stream::message::Envelope;
use crate::stream::stream::RetentionPolicy;
use crate::utils::utils_time::now_ns;

impl Consumer {
    pub(crate) fn handle_ack_intake(&self, intake: &AckIntake) {
        let ack = match AckReply::parse(&intake.subject) {
            Ok(a) => a,
            Err(e) => {
                debug!("[Consumer:{}] Dropping unparseable ack: {}", self.name(), e);
                return;
            }
        };
        let op = AckOp::parse(&intake.payload);
        let now = now_ns();
        let mut inline_next: Option<Bytes> = None;

        {
            let mut inner = self.inner.lock();
            if inner.closed || !self.is_leader() {
                return;
            }
            inner.last_activity_ns = now;
            match op {
                AckOp::Ack => {
                    self.process_positive_ack(&mut inner, &ack, &intake.reply, now);
                }
                AckOp::Next { body } => {
                    self.process_positive_ack(&mut inner, &ack, "", now);
                    inline_next = Some(body);
                }
                AckOp::Nak { delay } => {
                    self.process_nak_op(&mut inner, &ack, delay, now);
                }
                AckOp::Progress => {
                    if inner.state.process_progress(ack.stream_seq, now) {
                        debug!(
                            "[Consumer:{}] Progress on seq={}, ack clock reset",
                            self.name(),
                            ack.stream_seq
                        );
                    }
                }
                AckOp::Term { reason } => {
                    self.process_term(&mut inner, &ack, reason, &intake.reply, now);
                }
            }
        }

        // Acks free ack-pending slots and change timer deadlines.
        self.wake.notify_one();
        self.timer_wake.notify_one();

        // `+NXT` piggybacks a pull request on the ack reply subject.
        if let Some(body) = inline_next {
            self.handle_pull_intake(PullIntake {
                reply: intake.reply.clone(),
                body,
            });
        }
    }

    fn process_positive_ack(
        &self,
        inner: &mut ConsumerInner,
        ack: &AckReply,
        reply: &str,
        now: i64,
    ) {
        let sseq = ack.stream_seq;
        let dseq = ack.deliver_seq;
        match inner.cfg.ack_policy {
            AckPolicy::None => {}
            AckPolicy::Explicit => {
                if sseq >= inner.state.cursor.stream_seq {
                    warn!(
                        "[Consumer:{}] Ack for seq={} at or beyond delivered edge {} (stale leader?), refusing",
                        self.name(),
                        sseq,
                        inner.state.cursor.stream_seq
                    );
                    return;
                }
                if inner.state.process_ack(dseq, sseq) {
                    self.after_ack(inner, ack, reply, now, &[sseq]);
                } else if !reply.is_empty() && self.responds_in_place(inner) {
                    // Already acked: idempotent, but the client still gets
                    // its confirmation.
                    self.send_envelope(Envelope::status(reply.to_string(), 200, ""));
                }
            }
            AckPolicy::All => {
                let removed = inner.state.process_ack_all(dseq, sseq);
                self.after_ack(inner, ack, reply, now, &removed);
            }
        }
    }

    /// Everything that follows a successful floor movement: sampling,
    /// replication or store write-through, client confirmation, retention
    /// ack-back.
    fn after_ack(
        &self,
        inner: &mut ConsumerInner,
        ack: &AckReply,
        reply: &str,
        now: i64,
        removed: &[u64],
    ) {
        if inner.cfg.sample_freq > 0 {
            let roll = Uuid::new_v4().as_bytes()[15] % 100;
            if roll < inner.cfg.sample_freq {
                self.publish_advisory(
                    "ACK_SAMPLE",
                    AdvisoryEvent::AckSample {
                        stream: self.stream_name().to_string(),
                        consumer: self.name().to_string(),
                        consumer_seq: ack.deliver_seq,
                        stream_seq: ack.stream_seq,
                        deliveries: ack.delivery_count,
                        ack_time_ns: now - ack.timestamp_ns,
                    },
                );
            }
        }

        if self.node.is_some() {
            inner.pending_proposals.push(
                ConsumerOp::Ack {
                    deliver_seq: ack.deliver_seq,
                    stream_seq: ack.stream_seq,
                }
                .encode(),
            );
            self.proposal_wake.notify_one();
            if !reply.is_empty() {
                if self.responds_in_place(inner) {
                    self.send_envelope(Envelope::status(reply.to_string(), 200, ""));
                } else {
                    // Confirmation waits for the proposal to commit.
                    inner.ack_replies.insert(ack.stream_seq, reply.to_string());
                }
            }
        } else {
            let res = match inner.cfg.ack_policy {
                AckPolicy::All => self.store.update(&inner.state.cursor),
                _ => self.store.update_acks(ack.deliver_seq, ack.stream_seq),
            };
            if let Err(e) = res {
                warn!(
                    "[Consumer:{}] Ack-state write failed (will retry on next change): {}",
                    self.name(),
                    e
                );
            }
            if !reply.is_empty() {
                self.send_envelope(Envelope::status(reply.to_string(), 200, ""));
            }
        }

        if self.retention != RetentionPolicy::Limits {
            for seq in removed {
                let _ = self.stream_acks.send(*seq);
            }
        }
    }

    /// Replicated consumers over limits retention still answer in place;
    /// only interest/workqueue retention waits for the commit.
    fn responds_in_place(&self, _inner: &ConsumerInner) -> bool {
        self.node.is_none() || self.retention == RetentionPolicy::Limits
    }

    fn process_nak_op(
        &self,
        inner: &mut ConsumerInner,
        ack: &AckReply,
        delay: Option<std::time::Duration>,
        now: i64,
    ) {
        let sseq = ack.stream_seq;
        let entry = match inner.state.cursor.pending.get(&sseq) {
            Some(p) => *p,
            None => return,
        };
        if ack.deliver_seq > 0 && entry.deliver_seq != ack.deliver_seq {
            // A redelivery already superseded the naked one.
            return;
        }
        let dc = inner.state.delivery_count(sseq);
        let ack_wait_ns = inner.cfg.ack_wait.as_nanos() as i64;
        inner
            .state
            .process_nak(sseq, now, ack_wait_ns, delay.map(|d| d.as_nanos() as i64));
        self.publish_advisory(
            "MSG_NAKED",
            AdvisoryEvent::Nak {
                stream: self.stream_name().to_string(),
                consumer: self.name().to_string(),
                consumer_seq: entry.deliver_seq,
                stream_seq: sseq,
                deliveries: dc,
            },
        );
    }

    /// Terminate: suppress further redelivery as if acked, and advertise
    /// why.
    fn process_term(
        &self,
        inner: &mut ConsumerInner,
        ack: &AckReply,
        reason: String,
        reply: &str,
        now: i64,
    ) {
        let sseq = ack.stream_seq;
        let dc = inner.state.delivery_count(sseq);
        let dseq = inner
            .state
            .cursor
            .pending
            .get(&sseq)
            .map(|p| p.deliver_seq)
            .unwrap_or(ack.deliver_seq);
        if inner.state.process_ack(dseq, sseq) {
            self.publish_advisory(
                "MSG_TERMINATED",
                AdvisoryEvent::Terminated {
                    stream: self.stream_name().to_string(),
                    consumer: self.name().to_string(),
                    consumer_seq: dseq,
                    stream_seq: sseq,
                    deliveries: dc,
                    reason,
                },
            );
            self.after_ack(inner, ack, reply, now, &[sseq]);
        }
    }

    // ==========================================
    // REPLICATION APPLY
    // ==========================================

    /// Apply a committed consensus entry. On the leader this releases
    /// buffered deliveries and held ack confirmations; on a replica it
    /// keeps the persisted cursor in lockstep.
    pub fn apply_committed(&self, entry: &Bytes) {
        let op = match ConsumerOp::parse(entry) {
            Ok(op) => op,
            Err(e) => {
                warn!("[Consumer:{}] Unparseable committed entry: {}", self.name(), e);
                return;
            }
        };
        match op {
            ConsumerOp::Delivered {
                deliver_seq,
                stream_seq,
                delivery_count,
                timestamp_ns,
            } => {
                if let Err(e) =
                    self.store
                        .update_delivered(deliver_seq, stream_seq, delivery_count, timestamp_ns)
                {
                    warn!("[Consumer:{}] Committed delivered write failed: {}", self.name(), e);
                }
                if self.is_leader() {
                    self.release_buffered_delivery(stream_seq);
                }
            }
            ConsumerOp::Ack {
                deliver_seq,
                stream_seq,
            } => {
                if let Err(e) = self.store.update_acks(deliver_seq, stream_seq) {
                    warn!("[Consumer:{}] Committed ack write failed: {}", self.name(), e);
                }
                if self.is_leader() {
                    let reply = self.inner.lock().ack_replies.remove(&stream_seq);
                    if let Some(reply) = reply {
                        self.send_envelope(Envelope::status(reply, 200, ""));
                    }
                }
            }
            ConsumerOp::Skip { stream_seq } => {
                if !self.is_leader() {
                    if let Ok(mut cursor) = self.store.state() {
                        if stream_seq > cursor.stream_seq {
                            cursor.stream_seq = stream_seq;
                            if let Err(e) = self.store.update(&cursor) {
                                warn!(
                                    "[Consumer:{}] Committed skip write failed: {}",
                                    self.name(),
                                    e
                                );
                            }
                        }
                    }
                }
            }
            ConsumerOp::Delete => {
                if let Some(me) = self.owning_handle() {
                    tokio::spawn(async move {
                        me.delete().await;
                    });
                }
            }
        }
    }

    /// A delivered-state update reached quorum: the parked envelope may
    /// finally touch the wire. A request that timed out in the meantime
    /// gets its deferred timeout right after.
    fn release_buffered_delivery(&self, stream_seq: u64) {
        let (env, deferred) = {
            let mut inner = self.inner.lock();
            match inner.pending_deliveries.remove(&stream_seq) {
                Some(env) => {
                    inner.waiting_deliveries.remove(&env.deliver_to);
                    let deferred = inner.deferred_timeouts.remove(&env.deliver_to);
                    (Some(env), deferred)
                }
                None => (None, None),
            }
        };
        if let Some(env) = env {
            self.send_envelope(env);
        }
        if let Some(timeout) = deferred {
            self.send_envelope(timeout);
        }
    }
}
