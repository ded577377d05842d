//! Delivery loop internals
//!
//! Message selection (redeliveries first, then the skip list, then the
//! store scan), pull-waiter dispatch with priority groups, flow control,
//! replay/rate pacing, and the consolidated timer pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisory::AdvisoryEvent;
use crate::cluster::ConsumerOp;
use crate::config::Config;
use crate::consumer::ack::AckReply;
use crate::consumer::config::{AckPolicy, PriorityPolicy, ReplayPolicy};
use crate::consumer::core::{Consumer, ConsumerInner, NextMsgError, PullIntake};
use crate::consumer::waiting::{NextRequest, WaitingRequest};
use crate::stream::message::{
    append_header, Envelope, StatusHeaders, HDR_CONSUMER_STALLED, HDR_LAST_CONSUMER,
    HDR_LAST_STREAM, HDR_MSG_SIZE, HDR_PIN_ID, STATUS_BAD_REQUEST, STATUS_BATCH_COMPLETED,
    STATUS_CONSUMER_DELETED, STATUS_CONSUMER_IS_PUSH, STATUS_INTEREST_EXPIRED,
    STATUS_MAX_REQUEST_BATCH, STATUS_MAX_REQUEST_EXPIRES, STATUS_MAX_REQUEST_MAX_BYTES,
    STATUS_MAX_WAITING, STATUS_MSG_SIZE_EXCEEDS, STATUS_NO_MESSAGES, STATUS_REQUEST_TIMEOUT,
    STATUS_WRONG_PIN_ID,
};
use crate::stream::store::StoreError;
use crate::stream::stream::RetentionPolicy;
use crate::stream::StoredMessage;
use crate::utils::utils_time::now_ns;

pub(crate) struct NextMsg {
    pub msg: StoredMessage,
    pub source: NextSource,
}

#[derive(Clone, Copy, PartialEq)]
pub(crate) enum NextSource {
    Fresh,
    Redeliver,
    SkipList,
}

pub(crate) enum DeliverOutcome {
    Delivered,
    /// Pacing pushed the send into the future; nothing was consumed.
    Paced,
    /// No waiter would take the message; nothing was consumed.
    NoWaiter,
}

impl Consumer {
    // ==========================================
    // MESSAGE SELECTION
    // ==========================================

    /// Pick the next message without consuming it: redeliveries first, then
    /// the last-per-subject warmup list, then a store scan from the cursor.
    /// Consumption (queue pops, cursor advance) happens at dispatch so a
    /// failed waiter selection never loses a message.
    pub(crate) fn get_next_msg(
        &self,
        inner: &mut ConsumerInner,
    ) -> Result<NextMsg, NextMsgError> {
        loop {
            // Redeliveries first.
            if let Some(&seq) = inner.state.redeliver.front() {
                if inner.state.max_deliver_reached(seq, inner.cfg.max_deliver) {
                    inner.state.pop_redeliver();
                    self.handle_max_deliver_exceeded(inner, seq);
                    continue;
                }
                match self.msgs.load_msg(seq) {
                    Ok(msg) => {
                        return Ok(NextMsg {
                            msg,
                            source: NextSource::Redeliver,
                        })
                    }
                    Err(StoreError::NotFound) | Err(StoreError::Deleted) => {
                        // Raced a term or purge; quietly forget it.
                        inner.state.pop_redeliver();
                        inner.state.cursor.pending.remove(&seq);
                        inner.state.cursor.redelivery_count.remove(&seq);
                        self.snap_floors_if_idle(inner);
                        continue;
                    }
                    Err(e) => return Err(NextMsgError::Store(e)),
                }
            }

            // Ack-pending ceiling stalls fresh deliveries.
            if inner.cfg.ack_policy != AckPolicy::None
                && inner.cfg.max_ack_pending > 0
                && inner.state.cursor.pending.len() >= inner.cfg.max_ack_pending
            {
                return Err(NextMsgError::MaxAckPending);
            }

            // last_per_subject warmup.
            let mut warmup_done = false;
            if let Some(sl) = inner.state.skip_list.as_mut() {
                match sl.seqs.front().copied() {
                    Some(seq) => match self.msgs.load_msg(seq) {
                        Ok(msg) => {
                            return Ok(NextMsg {
                                msg,
                                source: NextSource::SkipList,
                            })
                        }
                        Err(StoreError::NotFound) | Err(StoreError::Deleted) => {
                            sl.seqs.pop_front();
                            continue;
                        }
                        Err(e) => return Err(NextMsgError::Store(e)),
                    },
                    None => warmup_done = true,
                }
            }
            if warmup_done {
                let resume = inner.state.skip_list.take().map(|sl| sl.resume).unwrap_or(0);
                if resume + 1 > inner.state.cursor.stream_seq {
                    inner.state.cursor.stream_seq = resume + 1;
                }
                continue;
            }

            // Store scan from the cursor, filtered.
            let from = inner.state.cursor.stream_seq.max(1);
            let filters = inner.cfg.filters();
            let res = match filters.len() {
                0 => self.msgs.load_next_msg(None, from),
                1 => self.msgs.load_next_msg(Some(&filters[0]), from),
                _ => self.msgs.load_next_msg_multi(&filters, from),
            };
            return match res {
                Ok(msg) => Ok(NextMsg {
                    msg,
                    source: NextSource::Fresh,
                }),
                Err(StoreError::Eof { last_seq }) => {
                    // The scan ran off the end; jump the cursor over the gap
                    // and let replicas follow.
                    if last_seq + 1 > inner.state.cursor.stream_seq {
                        inner.state.cursor.stream_seq = last_seq + 1;
                        if self.node.is_some() {
                            inner.pending_proposals.push(
                                ConsumerOp::Skip {
                                    stream_seq: last_seq + 1,
                                }
                                .encode(),
                            );
                            self.proposal_wake.notify_one();
                        }
                    }
                    Err(NextMsgError::NoMessages)
                }
                Err(e) => Err(NextMsgError::Store(e)),
            };
        }
    }

    /// One advisory exactly when the limit is hit; the entry leaves pending
    /// as if acked by the limit. Later hits drop silently.
    fn handle_max_deliver_exceeded(&self, inner: &mut ConsumerInner, seq: u64) {
        let dc = inner.state.delivery_count(seq);
        if inner.state.cursor.pending.remove(&seq).is_none() {
            return;
        }
        self.snap_floors_if_idle(inner);
        self.publish_advisory(
            "MAX_DELIVERIES",
            AdvisoryEvent::MaxDeliver {
                stream: self.stream_name().to_string(),
                consumer: self.name().to_string(),
                stream_seq: seq,
                deliveries: dc,
            },
        );
        if self.retention != RetentionPolicy::Limits {
            let _ = self.stream_acks.send(seq);
        }
    }

    fn snap_floors_if_idle(&self, inner: &mut ConsumerInner) {
        if inner.state.cursor.pending.is_empty() {
            let c = &mut inner.state.cursor;
            c.ack_floor.consumer_seq = c.deliver_seq.saturating_sub(1);
            c.ack_floor.stream_seq = c.stream_seq.saturating_sub(1);
        }
    }

    // ==========================================
    // DISPATCH
    // ==========================================

    pub(crate) fn deliver_msg(
        &self,
        inner: &mut ConsumerInner,
        next: NextMsg,
        now: i64,
    ) -> DeliverOutcome {
        let msg = &next.msg;
        let msg_size = msg.payload.len() + msg.headers.as_ref().map(|h| h.len()).unwrap_or(0);

        // Replay pacing: in original mode keep the inter-message spacing of
        // the stream.
        if inner.cfg.replay_policy == ReplayPolicy::Original && inner.last_msg_ts_ns > 0 {
            let delta = msg.timestamp_ns - inner.last_msg_ts_ns;
            if delta > 0 {
                let due = inner.last_send_ns + delta;
                if now < due {
                    inner.deliver_not_before_ns = due;
                    return DeliverOutcome::Paced;
                }
            }
        }

        // Destination: push subject or an eligible pull waiter.
        let (deliver_to, pin_header) = if inner.cfg.is_pull_mode() {
            match self.next_waiting(inner, msg_size, now) {
                Some(target) => target,
                None => return DeliverOutcome::NoWaiter,
            }
        } else {
            match inner.cfg.deliver_subject.clone() {
                Some(ds) => (ds, None),
                None => return DeliverOutcome::NoWaiter,
            }
        };

        // Point of no return: consume provenance and assign sequences.
        let redelivery = next.source == NextSource::Redeliver;
        match next.source {
            NextSource::Redeliver => {
                inner.state.pop_redeliver();
            }
            NextSource::SkipList => {
                if let Some(sl) = inner.state.skip_list.as_mut() {
                    sl.seqs.pop_front();
                }
            }
            NextSource::Fresh => {}
        }
        let (dseq, dc) =
            inner
                .state
                .register_delivery(msg.seq, now, inner.cfg.ack_policy, redelivery);
        if !redelivery {
            inner.state.dec_num_pending();
        }

        let reply = AckReply {
            stream: self.stream_name().to_string(),
            consumer: self.name().to_string(),
            delivery_count: dc,
            stream_seq: msg.seq,
            deliver_seq: dseq,
            timestamp_ns: now,
            pending: inner.state.num_pending,
        }
        .encode();

        let mut headers = msg.headers.clone();
        let mut payload = msg.payload.clone();
        if inner.cfg.headers_only {
            headers = Some(append_header(
                headers.as_ref(),
                HDR_MSG_SIZE,
                &payload.len().to_string(),
            ));
            payload = Bytes::new();
        }
        if let Some(pin) = &pin_header {
            headers = Some(append_header(headers.as_ref(), HDR_PIN_ID, pin));
        }

        let env = Envelope {
            deliver_to,
            subject: msg.subject.clone(),
            reply,
            headers,
            payload,
        };
        let wire_len = env.wire_len();

        // Delivered-state update goes through the consensus log when
        // replicated, straight to the store otherwise.
        let replicated = self.node.is_some();
        if replicated {
            inner.pending_proposals.push(
                ConsumerOp::Delivered {
                    deliver_seq: dseq,
                    stream_seq: msg.seq,
                    delivery_count: dc,
                    timestamp_ns: now,
                }
                .encode(),
            );
            self.proposal_wake.notify_one();
        } else if let Err(e) = self.store.update_delivered(dseq, msg.seq, dc, now) {
            warn!(
                "[Consumer:{}] Delivered-state write failed (will retry on next change): {}",
                self.name(),
                e
            );
        }

        // Quorum gate: with acks on and flow control off, the envelope is
        // parked until the delivered-state commits.
        if replicated && inner.cfg.ack_policy != AckPolicy::None && !inner.cfg.flow_control {
            inner
                .waiting_deliveries
                .insert(env.deliver_to.clone(), msg.seq);
            inner.pending_deliveries.insert(msg.seq, env);
        } else {
            if !inner.cfg.is_pull_mode() && inner.cfg.flow_control {
                inner.pbytes += wire_len as i64;
            }
            self.send_envelope(env);
        }

        // Under ack-none the stream can reclaim immediately.
        if inner.cfg.ack_policy == AckPolicy::None && self.retention != RetentionPolicy::Limits {
            let _ = self.stream_acks.send(msg.seq);
        }

        inner.last_msg_ts_ns = msg.timestamp_ns;
        inner.last_send_ns = now;
        if inner.cfg.rate_limit_bps > 0 {
            let ns = (wire_len as u64)
                .saturating_mul(8)
                .saturating_mul(1_000_000_000)
                / inner.cfg.rate_limit_bps;
            inner.deliver_not_before_ns = now + ns as i64;
        }

        self.timer_wake.notify_one();
        DeliverOutcome::Delivered
    }

    // ==========================================
    // PULL WAITER SELECTION
    // ==========================================

    /// Walk the wait queue at most one full cycle and pick the request this
    /// message goes to, applying byte budgets, expiry, pin / overflow
    /// gating, and interest checks along the way.
    fn next_waiting(
        &self,
        inner: &mut ConsumerInner,
        msg_size: usize,
        now: i64,
    ) -> Option<(String, Option<String>)> {
        let grace_ns =
            Duration::from_millis(Config::global().consumer.gateway_grace_ms).as_nanos() as i64;
        let mut rotations = inner.waiting.len();
        while rotations > 0 && !inner.waiting.is_empty() {
            rotations -= 1;

            // Byte budget.
            let over_budget = {
                let wr = inner.waiting.front()?;
                wr.over_byte_budget(msg_size)
            };
            if over_budget {
                let wr = inner.waiting.pop_front()?;
                let status = if wr.delivered > 0 {
                    STATUS_BATCH_COMPLETED
                } else {
                    STATUS_MSG_SIZE_EXCEEDS
                };
                self.send_request_status(&wr, status);
                continue;
            }

            // Expiry. With a replicated delivery still in flight for this
            // reply the timeout is deferred until that delivery commits.
            let expired = inner.waiting.front()?.expired(now);
            if expired {
                let wr = inner.waiting.pop_front()?;
                self.close_expired_request(inner, wr);
                continue;
            }

            // Pinned-client gating.
            let mut pin_header = None;
            if inner.cfg.priority_policy == PriorityPolicy::PinnedClient {
                let req_id = inner
                    .waiting
                    .front()?
                    .group
                    .as_ref()
                    .map(|g| g.id.clone())
                    .unwrap_or_default();
                match inner.pin_id.clone() {
                    None => {
                        // First valid waiter becomes the pin.
                        let pin = Uuid::new_v4().simple().to_string();
                        inner.pin_id = Some(pin.clone());
                        inner.pin_since_ns = now;
                        let group = inner
                            .waiting
                            .front()
                            .and_then(|wr| wr.group.as_ref().map(|g| g.group.clone()))
                            .unwrap_or_default();
                        self.publish_advisory(
                            "PINNED",
                            AdvisoryEvent::Pinned {
                                stream: self.stream_name().to_string(),
                                consumer: self.name().to_string(),
                                group,
                                pinned_id: pin.clone(),
                            },
                        );
                        pin_header = Some(pin);
                    }
                    Some(pin) if req_id == pin => {
                        inner.pin_since_ns = now;
                        pin_header = Some(pin);
                    }
                    Some(_) if req_id.is_empty() => {
                        inner.waiting.cycle();
                        continue;
                    }
                    Some(_) => {
                        let wr = inner.waiting.pop_front()?;
                        self.send_request_status(&wr, STATUS_WRONG_PIN_ID);
                        continue;
                    }
                }
            }

            // Overflow gating: only serve once the backlog thresholds hold.
            if inner.cfg.priority_policy == PriorityPolicy::Overflow {
                let (min_pending, min_ack_pending) = inner
                    .waiting
                    .front()?
                    .group
                    .as_ref()
                    .map(|g| (g.min_pending, g.min_ack_pending))
                    .unwrap_or((0, 0));
                // Selection runs before the dispatch decrements num_pending,
                // so the message in hand is still counted.
                let pending_ok = min_pending == 0 || min_pending <= inner.state.num_pending;
                let ack_ok = min_ack_pending == 0
                    || min_ack_pending <= inner.state.cursor.pending.len() as u64;
                if !pending_ok || !ack_ok {
                    inner.waiting.cycle();
                    continue;
                }
            }

            // Interest: local interest, a fresh request inside the gateway
            // grace window, or a reply-only request all qualify.
            {
                let wr = inner.waiting.front()?;
                let fresh = now - wr.received_ns < grace_ns;
                if !self.interest.has_interest(&wr.interest) && !fresh {
                    if wr.interest != wr.reply {
                        let wr = inner.waiting.pop_front()?;
                        self.send_request_status(&wr, STATUS_INTEREST_EXPIRED);
                        continue;
                    }
                }
            }

            // Serve the front request.
            let wr = inner.waiting.front_mut()?;
            wr.record_delivery(msg_size);
            if wr.hb_interval_ns > 0 {
                wr.hb_next_ns = now + wr.hb_interval_ns;
            }
            let reply = wr.reply.clone();
            if wr.done() {
                inner.waiting.pop_front();
            }
            return Some((reply, pin_header));
        }
        None
    }

    fn close_expired_request(&self, inner: &mut ConsumerInner, wr: WaitingRequest) {
        if self.node.is_some() && inner.waiting_deliveries.contains_key(&wr.reply) {
            let env = self.request_status_envelope(&wr, STATUS_REQUEST_TIMEOUT);
            inner.deferred_timeouts.insert(wr.reply.clone(), env);
        } else {
            self.send_request_status(&wr, STATUS_REQUEST_TIMEOUT);
        }
    }

    pub(crate) fn request_status_envelope(
        &self,
        wr: &WaitingRequest,
        status: (u16, &str),
    ) -> Envelope {
        Envelope::status_with(
            wr.reply.clone(),
            status.0,
            status.1,
            &[
                (crate::stream::message::HDR_PENDING_MESSAGES, wr.remaining() as u64),
                (crate::stream::message::HDR_PENDING_BYTES, wr.remaining_bytes() as u64),
            ],
        )
    }

    /// The stream is drained: no-wait requests complete now, 404 if they
    /// never saw a message, timeout otherwise.
    pub(crate) fn close_no_wait_requests(&self, inner: &mut ConsumerInner, _now: i64) {
        let all = inner.waiting.drain_all();
        for wr in all {
            if wr.no_wait {
                let status = if wr.delivered == 0 {
                    STATUS_NO_MESSAGES
                } else {
                    STATUS_REQUEST_TIMEOUT
                };
                self.send_request_status(&wr, status);
            } else {
                let _ = inner.waiting.push(wr);
            }
        }
    }

    // ==========================================
    // FLOW CONTROL
    // ==========================================

    /// Probe once the outstanding window is half consumed.
    pub(crate) fn maybe_send_fc_probe(&self, inner: &mut ConsumerInner, _now: i64) {
        if inner.fcid.is_some() || inner.pbytes <= inner.maxpb / 2 {
            return;
        }
        let deliver_to = match inner.cfg.deliver_subject.clone() {
            Some(ds) => ds,
            None => return,
        };
        let fc_reply = format!(
            "$JS.FC.{}.{}.{}",
            self.stream_name(),
            self.name(),
            Uuid::new_v4().simple()
        );
        let mut env = Envelope::status(deliver_to, 100, "FlowControl Request");
        env.reply = fc_reply.clone();
        inner.fcid = Some(fc_reply);
        inner.fcsz = inner.pbytes;
        self.send_envelope(env);
    }

    /// Client answered the probe: shrink the outstanding window and grow
    /// the ceiling (slow start, doubling up to the configured max).
    pub fn process_flow_control_response(&self, subject: &str) {
        let ceiling = Config::global().consumer.flow_control_max_bytes as i64;
        let mut inner = self.inner.lock();
        if inner.fcid.as_deref() != Some(subject) {
            debug!("[Consumer:{}] Ignoring unmatched flow-control reply", self.name());
            return;
        }
        inner.pbytes = (inner.pbytes - inner.fcsz).max(0);
        inner.maxpb = (inner.maxpb * 2).min(ceiling);
        inner.fcid = None;
        inner.fcsz = 0;
        drop(inner);
        self.wake.notify_one();
    }

    // ==========================================
    // PULL REQUEST ADMISSION
    // ==========================================

    pub(crate) fn handle_pull_intake(&self, intake: PullIntake) {
        let now = now_ns();
        let req = match NextRequest::parse(&intake.body) {
            Ok(r) => r,
            Err(e) => {
                debug!("[Consumer:{}] Bad pull request: {}", self.name(), e);
                self.send_envelope(Envelope::status(
                    intake.reply,
                    STATUS_BAD_REQUEST.0,
                    STATUS_BAD_REQUEST.1,
                ));
                return;
            }
        };

        if !self.is_leader() {
            // Another peer answers; a leaderless group delays the failure
            // so the real leader gets a chance to respond first.
            if self.node.as_ref().map(|n| n.leaderless()).unwrap_or(false) {
                let outbound = self.outbound.clone();
                let reply = intake.reply.clone();
                let delay = Config::global().cluster.leaderless_reply_delay_ms;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = outbound.send(Envelope::status(
                        reply,
                        crate::stream::message::STATUS_LEADERSHIP_CHANGE.0,
                        crate::stream::message::STATUS_LEADERSHIP_CHANGE.1,
                    ));
                });
            }
            return;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            self.send_envelope(Envelope::status(
                intake.reply,
                STATUS_CONSUMER_DELETED.0,
                STATUS_CONSUMER_DELETED.1,
            ));
            return;
        }
        if !inner.cfg.is_pull_mode() {
            drop(inner);
            self.send_envelope(Envelope::status(
                intake.reply,
                STATUS_CONSUMER_IS_PUSH.0,
                STATUS_CONSUMER_IS_PUSH.1,
            ));
            return;
        }

        // Request limit enforcement.
        let reject = if inner.cfg.max_request_batch > 0 && req.batch > inner.cfg.max_request_batch
        {
            Some(STATUS_MAX_REQUEST_BATCH)
        } else if inner
            .cfg
            .max_request_expires
            .map(|max| req.expires > max.as_nanos() as i64)
            .unwrap_or(false)
        {
            Some(STATUS_MAX_REQUEST_EXPIRES)
        } else if inner.cfg.max_request_max_bytes > 0
            && req.max_bytes > inner.cfg.max_request_max_bytes
        {
            Some(STATUS_MAX_REQUEST_MAX_BYTES)
        } else if req.idle_heartbeat > 0 && req.expires < req.idle_heartbeat * 2 {
            Some(STATUS_BAD_REQUEST)
        } else if inner.cfg.priority_policy != PriorityPolicy::None
            && !req
                .priority_group
                .as_ref()
                .map(|g| inner.cfg.priority_groups.contains(&g.group))
                .unwrap_or(false)
        {
            Some(STATUS_BAD_REQUEST)
        } else {
            None
        };
        if let Some(status) = reject {
            drop(inner);
            self.send_envelope(Envelope::status(intake.reply, status.0, status.1));
            return;
        }

        inner.last_activity_ns = now;
        let wr = WaitingRequest::from_request(&req, intake.reply, now);
        match inner.waiting.push(wr) {
            Ok(()) => {
                drop(inner);
                self.wake.notify_one();
                self.timer_wake.notify_one();
            }
            Err(wr) => {
                drop(inner);
                // In heartbeat mode the client learns from missed beats.
                if wr.hb_interval_ns == 0 {
                    self.send_request_status(&wr, STATUS_MAX_WAITING);
                }
            }
        }
    }

    // ==========================================
    // TIMERS
    // ==========================================

    /// Earliest instant any timer needs to fire, in unix nanoseconds.
    pub(crate) fn next_timer_deadline(&self) -> Option<i64> {
        if !self.is_leader() {
            return None;
        }
        let inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let mut min: Option<i64> = None;
        let mut fold = |candidate: i64| {
            if candidate > 0 {
                min = Some(min.map_or(candidate, |m| m.min(candidate)));
            }
        };

        fold(inner.ack_retry_at_ns);
        // Ack-wait deadlines over pending.
        for (&seq, p) in &inner.state.cursor.pending {
            if inner.state.queued_for_redelivery(seq) {
                continue;
            }
            let dc = inner.state.delivery_count(seq);
            if inner.cfg.max_deliver > 0 && dc > inner.cfg.max_deliver as u64 {
                continue;
            }
            fold(p.timestamp_ns + inner.cfg.ack_deadline(dc).as_nanos() as i64);
        }
        if let Some(deadline) = inner.waiting.next_deadline_ns() {
            fold(deadline);
        }
        if inner.pin_id.is_some() {
            if let Some(ttl) = inner.cfg.pinned_ttl {
                fold(inner.pin_since_ns + ttl.as_nanos() as i64);
            }
        }
        fold(inner.paused_until_ns);
        fold(inner.push_hb_next_ns);
        if let Some(th) = inner.cfg.inactive_threshold {
            let th_ns = th.as_nanos() as i64;
            if inner.cfg.is_pull_mode() {
                if inner.waiting.is_empty() {
                    let mut deadline = inner.last_activity_ns + th_ns;
                    let ack_wait_ns = inner.cfg.ack_wait.as_nanos() as i64;
                    for p in inner.state.cursor.pending.values() {
                        deadline = deadline.max(p.timestamp_ns + ack_wait_ns + th_ns);
                    }
                    fold(deadline);
                }
            } else if !inner.push_active {
                fold(inner.push_inactive_since_ns + th_ns);
            }
        }
        min
    }

    pub(crate) async fn fire_timers(&self) {
        if !self.is_leader() {
            return;
        }
        let now = now_ns();
        let retry_ns =
            Duration::from_millis(Config::global().consumer.ack_retry_ms).as_nanos() as i64;
        let mut wake_delivery = false;
        let mut resumed = false;
        let mut unpinned_group: Option<String> = None;
        let mut statuses: Vec<Envelope> = Vec::new();
        let mut delete_due = false;

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            // Unpause.
            if inner.paused_until_ns > 0 && now >= inner.paused_until_ns {
                inner.paused_until_ns = 0;
                inner.cfg.pause_until = None;
                resumed = true;
                wake_delivery = true;
            }

            // Ack-wait expiry; bail to a short retry when acks are mid-flight.
            if self.acks_in_flight.load(Ordering::Acquire) > 0 {
                inner.ack_retry_at_ns = now + retry_ns;
            } else {
                inner.ack_retry_at_ns = 0;
                let first_seq = self.msgs.fast_state().first_seq;
                let cfg = inner.cfg.clone();
                let before = inner.state.redeliver.len();
                inner.state.expire_pending(now, &cfg, first_seq);
                if inner.state.redeliver.len() > before {
                    wake_delivery = true;
                }
            }

            // Wait-queue expiry and per-request heartbeats.
            self.scan_waiting(&mut inner, now, &mut statuses);

            // Incremental retention sweep: everything at or below the ack
            // floor is safe for the stream to reclaim.
            if self.retention != RetentionPolicy::Limits {
                let floor = inner.state.cursor.ack_floor.stream_seq;
                if inner.state.check_floor <= floor {
                    let start = inner.state.check_floor.max(1);
                    for seq in start..=floor {
                        let _ = self.stream_acks.send(seq);
                    }
                    inner.state.check_floor = floor + 1;
                }
            }

            // Pin TTL.
            if let (Some(_), Some(ttl)) = (inner.pin_id.clone(), inner.cfg.pinned_ttl) {
                if now - inner.pin_since_ns >= ttl.as_nanos() as i64 {
                    inner.pin_id = None;
                    unpinned_group = Some(
                        inner.cfg.priority_groups.first().cloned().unwrap_or_default(),
                    );
                    wake_delivery = true;
                }
            }

            // Push idle heartbeat.
            if !inner.cfg.is_pull_mode() && inner.push_hb_next_ns > 0 && now >= inner.push_hb_next_ns {
                if let (Some(hb), Some(ds)) =
                    (inner.cfg.idle_heartbeat, inner.cfg.deliver_subject.clone())
                {
                    let delivered_d = inner.state.cursor.deliver_seq.saturating_sub(1);
                    let delivered_s = inner.state.cursor.stream_seq.saturating_sub(1);
                    let mut hdr = StatusHeaders::new(100, "Idle Heartbeat")
                        .field_u64(HDR_LAST_CONSUMER, delivered_d)
                        .field_u64(HDR_LAST_STREAM, delivered_s);
                    if let Some(fc) = &inner.fcid {
                        hdr = hdr.field(HDR_CONSUMER_STALLED, fc);
                    }
                    statuses.push(Envelope {
                        subject: ds.clone(),
                        deliver_to: ds,
                        reply: String::new(),
                        headers: Some(hdr.into_bytes()),
                        payload: Bytes::new(),
                    });
                    inner.push_hb_next_ns = now + hb.as_nanos() as i64;
                }
            }

            // Inactivity GC.
            delete_due = self.inactive_due(&inner, now);
        }

        for env in statuses {
            self.send_envelope(env);
        }
        if resumed {
            self.publish_advisory(
                "PAUSE",
                AdvisoryEvent::Paused {
                    stream: self.stream_name().to_string(),
                    consumer: self.name().to_string(),
                    paused: false,
                    pause_until: None,
                },
            );
        }
        if let Some(group) = unpinned_group {
            self.publish_advisory(
                "UNPINNED",
                AdvisoryEvent::Unpinned {
                    stream: self.stream_name().to_string(),
                    consumer: self.name().to_string(),
                    group,
                    reason: "timeout".to_string(),
                },
            );
        }
        if wake_delivery {
            self.wake.notify_one();
        }
        if delete_due {
            info!("[Consumer:{}] Inactivity threshold reached, deleting", self.name());
            if let Some(me) = self.owning_handle() {
                tokio::spawn(async move {
                    me.delete().await;
                });
            }
        }
    }

    fn scan_waiting(&self, inner: &mut ConsumerInner, now: i64, statuses: &mut Vec<Envelope>) {
        if inner.waiting.is_empty() {
            return;
        }
        let delivered_d = inner.state.cursor.deliver_seq.saturating_sub(1);
        let delivered_s = inner.state.cursor.stream_seq.saturating_sub(1);
        let fc_stalled = inner.fcid.clone();
        let replicated = self.node.is_some();

        let all = inner.waiting.drain_all();
        let mut kept = Vec::with_capacity(all.len());
        for mut wr in all {
            if wr.expired(now) {
                let env = self.request_status_envelope(&wr, STATUS_REQUEST_TIMEOUT);
                if replicated && inner.waiting_deliveries.contains_key(&wr.reply) {
                    inner.deferred_timeouts.insert(wr.reply.clone(), env);
                } else {
                    statuses.push(env);
                }
                continue;
            }
            if wr.hb_interval_ns > 0 && now >= wr.hb_next_ns {
                let mut hdr = StatusHeaders::new(100, "Idle Heartbeat")
                    .field_u64(HDR_LAST_CONSUMER, delivered_d)
                    .field_u64(HDR_LAST_STREAM, delivered_s);
                if let Some(fc) = &fc_stalled {
                    hdr = hdr.field(HDR_CONSUMER_STALLED, fc);
                }
                statuses.push(Envelope {
                    subject: wr.reply.clone(),
                    deliver_to: wr.reply.clone(),
                    reply: String::new(),
                    headers: Some(hdr.into_bytes()),
                    payload: Bytes::new(),
                });
                wr.hb_next_ns = now + wr.hb_interval_ns;
            }
            kept.push(wr);
        }
        for wr in kept {
            let _ = inner.waiting.push(wr);
        }
    }

    fn inactive_due(&self, inner: &ConsumerInner, now: i64) -> bool {
        let th_ns = match inner.cfg.inactive_threshold {
            Some(th) => th.as_nanos() as i64,
            None => return false,
        };
        if inner.deleted {
            return false;
        }
        if inner.cfg.is_pull_mode() {
            if !inner.waiting.is_empty() {
                return false;
            }
            if now - inner.last_activity_ns < th_ns {
                return false;
            }
            // Outstanding deliveries push the deadline out until their ack
            // window (plus the threshold) has fully passed.
            let ack_wait_ns = inner.cfg.ack_wait.as_nanos() as i64;
            for p in inner.state.cursor.pending.values() {
                if p.timestamp_ns + ack_wait_ns + th_ns > now {
                    return false;
                }
            }
            true
        } else {
            !inner.push_active && now - inner.push_inactive_since_ns >= th_ns
        }
    }
}
