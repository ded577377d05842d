//! Consumer: a named cursor over a stream
//!
//! One mutex guards the working state; leadership and ack-work-in-flight
//! are atomics so other loops get fast-path reads. On top of that sit the
//! cooperative loops: delivery, ack intake, pull-request intake, proposal
//! forwarding, and a single timer task that owns every deadline (ack wait,
//! request expiry, heartbeats, pin TTL, unpause, inactivity). All of them
//! share one cancellation token.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisory::{advisory_subject, Advisory, AdvisoryEvent, AdvisorySink};
use crate::cluster::{ConsensusNode, ConsumerOp};
use crate::config::Config;
use crate::consumer::config::{AckPolicy, ConsumerConfig, DeliverPolicy};
use crate::consumer::errors::ConsumerError;
use crate::consumer::state::{ConsumerCursor, DeliveryState, SequencePair, SkipList};
use crate::consumer::store::{ConsumerStore, FileConsumerStore, MemoryConsumerStore};
use crate::consumer::waiting::{WaitQueue, WaitingRequest};
use crate::stream::message::{
    Envelope, HDR_PENDING_BYTES, HDR_PENDING_MESSAGES, STATUS_CONSUMER_DELETED,
    STATUS_LEADERSHIP_CHANGE,
};
use crate::stream::store::MessageStore;
use crate::stream::stream::{InterestLookup, RetentionPolicy, Stream};
use crate::utils::utils_time::now_ns;

pub(crate) struct AckIntake {
    pub subject: String,
    pub reply: String,
    pub payload: Bytes,
}

pub(crate) struct PullIntake {
    pub reply: String,
    pub body: Bytes,
}

/// Everything the consumer needs from its collaborators, handed over once
/// at construction.
pub struct ConsumerArgs {
    pub stream_name: String,
    pub name: String,
    pub cfg: ConsumerConfig,
    pub msgs: Arc<dyn MessageStore>,
    pub interest: Arc<dyn InterestLookup>,
    pub advisories: Arc<dyn AdvisorySink>,
    pub node: Option<Arc<dyn ConsensusNode>>,
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub stream_acks: mpsc::UnboundedSender<u64>,
    pub retention: RetentionPolicy,
    pub stream: Weak<Stream>,
    /// Durables get a file-backed store when set; everything else rides
    /// memory.
    pub state_dir: Option<std::path::PathBuf>,
}

/// Mutable working state, guarded by the consumer mutex.
pub(crate) struct ConsumerInner {
    pub cfg: ConsumerConfig,
    pub state: DeliveryState,
    pub waiting: WaitQueue,

    // Priority groups (pinned client).
    pub pin_id: Option<String>,
    pub pin_since_ns: i64,

    // Push flow control.
    pub pbytes: i64,
    pub maxpb: i64,
    pub fcid: Option<String>,
    pub fcsz: i64,

    // Replicated delivery buffer: envelopes held back until their
    // delivered-state proposal commits.
    pub pending_deliveries: std::collections::HashMap<u64, Envelope>,
    pub waiting_deliveries: std::collections::HashMap<String, u64>,
    pub deferred_timeouts: std::collections::HashMap<String, Envelope>,
    pub ack_replies: std::collections::HashMap<u64, String>,
    pub pending_proposals: Vec<Bytes>,

    // Pacing (replay original / rate limit).
    pub last_msg_ts_ns: i64,
    pub last_send_ns: i64,
    pub deliver_not_before_ns: i64,

    // Liveness.
    pub push_active: bool,
    pub push_inactive_since_ns: i64,
    pub last_activity_ns: i64,
    pub push_hb_next_ns: i64,
    pub paused_until_ns: i64,
    pub ack_retry_at_ns: i64,

    pub closed: bool,
    pub deleted: bool,
}

pub struct Consumer {
    name: String,
    stream_name: String,
    created: DateTime<Utc>,
    pub(crate) store: Arc<dyn ConsumerStore>,
    pub(crate) msgs: Arc<dyn MessageStore>,
    pub(crate) interest: Arc<dyn InterestLookup>,
    pub(crate) advisories: Arc<dyn AdvisorySink>,
    pub(crate) node: Option<Arc<dyn ConsensusNode>>,
    pub(crate) outbound: mpsc::UnboundedSender<Envelope>,
    pub(crate) stream_acks: mpsc::UnboundedSender<u64>,
    pub(crate) retention: RetentionPolicy,
    stream: Weak<Stream>,

    pub(crate) inner: Mutex<ConsumerInner>,
    /// Back-reference for loops that need to hand an owning clone to a
    /// spawned task (inactivity delete, committed delete).
    self_ref: Mutex<Weak<Consumer>>,
    is_leader: AtomicBool,
    pub(crate) acks_in_flight: AtomicU64,

    pub(crate) wake: Notify,
    pub(crate) timer_wake: Notify,
    pub(crate) proposal_wake: Notify,
    quit: CancellationToken,
    tasks: TaskTracker,

    ack_tx: mpsc::Sender<AckIntake>,
    pull_tx: mpsc::Sender<PullIntake>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("stream_name", &self.stream_name)
            .finish()
    }
}

enum LoopAction {
    Continue,
    Sleep(Duration),
    Idle,
}

impl Consumer {
    pub fn spawn(args: ConsumerArgs) -> Result<Arc<Self>, ConsumerError> {
        let defaults = &Config::global().consumer;
        let mut cfg = args.cfg;

        // Ephemerals always carry an inactivity threshold, jittered by up
        // to a second so a herd of them does not expire in lockstep.
        if cfg.inactive_threshold.is_none() && !cfg.is_durable() {
            let jitter_ns = u64::from_le_bytes(
                Uuid::new_v4().as_bytes()[..8].try_into().unwrap(),
            ) % 1_000_000_000;
            cfg.inactive_threshold = Some(
                Duration::from_millis(defaults.ephemeral_inactive_ms)
                    + Duration::from_nanos(jitter_ns),
            );
        }

        let store: Arc<dyn ConsumerStore> = match (&args.state_dir, cfg.is_durable()) {
            (Some(dir), true) => Arc::new(
                FileConsumerStore::open(dir.join(format!("{}.state", args.name)))
                    .map_err(ConsumerError::StoreFailed)?,
            ),
            _ => Arc::new(MemoryConsumerStore::new()),
        };
        store.update_config(&cfg)?;

        // Starting position: stored state wins, otherwise the deliver
        // policy picks (and clamps) the first stream sequence.
        let (cursor, skip_list) = if store.has_state() {
            (store.state()?, None)
        } else {
            let (cursor, skip_list) = Self::initial_cursor(&cfg, args.msgs.as_ref());
            store.set_starting(cursor.stream_seq)?;
            (cursor, skip_list)
        };

        let now = now_ns();
        let paused_until_ns = cfg
            .pause_until
            .and_then(|t| t.timestamp_nanos_opt())
            .filter(|ts| *ts > now)
            .unwrap_or(0);
        let push_active = match &cfg.deliver_subject {
            Some(ds) => args.interest.has_interest(ds),
            None => false,
        };

        let mut state = DeliveryState::new(cursor);
        state.skip_list = skip_list;

        let max_waiting = cfg.max_waiting.max(1);
        let inner = ConsumerInner {
            waiting: WaitQueue::new(max_waiting),
            cfg,
            state,
            pin_id: None,
            pin_since_ns: 0,
            pbytes: 0,
            maxpb: (defaults.flow_control_max_bytes / 2) as i64,
            fcid: None,
            fcsz: 0,
            pending_deliveries: Default::default(),
            waiting_deliveries: Default::default(),
            deferred_timeouts: Default::default(),
            ack_replies: Default::default(),
            pending_proposals: Vec::new(),
            last_msg_ts_ns: 0,
            last_send_ns: 0,
            deliver_not_before_ns: 0,
            push_active,
            push_inactive_since_ns: now,
            last_activity_ns: now,
            push_hb_next_ns: 0,
            paused_until_ns,
            ack_retry_at_ns: 0,
            closed: false,
            deleted: false,
        };

        let (ack_tx, ack_rx) = mpsc::channel(defaults.ack_intake_capacity);
        let (pull_tx, pull_rx) = mpsc::channel(defaults.request_intake_capacity);

        let consumer = Arc::new(Self {
            name: args.name,
            stream_name: args.stream_name,
            created: Utc::now(),
            store,
            msgs: args.msgs,
            interest: args.interest,
            advisories: args.advisories,
            node: args.node,
            outbound: args.outbound,
            stream_acks: args.stream_acks,
            retention: args.retention,
            stream: args.stream,
            inner: Mutex::new(inner),
            self_ref: Mutex::new(Weak::new()),
            is_leader: AtomicBool::new(false),
            acks_in_flight: AtomicU64::new(0),
            wake: Notify::new(),
            timer_wake: Notify::new(),
            proposal_wake: Notify::new(),
            quit: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ack_tx,
            pull_tx,
        });

        *consumer.self_ref.lock() = Arc::downgrade(&consumer);

        consumer.tasks.spawn(consumer.clone().delivery_loop());
        consumer.tasks.spawn(consumer.clone().ack_loop(ack_rx));
        consumer.tasks.spawn(consumer.clone().timer_loop());
        // Push consumers keep the intake loop so stray pull requests get
        // their 409 instead of silence.
        consumer.tasks.spawn(consumer.clone().pull_request_loop(pull_rx));
        if consumer.node.is_some() {
            consumer.tasks.spawn(consumer.clone().proposal_loop());
        }

        let leader = consumer.node.as_ref().map(|n| n.leader()).unwrap_or(true);
        consumer.set_leader(leader);

        consumer.publish_advisory(
            "CREATED",
            AdvisoryEvent::ConsumerAction {
                action: "create".to_string(),
                stream: consumer.stream_name.clone(),
                consumer: consumer.name.clone(),
            },
        );
        info!("[Consumer:{}] Started (stream '{}')", consumer.name, consumer.stream_name);
        Ok(consumer)
    }

    // --- Accessors ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn is_pull_mode(&self) -> bool {
        self.inner.lock().cfg.is_pull_mode()
    }

    pub fn config(&self) -> ConsumerConfig {
        self.inner.lock().cfg.clone()
    }

    // --- Starting sequence selection ---

    fn initial_cursor(
        cfg: &ConsumerConfig,
        msgs: &dyn MessageStore,
    ) -> (ConsumerCursor, Option<SkipList>) {
        let fs = msgs.fast_state();
        let filters = cfg.filters();
        let mut skip_list = None;

        let mut sseq = match cfg.deliver_policy {
            DeliverPolicy::All => fs.first_seq,
            DeliverPolicy::Last => {
                if filters.is_empty() {
                    fs.last_seq
                } else {
                    msgs.multi_last_seqs(&filters, 0)
                        .into_iter()
                        .max()
                        .unwrap_or(fs.last_seq + 1)
                }
            }
            DeliverPolicy::New => fs.last_seq + 1,
            DeliverPolicy::ByStartSequence => cfg.opt_start_seq,
            DeliverPolicy::ByStartTime => {
                let t = cfg.opt_start_time.unwrap_or_else(Utc::now);
                msgs.seq_for_time(t)
            }
            DeliverPolicy::LastPerSubject => {
                let lasts = msgs.multi_last_seqs(&filters, 0);
                let first = lasts.first().copied().unwrap_or(fs.last_seq + 1);
                skip_list = Some(SkipList::new(lasts, fs.last_seq));
                first
            }
        };

        // Clamp into the live sequence space. An explicit start sequence is
        // allowed to sit in the future; everything else snaps to the edge.
        if sseq < fs.first_seq {
            sseq = fs.first_seq;
        }
        if cfg.deliver_policy != DeliverPolicy::ByStartSequence {
            if sseq > fs.last_seq {
                sseq = fs.last_seq + 1;
            }
            if fs.last_seq == 0 {
                sseq = 1;
            }
        }

        (ConsumerCursor::starting_at(sseq), skip_list)
    }

    // --- Leadership ---

    pub fn set_leader(&self, leader: bool) {
        let was = self.is_leader.swap(leader, Ordering::AcqRel);
        if was == leader {
            return;
        }
        if leader {
            let mut inner = self.inner.lock();
            // The committed cursor wins over anything still in memory: a
            // replica may have applied transitions we never saw, and our own
            // uncommitted deliveries from a previous term must not survive.
            if let Ok(cursor) = self.store.state() {
                let skip_list = inner.state.skip_list.take();
                inner.state = DeliveryState::new(cursor);
                inner.state.skip_list = skip_list;
            }
            // Retention sweeps only chase floor movement from this term on.
            inner.state.check_floor = inner.state.cursor.ack_floor.stream_seq + 1;
            self.refresh_num_pending(&mut inner);
            let defaults = &Config::global().consumer;
            inner.maxpb = (defaults.flow_control_max_bytes / 2) as i64;
            inner.pbytes = 0;
            inner.fcid = None;
            inner.last_activity_ns = now_ns();
            if let Some(hb) = inner.cfg.idle_heartbeat {
                inner.push_hb_next_ns = now_ns() + hb.as_nanos() as i64;
            }
            drop(inner);
            info!("[Consumer:{}] Became leader", self.name);
            self.wake.notify_one();
            self.timer_wake.notify_one();
        } else {
            let mut inner = self.inner.lock();
            inner.pending_deliveries.clear();
            inner.waiting_deliveries.clear();
            inner.deferred_timeouts.clear();
            inner.ack_replies.clear();
            inner.pending_proposals.clear();
            inner.state.redeliver.clear();
            let unpinned = inner.pin_id.take().is_some();
            let pin_group = inner.cfg.priority_groups.first().cloned();
            let drained = inner.waiting.drain_all();
            drop(inner);
            info!("[Consumer:{}] Lost leadership", self.name);
            if unpinned {
                self.publish_advisory(
                    "UNPINNED",
                    AdvisoryEvent::Unpinned {
                        stream: self.stream_name.clone(),
                        consumer: self.name.clone(),
                        group: pin_group.unwrap_or_default(),
                        reason: "leadership_change".to_string(),
                    },
                );
            }
            for wr in drained {
                self.send_request_status(&wr, STATUS_LEADERSHIP_CHANGE);
            }
        }
    }

    /// Ask the consensus layer to hand leadership to another peer.
    pub fn step_down(&self) -> Result<(), ConsumerError> {
        match &self.node {
            Some(node) => {
                node.step_down(None)?;
                self.set_leader(false);
                Ok(())
            }
            None => Err(ConsumerError::NotLeader),
        }
    }

    // --- Intake surfaces (called by the transport adapter) ---

    /// Enqueue an inbound ack-subject message. The bounded intake keeps a
    /// misbehaving client from wedging the lock; overflow drops with a log.
    pub fn process_ack_message(&self, subject: &str, reply: &str, payload: Bytes) {
        if !self.is_leader() {
            return;
        }
        self.acks_in_flight.fetch_add(1, Ordering::AcqRel);
        let intake = AckIntake {
            subject: subject.to_string(),
            reply: reply.to_string(),
            payload,
        };
        if self.ack_tx.try_send(intake).is_err() {
            self.acks_in_flight.fetch_sub(1, Ordering::AcqRel);
            warn!("[Consumer:{}] Ack intake full, dropping ack", self.name);
        }
    }

    /// Enqueue a pull next-message request.
    pub fn process_next_request(&self, reply: &str, body: Bytes) {
        let intake = PullIntake {
            reply: reply.to_string(),
            body,
        };
        if self.pull_tx.try_send(intake).is_err() {
            warn!("[Consumer:{}] Request intake full, dropping pull request", self.name);
        }
    }

    /// The stream writer signals every consumer as messages land.
    pub fn signal_new_messages(&self, subject: &str, seq: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if inner.cfg.subject_matches_filter(subject) && seq > inner.state.num_pending_floor {
                inner.state.num_pending += 1;
                inner.state.num_pending_floor = seq;
            }
        }
        self.wake.notify_one();
    }

    /// Router callback: interest on the deliver subject came or went.
    pub fn push_interest_change(&self, active: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.push_active == active {
                return;
            }
            inner.push_active = active;
            if !active {
                inner.push_inactive_since_ns = now_ns();
            }
        }
        if active {
            self.wake.notify_one();
        }
        self.timer_wake.notify_one();
    }

    // --- Pause / resume ---

    pub fn pause(&self, until: DateTime<Utc>) {
        let ts = until.timestamp_nanos_opt().unwrap_or(0);
        {
            let mut inner = self.inner.lock();
            inner.paused_until_ns = ts.max(0);
            inner.cfg.pause_until = Some(until);
        }
        self.publish_advisory(
            "PAUSE",
            AdvisoryEvent::Paused {
                stream: self.stream_name.clone(),
                consumer: self.name.clone(),
                paused: true,
                pause_until: Some(until),
            },
        );
        self.timer_wake.notify_one();
    }

    pub fn resume(&self) {
        {
            let mut inner = self.inner.lock();
            inner.paused_until_ns = 0;
            inner.cfg.pause_until = None;
        }
        self.publish_advisory(
            "PAUSE",
            AdvisoryEvent::Paused {
                stream: self.stream_name.clone(),
                consumer: self.name.clone(),
                paused: false,
                pause_until: None,
            },
        );
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused_until_ns > now_ns()
    }

    // --- Config update ---

    /// Apply an already-validated config update. Identity-defining fields
    /// cannot change.
    pub fn update_config(&self, new: ConsumerConfig) -> Result<(), ConsumerError> {
        let mut inner = self.inner.lock();
        let old = &inner.cfg;
        if new.deliver_policy != old.deliver_policy {
            return Err(ConsumerError::ConfigInvalid("deliver policy cannot change".into()));
        }
        if new.ack_policy != old.ack_policy {
            return Err(ConsumerError::ConfigInvalid("ack policy cannot change".into()));
        }
        if new.replay_policy != old.replay_policy {
            return Err(ConsumerError::ConfigInvalid("replay policy cannot change".into()));
        }
        if new.is_pull_mode() != old.is_pull_mode() {
            return Err(ConsumerError::ConfigInvalid(
                "consumer cannot switch between push and pull".into(),
            ));
        }
        let filters_changed = new.filters() != old.filters();
        inner.paused_until_ns = new
            .pause_until
            .and_then(|t| t.timestamp_nanos_opt())
            .filter(|ts| *ts > now_ns())
            .unwrap_or(0);
        inner.cfg = new;
        if filters_changed {
            self.refresh_num_pending(&mut inner);
        }
        self.store.update_config(&inner.cfg)?;
        drop(inner);
        self.wake.notify_one();
        self.timer_wake.notify_one();
        Ok(())
    }

    // --- Info ---

    pub fn info(&self) -> ConsumerInfo {
        let inner = self.inner.lock();
        let cursor = &inner.state.cursor;
        let now = now_ns();
        ConsumerInfo {
            stream_name: self.stream_name.clone(),
            name: self.name.clone(),
            created: self.created,
            config: inner.cfg.clone(),
            delivered: SequencePair {
                consumer_seq: cursor.deliver_seq.saturating_sub(1),
                stream_seq: cursor.stream_seq.saturating_sub(1),
            },
            ack_floor: cursor.ack_floor,
            num_ack_pending: cursor.pending.len(),
            num_redelivered: cursor.redelivery_count.len(),
            num_waiting: inner.waiting.len(),
            num_pending: inner.state.num_pending,
            paused: inner.paused_until_ns > now,
            pause_remaining: (inner.paused_until_ns > now)
                .then(|| Duration::from_nanos((inner.paused_until_ns - now) as u64)),
            push_bound: !inner.cfg.is_pull_mode() && inner.push_active,
        }
    }

    // --- Lifecycle ---

    /// Stop loops and release the store without deleting state. Durables
    /// can be resumed by a later create.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        if let Err(e) = self.store.stop() {
            warn!("[Consumer:{}] Store stop failed: {}", self.name, e);
        }
        self.quit.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("[Consumer:{}] Stopped", self.name);
    }

    /// Full removal: drain waiters with a deleted status, drop the store,
    /// unregister from the stream.
    pub async fn delete(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.deleted {
                return;
            }
            inner.deleted = true;
            inner.closed = true;
            inner.waiting.drain_all()
        };
        for wr in drained {
            self.send_request_status(&wr, STATUS_CONSUMER_DELETED);
        }
        // In a replicated setup removal flows through the log so peers drop
        // their copy too. Keep re-proposing with backoff until the stream
        // no longer knows the consumer.
        if let Some(node) = &self.node {
            if let Err(e) = node.propose(ConsumerOp::Delete.encode()) {
                warn!("[Consumer:{}] Delete proposal failed: {}", self.name, e);
            }
            let node = node.clone();
            let stream = self.stream.clone();
            let name = self.name.clone();
            let cluster = &Config::global().cluster;
            let cap = Duration::from_millis(cluster.delete_backoff_cap_ms);
            let mut backoff = Duration::from_millis(cluster.delete_backoff_start_ms);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(cap);
                    let gone = stream
                        .upgrade()
                        .map(|s| s.lookup_consumer(&name).is_none())
                        .unwrap_or(true);
                    if gone || node.propose(ConsumerOp::Delete.encode()).is_err() {
                        break;
                    }
                }
            });
        }
        self.publish_advisory(
            "DELETED",
            AdvisoryEvent::ConsumerAction {
                action: "delete".to_string(),
                stream: self.stream_name.clone(),
                consumer: self.name.clone(),
            },
        );
        if let Err(e) = self.store.delete() {
            warn!("[Consumer:{}] Store delete failed: {}", self.name, e);
        }
        if let Some(stream) = self.stream.upgrade() {
            stream.remove_consumer(&self.name);
        }
        self.quit.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("[Consumer:{}] Deleted", self.name);
    }

    // --- Loops ---

    async fn delivery_loop(self: Arc<Self>) {
        loop {
            if self.quit.is_cancelled() {
                return;
            }
            match self.deliver_cycle() {
                LoopAction::Continue => continue,
                LoopAction::Sleep(d) => {
                    tokio::select! {
                        _ = self.quit.cancelled() => return,
                        _ = tokio::time::sleep(d) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                LoopAction::Idle => {
                    tokio::select! {
                        _ = self.quit.cancelled() => return,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
    }

    async fn ack_loop(self: Arc<Self>, mut rx: mpsc::Receiver<AckIntake>) {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,
                item = rx.recv() => {
                    let mut item = match item {
                        Some(i) => i,
                        None => return,
                    };
                    // Drain what is queued in one pass.
                    loop {
                        self.handle_ack_intake(&item);
                        self.acks_in_flight.fetch_sub(1, Ordering::AcqRel);
                        match rx.try_recv() {
                            Ok(next) => item = next,
                            Err(_) => break,
                        }
                    }
                }
            }
        }
    }

    async fn pull_request_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PullIntake>) {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,
                item = rx.recv() => {
                    match item {
                        Some(intake) => self.handle_pull_intake(intake),
                        None => return,
                    }
                }
            }
        }
    }

    /// Batch delivery-state proposals into bounded consensus submissions.
    async fn proposal_loop(self: Arc<Self>) {
        let node = match &self.node {
            Some(n) => n.clone(),
            None => return,
        };
        let max_batch = Config::global().cluster.proposal_batch_max_bytes;
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = self.proposal_wake.notified() => {}
            }
            let entries = {
                let mut inner = self.inner.lock();
                std::mem::take(&mut inner.pending_proposals)
            };
            if entries.is_empty() {
                continue;
            }
            let mut batch: Vec<Bytes> = Vec::new();
            let mut batch_bytes = 0usize;
            for entry in entries {
                if batch_bytes + entry.len() > max_batch && !batch.is_empty() {
                    if let Err(e) = node.propose_multi(std::mem::take(&mut batch)) {
                        warn!("[Consumer:{}] Proposal batch failed: {}", self.name, e);
                    }
                    batch_bytes = 0;
                }
                batch_bytes += entry.len();
                batch.push(entry);
            }
            if !batch.is_empty() {
                if let Err(e) = node.propose_multi(batch) {
                    warn!("[Consumer:{}] Proposal batch failed: {}", self.name, e);
                }
            }
        }
    }

    async fn timer_loop(self: Arc<Self>) {
        loop {
            if self.quit.is_cancelled() {
                return;
            }
            let sleep_for = self
                .next_timer_deadline()
                .map(|deadline| {
                    let now = now_ns();
                    Duration::from_nanos((deadline - now).max(0) as u64)
                })
                .unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = self.timer_wake.notified() => continue,
                _ = tokio::time::sleep(sleep_for) => {
                    self.fire_timers().await;
                }
            }
        }
    }

    // --- Helpers shared by the loops ---

    fn refresh_num_pending(&self, inner: &mut ConsumerInner) {
        let filters = inner.cfg.filters();
        let last_per_subject = inner.cfg.deliver_policy == DeliverPolicy::LastPerSubject;
        let from = inner.state.cursor.stream_seq;
        let (count, floor) = match filters.len() {
            0 => self.msgs.num_pending(from, None, last_per_subject),
            1 => self.msgs.num_pending(from, Some(&filters[0]), last_per_subject),
            _ => {
                let mut total = 0;
                let mut valid = 0;
                for f in &filters {
                    let (c, v) = self.msgs.num_pending(from, Some(f), last_per_subject);
                    total += c;
                    valid = v;
                }
                (total, valid)
            }
        };
        inner.state.set_num_pending(count, floor);
    }

    pub(crate) fn publish_advisory(&self, kind: &str, event: AdvisoryEvent) {
        let subject = advisory_subject(kind, &self.stream_name, &self.name);
        self.advisories.publish(subject, Advisory::new(event));
    }

    pub(crate) fn send_envelope(&self, env: Envelope) {
        let _ = self.outbound.send(env);
    }

    /// Terminal status for a waiting request, echoing the remaining budget.
    pub(crate) fn send_request_status(&self, wr: &WaitingRequest, status: (u16, &str)) {
        let env = Envelope::status_with(
            wr.reply.clone(),
            status.0,
            status.1,
            &[
                (HDR_PENDING_MESSAGES, wr.remaining() as u64),
                (HDR_PENDING_BYTES, wr.remaining_bytes() as u64),
            ],
        );
        self.send_envelope(env);
    }

    pub(crate) fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub(crate) fn owning_handle(&self) -> Option<Arc<Consumer>> {
        self.self_ref.lock().upgrade()
    }
}

// Delivery-loop internals live in delivery.rs, the ack pipeline and the
// replication apply path in acks.rs.

impl Consumer {
    fn deliver_cycle(&self) -> LoopAction {
        let mut inner = self.inner.lock();
        if inner.closed || !self.is_leader() {
            return LoopAction::Idle;
        }
        let now = now_ns();
        if inner.paused_until_ns > now {
            return LoopAction::Idle; // the unpause timer re-arms delivery
        }
        if inner.cfg.min_last_seq > 0
            && self.msgs.fast_state().last_seq < inner.cfg.min_last_seq
        {
            return LoopAction::Idle;
        }
        if inner.deliver_not_before_ns > now {
            return LoopAction::Sleep(Duration::from_nanos(
                (inner.deliver_not_before_ns - now) as u64,
            ));
        }
        if inner.cfg.is_pull_mode() {
            if inner.waiting.is_empty() {
                return LoopAction::Idle;
            }
        } else {
            if !inner.push_active {
                return LoopAction::Idle;
            }
            if inner.cfg.flow_control {
                self.maybe_send_fc_probe(&mut inner, now);
                if inner.pbytes > inner.maxpb {
                    return LoopAction::Idle; // fc response wakes us
                }
            }
        }

        match self.get_next_msg(&mut inner) {
            Ok(next) => match self.deliver_msg(&mut inner, next, now) {
                crate::consumer::delivery::DeliverOutcome::Delivered => LoopAction::Continue,
                // Pacing pushed the send out; the gate at the top sleeps
                // the exact remainder on the next pass.
                crate::consumer::delivery::DeliverOutcome::Paced => LoopAction::Continue,
                crate::consumer::delivery::DeliverOutcome::NoWaiter => LoopAction::Idle,
            },
            Err(NextMsgError::MaxAckPending) => LoopAction::Idle,
            Err(NextMsgError::NoMessages) => {
                self.close_no_wait_requests(&mut inner, now);
                LoopAction::Idle
            }
            Err(NextMsgError::Store(e)) => {
                warn!("[Consumer:{}] Store error during delivery: {}", self.name, e);
                LoopAction::Sleep(Duration::from_millis(10))
            }
        }
    }
}

pub(crate) enum NextMsgError {
    MaxAckPending,
    NoMessages,
    Store(crate::stream::store::StoreError),
}

/// Point-in-time snapshot of a consumer.
#[derive(Clone, Debug, Serialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub config: ConsumerConfig,
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    pub num_ack_pending: usize,
    pub num_redelivered: usize,
    pub num_waiting: usize,
    pub num_pending: u64,
    pub paused: bool,
    /// Time left on the pause window; absent when the consumer is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_remaining: Option<Duration>,
    pub push_bound: bool,
}
