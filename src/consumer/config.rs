//! Consumer configuration: policies, limits, and cross-field validation.
//!
//! A config is validated (and normalized with runtime defaults) once at
//! create/update time; after that it is an immutable snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::consumer::errors::ConsumerError;
use crate::stream::subject;

pub const MAX_PRIORITY_GROUP_LEN: usize = 16;
pub const MIN_FLOW_CONTROL_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    #[default]
    None,
    Overflow,
    PinnedClient,
}

/// Control-plane action tag. Serialized as a short string; the empty
/// string keeps the historical create-or-update behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ConsumerAction {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "update")]
    Update,
    #[default]
    #[serde(rename = "")]
    CreateOrUpdate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Present for durables; ephemerals get a generated name.
    pub durable_name: Option<String>,
    pub deliver_policy: DeliverPolicy,
    pub opt_start_seq: u64,
    pub opt_start_time: Option<DateTime<Utc>>,
    pub ack_policy: AckPolicy,
    /// Zero means "use the runtime default" until validation normalizes it.
    pub ack_wait: Duration,
    /// Redelivery deadlines indexed by delivery count. Overrides ack_wait.
    pub backoff: Vec<Duration>,
    /// -1 = unbounded.
    pub max_deliver: i64,
    pub filter_subject: Option<String>,
    pub filter_subjects: Vec<String>,
    pub replay_policy: ReplayPolicy,
    /// Push only. Bits per second; 0 = unlimited.
    pub rate_limit_bps: u64,
    /// Percentage of acks that emit a sample advisory (0-100).
    pub sample_freq: u8,
    /// Pull only: wait-queue bound. Zero normalizes to the default.
    pub max_waiting: usize,
    /// Zero normalizes to the default; negative semantics are not used,
    /// the ceiling is always enforced for ack policies other than none.
    pub max_ack_pending: usize,
    /// Empty = pull mode. Must be a literal subject for push.
    pub deliver_subject: Option<String>,
    pub idle_heartbeat: Option<Duration>,
    pub flow_control: bool,
    pub max_request_batch: usize,
    pub max_request_expires: Option<Duration>,
    pub max_request_max_bytes: usize,
    pub inactive_threshold: Option<Duration>,
    pub headers_only: bool,
    pub pause_until: Option<DateTime<Utc>>,
    pub priority_policy: PriorityPolicy,
    pub priority_groups: Vec<String>,
    pub pinned_ttl: Option<Duration>,
    /// Gate: nothing is delivered while the stream last-seq is below this.
    pub min_last_seq: u64,
    pub num_replicas: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            deliver_policy: DeliverPolicy::All,
            opt_start_seq: 0,
            opt_start_time: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::ZERO,
            backoff: Vec::new(),
            max_deliver: -1,
            filter_subject: None,
            filter_subjects: Vec::new(),
            replay_policy: ReplayPolicy::Instant,
            rate_limit_bps: 0,
            sample_freq: 0,
            max_waiting: 0,
            max_ack_pending: 0,
            deliver_subject: None,
            idle_heartbeat: None,
            flow_control: false,
            max_request_batch: 0,
            max_request_expires: None,
            max_request_max_bytes: 0,
            inactive_threshold: None,
            headers_only: false,
            pause_until: None,
            priority_policy: PriorityPolicy::None,
            priority_groups: Vec::new(),
            pinned_ttl: None,
            min_last_seq: 0,
            num_replicas: 0,
        }
    }
}

impl ConsumerConfig {
    pub fn is_pull_mode(&self) -> bool {
        self.deliver_subject.is_none()
    }

    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }

    /// All configured filters, normalized to a list.
    pub fn filters(&self) -> Vec<String> {
        if let Some(f) = &self.filter_subject {
            vec![f.clone()]
        } else {
            self.filter_subjects.clone()
        }
    }

    pub fn subject_matches_filter(&self, msg_subject: &str) -> bool {
        let filters = self.filters();
        if filters.is_empty() {
            return true;
        }
        filters.iter().any(|f| subject::subject_matches(f, msg_subject))
    }

    /// Redelivery deadline for a message already delivered `dc` times.
    pub fn ack_deadline(&self, dc: u64) -> Duration {
        if self.backoff.is_empty() {
            return self.ack_wait;
        }
        let idx = ((dc.max(1) - 1) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    /// Validate and normalize in place. Mirrors create/update admission:
    /// anything rejected here never reaches a running consumer.
    pub fn check(&mut self) -> Result<(), ConsumerError> {
        let defaults = &Config::global().consumer;

        if let Some(name) = &self.durable_name {
            if !subject::is_literal_subject(name) || name.contains('.') {
                return Err(ConsumerError::ConfigInvalid(format!(
                    "durable name '{}' is not a valid token",
                    name
                )));
            }
        }

        // Normalization before cross-checks.
        if self.max_deliver == 0 {
            self.max_deliver = -1;
        }
        if !self.backoff.is_empty() {
            if self.backoff.iter().any(|d| d.is_zero()) {
                return Err(ConsumerError::ConfigInvalid(
                    "backoff entries must be positive".to_string(),
                ));
            }
            // The first backoff step is the effective ack wait.
            self.ack_wait = self.backoff[0];
        }
        if self.ack_wait.is_zero() {
            self.ack_wait = Duration::from_millis(defaults.ack_wait_ms);
        }
        if self.max_ack_pending == 0 && self.ack_policy != AckPolicy::None {
            self.max_ack_pending = defaults.max_ack_pending;
        }

        if let Some(ds) = &self.deliver_subject {
            if !subject::is_literal_subject(ds) {
                return Err(ConsumerError::ConfigInvalid(
                    "deliver subject must be a literal subject".to_string(),
                ));
            }
        }

        // Filters.
        if self.filter_subject.is_some() && !self.filter_subjects.is_empty() {
            return Err(ConsumerError::ConfigInvalid(
                "filter_subject and filter_subjects are mutually exclusive".to_string(),
            ));
        }
        let filters = self.filters();
        for f in &filters {
            if !subject::is_valid_filter(f) {
                return Err(ConsumerError::ConfigInvalid(format!(
                    "invalid filter subject '{}'",
                    f
                )));
            }
        }
        for (i, a) in filters.iter().enumerate() {
            for b in filters.iter().skip(i + 1) {
                if subject::subjects_overlap(a, b) {
                    return Err(ConsumerError::ConfigInvalid(format!(
                        "filter subjects '{}' and '{}' overlap",
                        a, b
                    )));
                }
            }
        }

        // Start position coherence.
        match self.deliver_policy {
            DeliverPolicy::ByStartSequence if self.opt_start_seq == 0 => {
                return Err(ConsumerError::ConfigInvalid(
                    "deliver policy by_start_sequence requires opt_start_seq".to_string(),
                ));
            }
            DeliverPolicy::ByStartTime if self.opt_start_time.is_none() => {
                return Err(ConsumerError::ConfigInvalid(
                    "deliver policy by_start_time requires opt_start_time".to_string(),
                ));
            }
            DeliverPolicy::LastPerSubject if filters.is_empty() => {
                return Err(ConsumerError::ConfigInvalid(
                    "deliver policy last_per_subject requires a filter".to_string(),
                ));
            }
            _ => {}
        }
        if self.opt_start_seq > 0 && self.deliver_policy != DeliverPolicy::ByStartSequence {
            return Err(ConsumerError::ConfigInvalid(
                "opt_start_seq requires deliver policy by_start_sequence".to_string(),
            ));
        }
        if self.opt_start_time.is_some() && self.deliver_policy != DeliverPolicy::ByStartTime {
            return Err(ConsumerError::ConfigInvalid(
                "opt_start_time requires deliver policy by_start_time".to_string(),
            ));
        }

        // Backoff interplay.
        if !self.backoff.is_empty() {
            if self.ack_policy == AckPolicy::None {
                return Err(ConsumerError::ConfigInvalid(
                    "backoff requires an ack policy".to_string(),
                ));
            }
            if self.max_deliver > 0 && self.backoff.len() > self.max_deliver as usize {
                return Err(ConsumerError::ConfigInvalid(
                    "max_deliver smaller than backoff table".to_string(),
                ));
            }
        }

        if self.sample_freq > 100 {
            return Err(ConsumerError::ConfigInvalid(
                "sample_freq must be 0-100".to_string(),
            ));
        }

        if self.is_pull_mode() {
            self.check_pull(defaults)?;
        } else {
            self.check_push()?;
        }

        Ok(())
    }

    fn check_pull(&mut self, defaults: &crate::config::ConsumerDefaults) -> Result<(), ConsumerError> {
        if self.flow_control {
            return Err(ConsumerError::ConfigInvalid(
                "flow control requires a push consumer".to_string(),
            ));
        }
        if self.idle_heartbeat.is_some() {
            return Err(ConsumerError::ConfigInvalid(
                "idle heartbeat config requires a push consumer; pull requests carry their own".to_string(),
            ));
        }
        if self.rate_limit_bps > 0 {
            return Err(ConsumerError::ConfigInvalid(
                "rate limit requires a push consumer".to_string(),
            ));
        }
        if self.max_waiting == 0 {
            self.max_waiting = defaults.max_waiting;
        }
        match self.priority_policy {
            PriorityPolicy::None => {
                if !self.priority_groups.is_empty() {
                    return Err(ConsumerError::ConfigInvalid(
                        "priority groups require a priority policy".to_string(),
                    ));
                }
            }
            _ => {
                if self.priority_groups.is_empty() {
                    return Err(ConsumerError::ConfigInvalid(
                        "priority policy requires at least one group".to_string(),
                    ));
                }
                for g in &self.priority_groups {
                    if g.is_empty() || g.len() > MAX_PRIORITY_GROUP_LEN {
                        return Err(ConsumerError::ConfigInvalid(format!(
                            "invalid priority group '{}'",
                            g
                        )));
                    }
                }
                if self.priority_policy == PriorityPolicy::PinnedClient
                    && self.pinned_ttl.map(|d| d.is_zero()).unwrap_or(true)
                {
                    return Err(ConsumerError::ConfigInvalid(
                        "pinned_client policy requires a positive pinned_ttl".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_push(&self) -> Result<(), ConsumerError> {
        if self.max_waiting != 0 {
            return Err(ConsumerError::ConfigInvalid(
                "max_waiting requires a pull consumer".to_string(),
            ));
        }
        if self.max_request_batch != 0
            || self.max_request_expires.is_some()
            || self.max_request_max_bytes != 0
        {
            return Err(ConsumerError::ConfigInvalid(
                "pull request limits require a pull consumer".to_string(),
            ));
        }
        if self.priority_policy != PriorityPolicy::None {
            return Err(ConsumerError::ConfigInvalid(
                "priority groups require a pull consumer".to_string(),
            ));
        }
        if self.flow_control {
            match self.idle_heartbeat {
                Some(hb) if hb >= MIN_FLOW_CONTROL_HEARTBEAT => {}
                _ => {
                    return Err(ConsumerError::ConfigInvalid(
                        "flow control requires an idle heartbeat of at least 100ms".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Control-plane create/update request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateConsumerRequest {
    pub stream_name: String,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub action: ConsumerAction,
}
