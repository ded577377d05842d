//! Advisory events
//!
//! Fire-and-forget notifications about consumer lifecycle and delivery
//! accounting. Events are JSON and published through a sink the embedder
//! provides; nothing in the core waits on them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const ADVISORY_PREFIX: &str = "$JS.EVENT.ADVISORY.CONSUMER";
pub const METRIC_PREFIX: &str = "$JS.EVENT.METRIC.CONSUMER";

#[derive(Clone, Debug, Serialize)]
pub struct Advisory {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AdvisoryEvent,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum AdvisoryEvent {
    #[serde(rename = "io.nats.jetstream.advisory.v1.consumer_action")]
    ConsumerAction {
        action: String,
        stream: String,
        consumer: String,
    },
    #[serde(rename = "io.nats.jetstream.advisory.v1.max_deliver")]
    MaxDeliver {
        stream: String,
        consumer: String,
        stream_seq: u64,
        deliveries: u64,
    },
    #[serde(rename = "io.nats.jetstream.advisory.v1.nak")]
    Nak {
        stream: String,
        consumer: String,
        consumer_seq: u64,
        stream_seq: u64,
        deliveries: u64,
    },
    #[serde(rename = "io.nats.jetstream.advisory.v1.terminated")]
    Terminated {
        stream: String,
        consumer: String,
        consumer_seq: u64,
        stream_seq: u64,
        deliveries: u64,
        reason: String,
    },
    #[serde(rename = "io.nats.jetstream.metric.v1.consumer_ack")]
    AckSample {
        stream: String,
        consumer: String,
        consumer_seq: u64,
        stream_seq: u64,
        deliveries: u64,
        ack_time_ns: i64,
    },
    #[serde(rename = "io.nats.jetstream.advisory.v1.consumer_pause")]
    Paused {
        stream: String,
        consumer: String,
        paused: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause_until: Option<DateTime<Utc>>,
    },
    #[serde(rename = "io.nats.jetstream.advisory.v1.consumer_group_pinned")]
    Pinned {
        stream: String,
        consumer: String,
        group: String,
        pinned_id: String,
    },
    #[serde(rename = "io.nats.jetstream.advisory.v1.consumer_group_unpinned")]
    Unpinned {
        stream: String,
        consumer: String,
        group: String,
        reason: String,
    },
}

impl Advisory {
    pub fn new(event: AdvisoryEvent) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// `$JS.EVENT.ADVISORY.CONSUMER.<KIND>.<stream>.<consumer>`
pub fn advisory_subject(kind: &str, stream: &str, consumer: &str) -> String {
    format!("{}.{}.{}.{}", ADVISORY_PREFIX, kind, stream, consumer)
}

pub trait AdvisorySink: Send + Sync {
    fn publish(&self, subject: String, advisory: Advisory);
}

/// Default sink: logs the serialized event and drops it.
pub struct LogSink;

impl AdvisorySink for LogSink {
    fn publish(&self, subject: String, advisory: Advisory) {
        if let Ok(json) = serde_json::to_string(&advisory) {
            tracing::debug!("[Advisory] {} {}", subject, json);
        }
    }
}

/// Channel-backed sink for tests and embedders that forward advisories.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(String, Advisory)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Advisory)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AdvisorySink for ChannelSink {
    fn publish(&self, subject: String, advisory: Advisory) {
        let _ = self.tx.send((subject, advisory));
    }
}
