//! Stream handle: the consumer side of a stream
//!
//! Owns the shared outbound queue, the message store handle, and a
//! non-owning map of its consumers keyed by name. Publishing here is for
//! embedders and tests; the full ingest pipeline lives outside this
//! subsystem.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::advisory::{AdvisorySink, LogSink};
use crate::cluster::ConsensusNode;
use crate::consumer::config::{ConsumerAction, ConsumerConfig};
use crate::consumer::errors::ConsumerError;
use crate::consumer::{Consumer, ConsumerArgs};
use crate::stream::message::Envelope;
use crate::stream::store::{MemoryStore, MessageStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

/// Interest lookup consumed by push activity and pull waiter validation.
/// The default implementation treats every subject as subscribed, which is
/// right for embedders without a router.
pub trait InterestLookup: Send + Sync {
    fn has_interest(&self, subject: &str) -> bool;
}

pub struct OpenInterest;

impl InterestLookup for OpenInterest {
    fn has_interest(&self, _subject: &str) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub name: String,
    pub retention: RetentionPolicy,
    pub replicas: usize,
    /// Durable consumer state lands here when set; memory-only otherwise.
    pub state_dir: Option<std::path::PathBuf>,
}

impl StreamConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            retention: RetentionPolicy::Limits,
            replicas: 1,
            state_dir: None,
        }
    }
}

pub struct Stream {
    cfg: StreamConfig,
    store: Arc<MemoryStore>,
    consumers: DashMap<String, Arc<Consumer>>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    interest: Arc<dyn InterestLookup>,
    advisories: Arc<dyn AdvisorySink>,
    ack_tx: mpsc::UnboundedSender<u64>,
    self_ref: Mutex<Weak<Stream>>,
}

impl Stream {
    pub fn new(cfg: StreamConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        Self::with_parts(cfg, Arc::new(OpenInterest), Arc::new(LogSink))
    }

    pub fn with_parts(
        cfg: StreamConfig,
        interest: Arc<dyn InterestLookup>,
        advisories: Arc<dyn AdvisorySink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<u64>();
        let store = Arc::new(MemoryStore::new());

        // Ack-back drain: under interest/workqueue retention an acked
        // message is reclaimable once its consumers are done with it.
        let reclaim_store = store.clone();
        let retention = cfg.retention;
        let stream_name = cfg.name.clone();
        tokio::spawn(async move {
            while let Some(seq) = ack_rx.recv().await {
                if retention != RetentionPolicy::Limits && reclaim_store.remove_msg(seq) {
                    debug!("[Stream:{}] Reclaimed acked seq={}", stream_name, seq);
                }
            }
        });

        let stream = Arc::new(Self {
            cfg,
            store,
            consumers: DashMap::new(),
            outbound_tx,
            interest,
            advisories,
            ack_tx,
            self_ref: Mutex::new(Weak::new()),
        });
        *stream.self_ref.lock() = Arc::downgrade(&stream);

        (stream, outbound_rx)
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    pub fn memory_store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    // --- Publish (test/embedder surface) ---

    pub fn publish(&self, subject: &str, payload: Bytes) -> u64 {
        self.publish_with_headers(subject, None, payload)
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: Option<Bytes>,
        payload: Bytes,
    ) -> u64 {
        let seq = self.store.append(subject, headers, payload);
        for entry in self.consumers.iter() {
            entry.value().signal_new_messages(subject, seq);
        }
        seq
    }

    // --- Consumer lifecycle ---

    pub fn create_consumer(
        &self,
        cfg: ConsumerConfig,
        action: ConsumerAction,
    ) -> Result<Arc<Consumer>, ConsumerError> {
        self.create_consumer_with_node(cfg, action, None)
    }

    pub fn create_consumer_with_node(
        &self,
        mut cfg: ConsumerConfig,
        action: ConsumerAction,
        node: Option<Arc<dyn ConsensusNode>>,
    ) -> Result<Arc<Consumer>, ConsumerError> {
        cfg.check()?;
        if cfg.num_replicas > self.cfg.replicas {
            return Err(ConsumerError::ConfigInvalid(format!(
                "consumer replicas ({}) exceed stream replicas ({})",
                cfg.num_replicas, self.cfg.replicas
            )));
        }

        let name = match &cfg.durable_name {
            Some(durable) => durable.clone(),
            None => Uuid::new_v4().simple().to_string()[..16].to_string(),
        };

        if let Some(existing) = self.consumers.get(&name) {
            return match action {
                ConsumerAction::Create => Err(ConsumerError::ConfigInvalid(format!(
                    "consumer '{}' already exists",
                    name
                ))),
                ConsumerAction::Update | ConsumerAction::CreateOrUpdate => {
                    let consumer = existing.value().clone();
                    drop(existing);
                    consumer.update_config(cfg)?;
                    Ok(consumer)
                }
            };
        }
        if action == ConsumerAction::Update {
            return Err(ConsumerError::NotFound);
        }

        let consumer = Consumer::spawn(ConsumerArgs {
            stream_name: self.cfg.name.clone(),
            name: name.clone(),
            cfg,
            msgs: self.store(),
            interest: self.interest.clone(),
            advisories: self.advisories.clone(),
            node,
            outbound: self.outbound_tx.clone(),
            stream_acks: self.ack_tx.clone(),
            retention: self.cfg.retention,
            stream: self.self_ref.lock().clone(),
            state_dir: self.cfg.state_dir.clone(),
        })?;

        info!("[Stream:{}] Created consumer '{}'", self.cfg.name, name);
        self.consumers.insert(name, consumer.clone());
        Ok(consumer)
    }

    pub fn lookup_consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.get(name).map(|e| e.value().clone())
    }

    pub async fn delete_consumer(&self, name: &str) -> Result<(), ConsumerError> {
        let consumer = self
            .lookup_consumer(name)
            .ok_or(ConsumerError::NotFound)?;
        consumer.delete().await;
        Ok(())
    }

    pub(crate) fn remove_consumer(&self, name: &str) {
        if self.consumers.remove(name).is_some() {
            info!("[Stream:{}] Removed consumer '{}'", self.cfg.name, name);
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}
