#![allow(dead_code, unused_imports, unused_variables)]

pub mod advisory;
pub mod cluster;
pub mod config;
pub mod consumer;
pub mod stream;
pub mod utils;

pub use crate::cluster::{BufferedNode, ConsensusNode, ConsumerOp};
pub use crate::consumer::{
    AckPolicy, Consumer, ConsumerAction, ConsumerConfig, ConsumerError, ConsumerInfo,
    DeliverPolicy, PriorityPolicy, ReplayPolicy,
};
pub use crate::stream::{
    Envelope, MemoryStore, MessageStore, RetentionPolicy, StoredMessage, Stream, StreamConfig,
};

/// Install the default tracing subscriber (RUST_LOG-driven). Embedders with
/// their own subscriber just skip this.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
