pub mod ack;
pub mod acks;
pub mod config;
pub mod core;
pub mod delivery;
pub mod errors;
pub mod state;
pub mod store;
pub mod waiting;

pub use self::config::{
    AckPolicy, ConsumerAction, ConsumerConfig, DeliverPolicy, PriorityPolicy, ReplayPolicy,
};
pub use self::core::{Consumer, ConsumerArgs, ConsumerInfo};
pub use self::errors::ConsumerError;
