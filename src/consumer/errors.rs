use crate::cluster::ClusterError;
use crate::stream::store::StoreError;

/// Consumer-level failures. Config and lookup problems surface to the
/// caller synchronously; delivery-path conditions stay internal.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerError {
    ConfigInvalid(String),
    BadRequest(String),
    NotFound,
    Deleted,
    NotLeader,
    Leaderless,
    /// Delivery stalled on the ack-pending ceiling. Never client-visible.
    MaxAckPending,
    StoreFailed(StoreError),
    Cluster(ClusterError),
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerError::ConfigInvalid(msg) => write!(f, "invalid consumer config: {}", msg),
            ConsumerError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ConsumerError::NotFound => write!(f, "consumer not found"),
            ConsumerError::Deleted => write!(f, "consumer was deleted"),
            ConsumerError::NotLeader => write!(f, "not the consumer leader"),
            ConsumerError::Leaderless => write!(f, "consumer group is leaderless"),
            ConsumerError::MaxAckPending => write!(f, "max ack pending reached"),
            ConsumerError::StoreFailed(e) => write!(f, "consumer store failed: {}", e),
            ConsumerError::Cluster(e) => write!(f, "cluster error: {}", e),
        }
    }
}

impl std::error::Error for ConsumerError {}

impl From<StoreError> for ConsumerError {
    fn from(e: StoreError) -> Self {
        ConsumerError::StoreFailed(e)
    }
}

impl From<ClusterError> for ConsumerError {
    fn from(e: ClusterError) -> Self {
        ConsumerError::Cluster(e)
    }
}
