pub mod node;
pub mod ops;

pub use node::{BufferedNode, ClusterError, ConsensusNode};
pub use ops::ConsumerOp;
