pub mod message;
pub mod store;
pub mod stream;
pub mod subject;

pub use message::{Envelope, StoredMessage};
pub use store::{FastState, MemoryStore, MessageStore, StoreError};
pub use stream::{InterestLookup, OpenInterest, RetentionPolicy, Stream, StreamConfig};
