pub mod cache;
pub mod catalog;
pub mod kv;
pub mod runtime;
pub mod stream;

pub use cache::TtlCache;
pub use catalog::{ArmSpec, Catalog, ExperimentUpdate};
pub use kv::{KvStore, MemoryKvStore, SledKvStore};
pub use runtime::RuntimeStore;
pub use stream::{FeedbackStream, MessageId, SledFeedbackStream};
