pub mod amqp;
pub mod lock;
pub mod memory_queue;
pub mod memory_store;
pub mod metrics;
pub mod sqlite_store;

pub use amqp::{AmqpConfig, AmqpReceiver, AmqpSender};
pub use lock::LocalLockService;
pub use memory_queue::{MemoryQueue, MemoryQueueConfig};
pub use memory_store::MemoryOffsetStore;
pub use metrics::MetricsCollector;
pub use sqlite_store::SqliteOffsetStore;
