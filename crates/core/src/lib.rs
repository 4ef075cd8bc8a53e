pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::{AppConfig, LogConfig, LogFormat, ProcessorConfig, SchedulerConfig};
pub use errors::{PipelineError, PipelineResult};
pub use models::{
    MessageEnvelope, MessageMode, Offset, ProcessState, ProcessorState, TaskId, TaskResponse,
    TaskState,
};
pub use traits::{LockGuard, LockService, MessageReceiver, MessageSender, OffsetStore};
