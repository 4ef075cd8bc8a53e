pub mod envelope;
pub mod process_state;
pub mod task;

pub use envelope::{MessageEnvelope, MessageMode};
pub use process_state::{Offset, ProcessState, ProcessorState};
pub use task::{TaskId, TaskResponse, TaskState};
