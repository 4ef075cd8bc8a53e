pub mod batch;
pub mod processor;

pub use batch::ParallelBatchExecutor;
pub use processor::{
    BatchContext, BatchExecutor, MessageHandler, MessageProcessor, MessageProcessorBuilder,
    SequentialBatchExecutor,
};
