pub mod offset_store;
pub mod receiver;

pub use offset_store::{LockGuard, LockService, OffsetStore};
pub use receiver::{MessageReceiver, MessageSender};
