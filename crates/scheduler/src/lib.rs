pub mod policy;
pub mod scheduler;
pub mod task;

pub use policy::{AlwaysPolicy, CronPolicy, IntervalPolicy, OncePolicy, SchedulePolicy};
pub use scheduler::{SchedulerState, TaskScheduler};
pub use task::{ScheduledTask, TaskCallback, TaskExecutor};
