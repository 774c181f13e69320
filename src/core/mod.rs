//! 核心层：错误、出站请求队列、循环调度、优雅关闭

pub mod error;
pub mod request_queue;
pub mod scheduler;
pub mod shutdown;

pub use error::{BuzzError, Result};
pub use request_queue::{QueueLimits, RequestQueue};
pub use scheduler::{EngagementScheduler, LoopSpec, LoopTask, RunOutcome, ScheduledLoop};
pub use shutdown::{
    MemoryFlushCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
