mod limits;
mod orchestrator;
mod retry;
mod scheduler;
mod worker;

pub use limits::TimeLimits;
pub use orchestrator::{Orchestrator, RunSummary, SourceRuntime};
pub use retry::RetryPolicy;
pub use scheduler::{schedules, Schedule, Scheduler};
pub use worker::{Worker, WorkerPool};
