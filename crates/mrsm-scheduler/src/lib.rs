//! Schedule expression parsing, job lifecycle state, rotating job logs,
//! and the local job supervisor (spec §4.7).

pub mod job;
pub mod rotating_log;
pub mod schedule;
pub mod supervisor;

pub use job::{Executor, Job, JobState, RestartPolicy};
pub use rotating_log::{RotatingLog, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES};
pub use schedule::{Clause, Schedule, TimeUnit};
pub use supervisor::Supervisor;
