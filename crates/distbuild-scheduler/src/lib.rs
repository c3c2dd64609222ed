//! The coordinator's scheduler: a bounded ready-queue of jobs, a job-ID registry with once-only
//! completion semantics, and a bounded artifact-location index.

mod error;
mod location_index;
mod pending_job;
mod scheduler;

pub use error::SchedulerError;
pub use pending_job::PendingJob;
pub use scheduler::Scheduler;
