use thiserror::Error;

/// Errors the scheduler returns from its public methods. The reference design aborts the process
/// on these conditions; we surface them as typed errors instead and let callers (the heartbeat
/// service, the orchestrator) decide how to fail the affected build.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler has been stopped")]
    Stopped,
}
