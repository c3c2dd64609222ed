//! Heartbeat delta accumulator: job completions and newly-committed artifacts pile up here between
//! heartbeat cycles, and the run loop drains them into the next outgoing request.

use distbuild_base::{Id, JobResult};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct Delta {
    finished: Vec<JobResult>,
    added_artifacts: Vec<Id>,
}

/// Tracks this worker's available execution slots and the not-yet-reported results of its work.
pub struct WorkerState {
    free_slots: AtomicU32,
    delta: Mutex<Delta>,
}

impl WorkerState {
    pub fn new(slots: u32) -> Self {
        Self {
            free_slots: AtomicU32::new(slots),
            delta: Mutex::new(Delta::default()),
        }
    }

    /// Claim one execution slot. Returns `false` if none are free.
    pub fn try_claim_slot(&self) -> bool {
        self.free_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub fn release_slot(&self) {
        self.free_slots.fetch_add(1, Ordering::SeqCst);
    }

    pub fn free_slots(&self) -> u32 {
        self.free_slots.load(Ordering::SeqCst)
    }

    pub async fn record_finished(&self, result: JobResult) {
        self.delta.lock().await.finished.push(result);
    }

    pub async fn record_added_artifact(&self, id: Id) {
        self.delta.lock().await.added_artifacts.push(id);
    }

    /// Drain the accumulated delta for inclusion in the next heartbeat. Anything recorded after
    /// this call belongs to the following cycle, not this one.
    pub async fn take_delta(&self) -> (Vec<JobResult>, Vec<Id>) {
        let mut delta = self.delta.lock().await;
        (
            std::mem::take(&mut delta.finished),
            std::mem::take(&mut delta.added_artifacts),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_slot_fails_once_exhausted() {
        let state = WorkerState::new(1);
        assert!(state.try_claim_slot());
        assert!(!state.try_claim_slot());
        state.release_slot();
        assert!(state.try_claim_slot());
    }

    #[tokio::test]
    async fn take_delta_drains_and_resets() {
        let state = WorkerState::new(4);
        state
            .record_finished(JobResult {
                id: Id::default(),
                exit_code: 0,
                stdout: vec![],
                stderr: vec![],
                error: None,
            })
            .await;
        state.record_added_artifact(Id::default()).await;

        let (finished, added) = state.take_delta().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(added.len(), 1);

        let (finished, added) = state.take_delta().await;
        assert!(finished.is_empty());
        assert!(added.is_empty());
    }
}
