use distbuild_base::{proto::JobSpec, JobResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// A scheduler entry: created on first schedule OR on first out-of-order completion report
/// (heartbeat replay of a cached artifact). `finished` transitions open -> closed exactly once;
/// after it closes, `result` is immutable.
pub struct PendingJob {
    pub spec: JobSpec,
    closed: AtomicBool,
    notify: Notify,
    result: Mutex<Option<JobResult>>,
}

impl PendingJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    /// Transition `closed` from false to true at most once, recording `result` on the winning
    /// transition. Returns whether this call performed the transition (false if some earlier
    /// call already closed it).
    pub fn finish(&self, result: JobResult) -> bool {
        // `notified()` must be constructed by waiters before they observe `closed`, so there's no
        // lost-wakeup window between our CAS and `notify_waiters`.
        match self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                *self.result.lock().unwrap() = Some(result);
                self.notify.notify_waiters();
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block until `finish` has been called, then return a clone of the stable result.
    pub async fn wait_finished(&self) -> JobResult {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return self.result.lock().unwrap().clone().expect("closed implies result set");
            }
            notified.await;
        }
    }

    pub fn result(&self) -> Option<JobResult> {
        self.result.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distbuild_base::Id;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn spec() -> JobSpec {
        JobSpec {
            job: distbuild_base::Job {
                id: Id([1; 16]),
                name: "x".into(),
                cmds: vec![],
                deps: vec![],
                inputs: vec![],
            },
            source_files: HashMap::new(),
            artifacts: HashMap::new(),
        }
    }

    fn result(id: Id) -> JobResult {
        JobResult {
            id,
            exit_code: 0,
            stdout: vec![],
            stderr: vec![],
            error: None,
        }
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_stable() {
        let pj = PendingJob::new(spec());
        assert!(pj.finish(result(Id([1; 16]))));
        assert!(!pj.finish(result(Id([2; 16]))));
        assert_eq!(pj.wait_finished().await.id, Id([1; 16]));
    }

    #[tokio::test]
    async fn wait_finished_unblocks_on_finish() {
        let pj = Arc::new(PendingJob::new(spec()));
        let pj2 = pj.clone();
        let waiter = tokio::spawn(async move { pj2.wait_finished().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pj.finish(result(Id([9; 16])));
        let r = waiter.await.unwrap();
        assert_eq!(r.id, Id([9; 16]));
    }
}
