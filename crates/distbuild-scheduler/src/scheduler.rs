use crate::error::SchedulerError;
use crate::location_index::LocationIndex;
use crate::pending_job::PendingJob;
use distbuild_base::{proto::JobSpec, Id, JobResult};
use distbuild_util::config::WorkerId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const READY_QUEUE_CAPACITY: usize = 4096;

type Result<T> = std::result::Result<T, SchedulerError>;

/// The coordinator's in-memory job queue: a bounded FIFO of ready jobs, a job-ID -> `PendingJob`
/// registry, and an artifact-location index. This is an in-process, single-instance scheduler —
/// none of its state survives a restart, and [`Scheduler::stop`] is terminal.
pub struct Scheduler {
    registry: Mutex<HashMap<Id, Arc<PendingJob>>>,
    locations: LocationIndex,
    workers: Mutex<HashSet<WorkerId>>,
    ready_tx: mpsc::Sender<Arc<PendingJob>>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<PendingJob>>>,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE_CAPACITY);
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            locations: LocationIndex::new(),
            workers: Mutex::new(HashSet::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            stopped: AtomicBool::new(false),
        })
    }

    fn check_not_stopped(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(SchedulerError::Stopped)
        } else {
            Ok(())
        }
    }

    pub fn register_worker(&self, worker: WorkerId) -> Result<()> {
        self.check_not_stopped()?;
        self.workers.lock().unwrap().insert(worker);
        Ok(())
    }

    /// Idempotent: if `spec.job.id` is already registered, returns the existing entry without
    /// enqueueing a second time.
    pub async fn schedule_job(&self, spec: JobSpec) -> Result<Arc<PendingJob>> {
        self.check_not_stopped()?;
        let id = spec.job.id;
        let (entry, is_new) = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get(&id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let entry = Arc::new(PendingJob::new(spec));
                    registry.insert(id, entry.clone());
                    (entry, true)
                }
            }
        };
        if is_new {
            self.ready_tx
                .send(entry.clone())
                .await
                .map_err(|_| SchedulerError::Stopped)?;
        }
        Ok(entry)
    }

    /// Look up or lazily create the registry entry for `job_id`, transition it from open to
    /// closed at most once, and regardless of whether this call performed the transition, append
    /// `worker` to the artifact-location list. A completion reported before `schedule_job` is
    /// valid: it happens when the same job ID was previously built, its artifact got cached, and
    /// a heartbeat announces the cached artifact before anyone waits on it.
    ///
    /// A lazily created entry here has no `JobSpec` to enqueue — the job it belongs to was never
    /// (and will never be) scheduled on this scheduler, only completed. Returns whether an entry
    /// already existed prior to this call.
    pub fn on_job_complete(
        &self,
        worker: WorkerId,
        job_id: Id,
        result: Option<JobResult>,
    ) -> Result<bool> {
        self.check_not_stopped()?;
        let (entry, existed) = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get(&job_id) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let placeholder = JobSpec {
                        job: distbuild_base::Job {
                            id: job_id,
                            name: String::new(),
                            cmds: vec![],
                            deps: vec![],
                            inputs: vec![],
                        },
                        source_files: HashMap::new(),
                        artifacts: HashMap::new(),
                    };
                    let entry = Arc::new(PendingJob::new(placeholder));
                    registry.insert(job_id, entry.clone());
                    (entry, false)
                }
            }
        };

        // Record the location before waking any waiter via `finish`: `finish` notifies
        // `wait_finished` callers immediately, and on the multi-thread runtime one can observe
        // the completion and call `locate_artifact` before this function returns. Reporting first
        // guarantees the location is already visible by the time anyone wakes up.
        self.locations.report(job_id, worker);
        if let Some(result) = result {
            entry.finish(result);
        }
        Ok(existed)
    }

    pub fn locate_artifact(&self, job_id: &Id) -> Option<WorkerId> {
        self.locations.locate(job_id)
    }

    /// Look up a registry entry without creating or completing it. Used by the orchestrator to
    /// recover the `PendingJob` it just created via `on_job_complete` for a synthesized failure.
    pub fn get(&self, job_id: &Id) -> Option<Arc<PendingJob>> {
        self.registry.lock().unwrap().get(job_id).cloned()
    }

    /// Block until a job is ready, or `cancel` fires.
    pub async fn pick_job(&self, cancel: &CancellationToken) -> Result<Option<Arc<PendingJob>>> {
        self.check_not_stopped()?;
        let mut rx = self.ready_rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            job = rx.recv() => Ok(job),
        }
    }

    /// Non-blocking variant: returns `Ok(None)` immediately if the ready queue is empty.
    pub async fn try_pick_job(&self) -> Result<Option<Arc<PendingJob>>> {
        self.check_not_stopped()?;
        let mut rx = self.ready_rx.lock().await;
        match rx.try_recv() {
            Ok(job) => Ok(Some(job)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(SchedulerError::Stopped),
        }
    }

    /// Terminal: every public method fails fast with [`SchedulerError::Stopped`] after this
    /// returns. This is a single-instance, in-process scheduler, not something that needs to
    /// survive and resume across a restart.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn spec(id: Id) -> JobSpec {
        JobSpec {
            job: distbuild_base::Job {
                id,
                name: "x".into(),
                cmds: vec![],
                deps: vec![],
                inputs: vec![],
            },
            source_files: StdHashMap::new(),
            artifacts: StdHashMap::new(),
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
    async fn schedule_is_idempotent() {
        let sched = Scheduler::new();
        let id = Id([1; 16]);
        let a = sched.schedule_job(spec(id)).await.unwrap();
        let b = sched.schedule_job(spec(id)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let cancel = CancellationToken::new();
        let picked = sched.pick_job(&cancel).await.unwrap().unwrap();
        assert_eq!(picked.spec.job.id, id);
        // Only one enqueue happened despite two `schedule_job` calls.
        assert!(sched.try_pick_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_safe_completion_before_schedule() {
        let sched = Scheduler::new();
        let id = Id([2; 16]);
        let worker = WorkerId::new("w1");

        let existed = sched.on_job_complete(worker.clone(), id, Some(result(id))).unwrap();
        assert!(!existed);

        let entry = sched.schedule_job(spec(id)).await.unwrap();
        assert!(entry.is_finished());
        assert_eq!(entry.result().unwrap().id, id);
        assert_eq!(sched.locate_artifact(&id).unwrap(), worker);

        // Scheduling after a replayed completion must not re-enqueue the job: there is nothing
        // left to run.
        assert!(sched.try_pick_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn on_job_complete_reports_existence_correctly() {
        let sched = Scheduler::new();
        let id = Id([3; 16]);
        sched.schedule_job(spec(id)).await.unwrap();
        let existed = sched
            .on_job_complete(WorkerId::new("w1"), id, Some(result(id)))
            .unwrap();
        assert!(existed);
    }

    #[tokio::test]
    async fn pick_job_blocks_until_cancelled() {
        let sched = Scheduler::new();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let picked = sched.pick_job(&cancel).await.unwrap();
        assert!(picked.is_none());
    }

    #[tokio::test]
    async fn stop_fails_every_method_fast() {
        let sched = Scheduler::new();
        sched.stop();
        assert_matches::assert_matches!(
            sched.schedule_job(spec(Id([1; 16]))).await,
            Err(SchedulerError::Stopped)
        );
        assert_matches::assert_matches!(
            sched.on_job_complete(WorkerId::new("w1"), Id([1; 16]), None),
            Err(SchedulerError::Stopped)
        );
        assert_matches::assert_matches!(sched.try_pick_job().await, Err(SchedulerError::Stopped));
    }

    #[tokio::test]
    async fn try_pick_job_nonblocking_on_empty_queue() {
        let sched = Scheduler::new();
        assert!(sched.try_pick_job().await.unwrap().is_none());
    }
}
