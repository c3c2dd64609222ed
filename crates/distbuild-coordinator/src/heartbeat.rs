//! Per-worker reconciliation: consume the deltas a worker reports (finished jobs, newly-added
//! artifact locations) and hand back a batch of jobs for it to run next.

use anyhow::Result;
use distbuild_base::proto::{HeartbeatRequest, HeartbeatResponse};
use distbuild_scheduler::Scheduler;
use distbuild_util::config::WorkerId;
use slog::{warn, Logger};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How many extra non-blocking attempts to make filling each remaining heartbeat slot before
/// giving up on it. This is a greedy batch-fill, not a guarantee: an empty queue after the
/// retries just means the worker gets fewer jobs than it had free slots for.
const TRY_PICK_RETRIES_PER_SLOT: usize = 4;

pub struct HeartbeatService {
    scheduler: Arc<Scheduler>,
    log: Logger,
}

impl HeartbeatService {
    pub fn new(scheduler: Arc<Scheduler>, log: Logger) -> Self {
        Self { scheduler, log }
    }

    pub async fn handle(
        &self,
        req: HeartbeatRequest,
        cancel: &CancellationToken,
    ) -> Result<HeartbeatResponse> {
        let worker = WorkerId::new(req.worker_id.clone());
        self.scheduler.register_worker(worker.clone())?;

        let mut reported: HashSet<_> = HashSet::new();
        for finished in req.finished_job {
            let existed = self
                .scheduler
                .on_job_complete(worker.clone(), finished.id, Some(finished.clone()))?;
            if !existed {
                // The reference design treats this as an invariant violation (a heartbeat
                // reporting a job the scheduler never scheduled). It's not fatal here: it's
                // exactly what happens when a worker's local job-result cache replays a job from
                // an earlier process lifetime. We just log it.
                warn!(self.log, "heartbeat reported completion of an unscheduled job";
                    "worker" => %worker, "job" => %finished.id);
            }
            reported.insert(finished.id);
        }

        for artifact_id in req.added_artifacts {
            if reported.contains(&artifact_id) {
                continue;
            }
            self.scheduler
                .on_job_complete(worker.clone(), artifact_id, None)?;
        }

        let mut jobs_to_run = HashMap::new();
        if let Some(pending) = self.scheduler.pick_job(cancel).await? {
            jobs_to_run.insert(pending.spec.job.id, pending.spec.clone());
        }

        let remaining_slots = req.free_slots.saturating_sub(1);
        for _ in 0..remaining_slots {
            let mut filled = false;
            for _ in 0..TRY_PICK_RETRIES_PER_SLOT {
                match self.scheduler.try_pick_job().await? {
                    Some(pending) => {
                        jobs_to_run.insert(pending.spec.job.id, pending.spec.clone());
                        filled = true;
                        break;
                    }
                    None => tokio::task::yield_now().await,
                }
            }
            if !filled {
                break;
            }
        }

        Ok(HeartbeatResponse { jobs_to_run })
    }
}
