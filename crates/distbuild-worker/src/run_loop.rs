//! The heartbeat-driven pull loop (§4.6): drain delta state into a `HeartbeatRequest`, POST it,
//! launch a concurrent task per job the coordinator hands back, wait for them all, repeat.

use crate::executor;
use crate::result_cache::JobResultCache;
use crate::state::WorkerState;
use anyhow::{Context as _, Result};
use distbuild_base::proto::{HeartbeatRequest, HeartbeatResponse};
use distbuild_cache::{ArtifactCache, FileCache};
use distbuild_util::config::CoordinatorAddr;
use slog::{info, warn, Logger};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct RunLoop {
    worker_id: String,
    client: reqwest::Client,
    coordinator: CoordinatorAddr,
    state: Arc<WorkerState>,
    job_results: Arc<JobResultCache>,
    file_cache: FileCache,
    artifact_cache: ArtifactCache,
    log: Logger,
}

impl RunLoop {
    pub fn new(
        worker_id: String,
        coordinator: CoordinatorAddr,
        state: Arc<WorkerState>,
        job_results: Arc<JobResultCache>,
        file_cache: FileCache,
        artifact_cache: ArtifactCache,
        log: Logger,
    ) -> Self {
        Self {
            worker_id,
            client: reqwest::Client::new(),
            coordinator,
            state,
            job_results,
            file_cache,
            artifact_cache,
            log,
        }
    }

    /// Run heartbeat cycles until `cancel` fires. Each cycle blocks on the coordinator's
    /// heartbeat response (which itself blocks until a job is available or the coordinator's own
    /// context expires), so this never busy-polls.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut cycle = 0u64;
        while !cancel.is_cancelled() {
            self.cycle(cycle).await?;
            cycle += 1;
        }
        Ok(())
    }

    async fn cycle(&self, cycle: u64) -> Result<()> {
        let (finished_job, added_artifacts) = self.state.take_delta().await;
        let request = HeartbeatRequest {
            worker_id: self.worker_id.clone(),
            free_slots: self.state.free_slots(),
            finished_job,
            added_artifacts,
        };

        info!(self.log, "heartbeat cycle starting"; "cycle" => cycle, "free_slots" => request.free_slots);

        let url = self
            .coordinator
            .url()
            .join("/coordinator/heartbeat")
            .context("building heartbeat URL")?;
        let response: HeartbeatResponse = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("sending heartbeat")?
            .json()
            .await
            .context("parsing heartbeat response")?;

        info!(self.log, "heartbeat response"; "cycle" => cycle, "jobs_to_run" => response.jobs_to_run.len());

        let mut tasks = JoinSet::new();
        for (_job_id, spec) in response.jobs_to_run {
            let client = self.client.clone();
            let coordinator = self.coordinator.clone();
            let state = self.state.clone();
            let job_results = self.job_results.clone();
            let file_cache = self.file_cache.clone();
            let artifact_cache = self.artifact_cache.clone();
            let log = self.log.clone();

            self.state.try_claim_slot();
            tasks.spawn(async move {
                run_one_job(spec, &client, &coordinator, &state, &job_results, &file_cache, &artifact_cache, &log)
                    .await;
                state.release_slot();
            });
        }

        while let Some(res) = tasks.join_next().await {
            res.context("job task panicked")?;
        }

        Ok(())
    }
}

async fn run_one_job(
    spec: distbuild_base::proto::JobSpec,
    client: &reqwest::Client,
    coordinator: &CoordinatorAddr,
    state: &WorkerState,
    job_results: &JobResultCache,
    file_cache: &FileCache,
    artifact_cache: &ArtifactCache,
    log: &Logger,
) {
    let job_id = spec.job.id;

    if let Some(cached) = job_results.get(&job_id) {
        slog::debug!(log, "job result cache hit"; "job" => %job_id);
        state.record_finished(cached).await;
        return;
    }
    slog::debug!(log, "job result cache miss"; "job" => %job_id);

    let (result, newly_downloaded_deps) = executor::run_job(&spec, client, coordinator, file_cache, artifact_cache).await;

    if result.is_infrastructural_failure() {
        warn!(log, "job failed with an infrastructural error"; "job" => %job_id, "error" => ?result.error);
    } else {
        job_results.insert(result.clone());
    }

    for dep_id in newly_downloaded_deps {
        state.record_added_artifact(dep_id).await;
    }
    state.record_added_artifact(job_id).await;
    state.record_finished(result).await;
}
