//! Drives the two-phase start/signal protocol for one build: `StartBuild` publishes the sorted
//! job list and per-job source-file subsets, `SignalBuild` walks it, waiting on each job's
//! dependencies before dispatching it to the scheduler, and streams a status update per
//! completion.

use crate::status_writer::StatusWriter;
use anyhow::{Context as _, Result};
use distbuild_base::proto::{
    BuildFailed, BuildFinished, BuildStarted, JobSpec, SignalRequest, SignalResponse,
};
use distbuild_base::proto::StatusUpdate;
use distbuild_base::{Graph, Id, Job, JobResult};
use distbuild_cache::FileCache;
use distbuild_scheduler::Scheduler;
use distbuild_util::config::WorkerId;
use distbuild_util::sync::HappensBefore;
use slog::{o, warn, Logger};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

/// The identity the orchestrator reports to the scheduler when it synthesizes a `JobResult` for
/// an unlocatable dependency artifact. Never a real worker, but the scheduler's location index
/// treats all reporters alike.
const COORDINATOR_SYNTHETIC_WORKER: &str = "coordinator";

struct BuildState {
    jobs: Vec<Job>,
    job_source_files: HashMap<Id, HashMap<Id, PathBuf>>,
    status: Arc<StatusWriter>,
}

pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    source_cache: FileCache,
    happens_before: HappensBefore<Id>,
    builds: Mutex<HashMap<Id, Arc<BuildState>>>,
    log: Logger,
}

impl Orchestrator {
    pub fn new(scheduler: Arc<Scheduler>, source_cache: FileCache, log: Logger) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            source_cache,
            happens_before: HappensBefore::new(),
            builds: Mutex::new(HashMap::new()),
            log,
        })
    }

    /// Every file the client listed is treated as missing: this protocol path doesn't
    /// deduplicate previously-seen source files, so the client re-uploads on every build.
    pub async fn start_build(&self, graph: Graph, status: Arc<StatusWriter>) -> Result<Id> {
        let build_id = Id::random();
        let missing_files: Vec<Id> = graph.source_files.keys().copied().collect();

        status
            .started(&BuildStarted {
                id: build_id,
                missing_files,
            })
            .await
            .context("writing BuildStarted")?;

        let sorted = graph.topo_sort();
        let mut job_source_files = HashMap::with_capacity(sorted.len());
        for job in &sorted {
            let subset: HashMap<Id, PathBuf> = graph
                .source_files
                .iter()
                .filter(|(_, path)| job.inputs.iter().any(|input| input == *path))
                .map(|(id, path)| (*id, path.clone()))
                .collect();
            job_source_files.insert(job.id, subset);
        }

        let state = Arc::new(BuildState {
            jobs: sorted,
            job_source_files,
            status,
        });

        // Publish the tuple, then release anyone blocked in `before(build_id)` — in particular a
        // concurrently-running `signal_build` call for the same build ID that started before we
        // got here.
        let builds = &self.builds;
        self.happens_before.happen(build_id, || {
            builds.lock().unwrap().insert(build_id, state);
        });

        Ok(build_id)
    }

    pub async fn signal_build(&self, build_id: Id, signal: SignalRequest) -> Result<SignalResponse> {
        self.happens_before.before(build_id).await;

        if signal.upload_done.is_none() {
            return Ok(SignalResponse::default());
        }

        let state = self
            .builds
            .lock()
            .unwrap()
            .get(&build_id)
            .cloned()
            .context("signal_build observed no state published by start_build")?;

        let total_jobs = state.jobs.len();
        let finished_count = Arc::new(AtomicUsize::new(0));
        let mut pending_by_id = HashMap::with_capacity(total_jobs);
        let mut join_set = JoinSet::new();

        for job in &state.jobs {
            let mut artifacts: HashMap<Id, String> = HashMap::new();
            let mut dep_failure: Option<String> = None;

            for dep in &job.deps {
                let dep_pending = pending_by_id
                    .get(dep)
                    .cloned()
                    .context("topological order violated: dep not yet scheduled")?;
                let dep_result: JobResult = dep_pending.wait_finished().await;
                if dep_result.error.is_some() {
                    dep_failure = Some(format!(
                        "dependency {dep} of job {} failed with an infrastructural error",
                        job.id
                    ));
                    break;
                }
                match self.scheduler.locate_artifact(dep) {
                    Some(worker) => {
                        artifacts.insert(*dep, worker.as_str().to_owned());
                    }
                    None => {
                        // Invariant violation: a heartbeat reporting this completion raced the
                        // topology walk. The reference design treats this as fatal; we surface it
                        // as a build error for this job instead (see DESIGN.md).
                        dep_failure = Some(format!(
                            "dependency {dep} of job {} finished but its artifact location is unknown",
                            job.id
                        ));
                        break;
                    }
                }
            }

            let pending = if let Some(error) = dep_failure {
                warn!(self.log, "job cannot run"; "job" => %job.id, "reason" => %error);
                let result = JobResult {
                    id: job.id,
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    error: Some(error),
                };
                self.scheduler.on_job_complete(
                    WorkerId::new(COORDINATOR_SYNTHETIC_WORKER),
                    job.id,
                    Some(result),
                )?;
                self.scheduler
                    .get(&job.id)
                    .context("on_job_complete just registered this id")?
            } else {
                let source_files = state
                    .job_source_files
                    .get(&job.id)
                    .cloned()
                    .unwrap_or_default();
                self.scheduler
                    .schedule_job(JobSpec {
                        job: job.clone(),
                        source_files,
                        artifacts,
                    })
                    .await?
            };

            pending_by_id.insert(job.id, pending.clone());

            let status = state.status.clone();
            let finished_count = finished_count.clone();
            join_set.spawn(async move {
                let result = pending.wait_finished().await;
                let count = finished_count.fetch_add(1, Ordering::AcqRel) + 1;
                let build_failed = result.error.clone().map(|error| BuildFailed { error });
                let build_finished = (count == total_jobs).then_some(BuildFinished::default());
                status
                    .updated(&StatusUpdate {
                        job_finished: Some(result),
                        build_failed,
                        build_finished,
                    })
                    .await
            });
        }

        while let Some(res) = join_set.join_next().await {
            res.context("status watcher task panicked")??;
        }

        for file_id in state.job_source_files.values().flat_map(|m| m.keys()) {
            if let Err(e) = self.source_cache.remove(*file_id).await {
                warn!(self.log, "failed to evict uploaded source file after build";
                    "file" => %file_id, "error" => %e);
            }
        }

        Ok(SignalResponse::default())
    }

    /// Drop this build's published state, in particular its `StatusWriter` — releasing the last
    /// reference closes the `/build` response stream. Called once the stream has emitted
    /// `BuildFinished` and has nothing left to say.
    pub fn forget_build(&self, build_id: Id) {
        self.builds.lock().unwrap().remove(&build_id);
    }
}
