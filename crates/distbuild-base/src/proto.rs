//! Wire envelopes for the HTTP surface between clients, the coordinator, and workers.

use crate::{Graph, Id, Job, JobResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of `POST /coordinator/build`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildRequest {
    pub graph: Graph,
}

/// First object in the `/coordinator/build` response stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildStarted {
    pub id: Id,
    pub missing_files: Vec<Id>,
}

/// Body of `POST /coordinator/signal`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignalRequest {
    pub upload_done: Option<UploadDone>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UploadDone {}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SignalResponse {}

/// Subsequent objects in the `/coordinator/build` response stream, one per job completion plus a
/// terminal record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_finished: Option<JobResult>,
    pub build_failed: Option<BuildFailed>,
    pub build_finished: Option<BuildFinished>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildFailed {
    pub error: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BuildFinished {}

/// Constructed by the coordinator at signal time and handed to a worker in a `HeartbeatResponse`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub job: Job,
    /// file-ID -> logical path, scoped to just the files this job's `inputs` reference.
    pub source_files: HashMap<Id, std::path::PathBuf>,
    /// dep job-ID -> worker endpoint to fetch that dependency's artifact from.
    pub artifacts: HashMap<Id, String>,
}

/// Body of `POST /coordinator/heartbeat`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub free_slots: u32,
    pub finished_job: Vec<JobResult>,
    pub added_artifacts: Vec<Id>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub jobs_to_run: HashMap<Id, JobSpec>,
}
