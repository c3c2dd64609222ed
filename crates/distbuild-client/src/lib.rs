//! The client side of a build: submit a graph, upload whatever source files the coordinator is
//! missing, signal that uploads are done, then stream per-job status updates back to a listener
//! until the build finishes or fails.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use distbuild_base::proto::{BuildRequest, BuildStarted, SignalRequest, StatusUpdate, UploadDone};
use distbuild_base::{Graph, Id, JobResult};
use distbuild_util::config::CoordinatorAddr;
use distbuild_util::net::for_each_json_line;
use futures::StreamExt as _;
use slog::{debug, info, o, Logger};
use std::path::{Path, PathBuf};

/// Caps how many source files this client uploads to the coordinator at once.
const MAX_CONCURRENT_UPLOADS: usize = 20;

/// Callbacks fired as a submitted build progresses. Implementations should not block for long —
/// the client drives the whole build from the task that calls these.
#[async_trait]
pub trait BuildListener: Send + Sync {
    async fn on_job_stdout(&self, job_id: Id, stdout: &[u8]) {
        let _ = (job_id, stdout);
    }
    async fn on_job_stderr(&self, job_id: Id, stderr: &[u8]) {
        let _ = (job_id, stderr);
    }
    async fn on_job_finished(&self, job_id: Id) {
        let _ = job_id;
    }
    async fn on_job_failed(&self, job_id: Id, exit_code: i32, error: &str) {
        let _ = (job_id, exit_code, error);
    }
}

pub struct Client {
    log: Logger,
    coordinator: CoordinatorAddr,
    source_dir: PathBuf,
    http: reqwest::Client,
}

impl Client {
    pub fn new(log: Logger, coordinator: CoordinatorAddr, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            log,
            coordinator,
            source_dir: source_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Submit `graph` and drive it to completion, reporting per-job progress to `listener`.
    /// Returns once the coordinator reports the build finished; an `Err` covers both transport
    /// failures and a build-level failure reported by the coordinator.
    pub async fn build(&self, graph: Graph, listener: &(dyn BuildListener)) -> Result<()> {
        info!(self.log, "build starting"; "jobs" => graph.jobs.len());

        let build_url = self
            .coordinator
            .url()
            .join("/coordinator/build")
            .context("building /build URL")?;
        let response = self
            .http
            .post(build_url)
            .json(&BuildRequest { graph: graph.clone() })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("starting build")?;

        let mut stream = response.bytes_stream();
        let first_line = read_one_json_line::<BuildStarted>(&mut stream)
            .await
            .context("reading BuildStarted")?
            .context("coordinator closed the build stream before sending BuildStarted")?;

        let log = self.log.new(o!("build_id" => first_line.id.to_string()));
        info!(log, "build started"; "missing_files" => first_line.missing_files.len());

        self.upload_missing_files(&graph, &first_line.missing_files, &log).await?;
        info!(log, "upload of missing files complete");

        let signal_url = self
            .coordinator
            .url()
            .join(&format!("/coordinator/signal?build_id={}", first_line.id))
            .context("building /signal URL")?;
        self.http
            .post(signal_url)
            .json(&SignalRequest {
                upload_done: Some(UploadDone {}),
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("signaling upload done")?;

        self.listen(stream, listener, &log).await
    }

    async fn upload_missing_files(&self, graph: &Graph, missing: &[Id], log: &Logger) -> Result<()> {
        let uploads = missing.iter().map(|&file_id| async move {
            let logical_path = graph
                .source_files
                .get(&file_id)
                .with_context(|| format!("file {file_id} not present in graph.source_files"))?;
            self.upload_one_file(file_id, logical_path, log).await
        });

        futures::stream::iter(uploads)
            .buffer_unordered(MAX_CONCURRENT_UPLOADS)
            .collect::<Vec<Result<()>>>()
            .await
            .into_iter()
            .collect::<Result<()>>()
    }

    async fn upload_one_file(&self, file_id: Id, logical_path: &Path, log: &Logger) -> Result<()> {
        let full_path = self.source_dir.join(logical_path);
        let metadata = tokio::fs::metadata(&full_path)
            .await
            .with_context(|| format!("stat {}", full_path.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", full_path.display());
        }

        let bytes = tokio::fs::read(&full_path)
            .await
            .with_context(|| format!("reading {}", full_path.display()))?;
        let url = self
            .coordinator
            .url()
            .join(&format!("/coordinator/file?id={file_id}"))
            .context("building file upload URL")?;
        self.http
            .put(url)
            .body(bytes)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("uploading file {file_id} ({})", full_path.display()))?;

        debug!(log, "uploaded source file"; "file" => %file_id, "path" => %full_path.display());
        Ok(())
    }

    async fn listen(
        &self,
        stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
        listener: &(dyn BuildListener),
        log: &Logger,
    ) -> Result<()> {
        let mut failure = None;
        for_each_json_line::<StatusUpdate, _, _, _, _>(stream, |update| async {
            if let Some(finished) = &update.job_finished {
                handle_job_finished(finished, listener, log).await;
            }
            if let Some(failed) = &update.build_failed {
                failure = Some(failed.error.clone());
            }
            if update.build_finished.is_some() {
                info!(log, "build finished");
            }
            Ok(())
        })
        .await
        .context("reading build status stream")?;

        match failure {
            Some(error) => bail!("build failed: {error}"),
            None => Ok(()),
        }
    }
}

async fn handle_job_finished(finished: &JobResult, listener: &(dyn BuildListener), log: &Logger) {
    debug!(log, "job finished"; "job" => %finished.id, "exit_code" => finished.exit_code);
    let job_id = finished.id;
    match &finished.error {
        Some(error) => listener.on_job_failed(job_id, finished.exit_code, error).await,
        None => listener.on_job_finished(job_id).await,
    }
    listener.on_job_stderr(job_id, &finished.stderr).await;
    listener.on_job_stdout(job_id, &finished.stdout).await;
}

async fn read_one_json_line<T: serde::de::DeserializeOwned>(
    stream: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
) -> Result<Option<T>> {
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading first response line")?;
        buf.extend_from_slice(&chunk);
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = &buf[..pos];
            let value = serde_json::from_slice(line).context("parsing first response line")?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}
