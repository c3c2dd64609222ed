//! Job execution (§4.7): materialize a job's inputs, run its commands in order against a render
//! context, and commit (or abort) its output artifact. Nonzero exit codes are normal results;
//! only infrastructural failures — a dep whose artifact vanished, a command that failed to spawn,
//! an I/O error — populate `JobResult.Error` and abort the output.

use crate::download;
use crate::render::{self, RenderContext};
use anyhow::{Context as _, Result};
use distbuild_base::proto::JobSpec;
use distbuild_base::{Id, JobResult};
use distbuild_cache::{ArtifactCache, FileCache};
use distbuild_util::config::CoordinatorAddr;

/// Runs a job end to end and reports, alongside its result, which dependency artifacts this call
/// had to fetch peer-to-peer (as opposed to ones already resident in the local cache) — the run
/// loop reports those IDs to the coordinator as `AddedArtifacts` on the next heartbeat.
pub async fn run_job(
    spec: &JobSpec,
    client: &reqwest::Client,
    coordinator: &CoordinatorAddr,
    file_cache: &FileCache,
    artifact_cache: &ArtifactCache,
) -> (JobResult, Vec<Id>) {
    let job_id = spec.job.id;
    match run_job_inner(spec, client, coordinator, file_cache, artifact_cache).await {
        Ok((result, newly_downloaded)) => (result, newly_downloaded),
        Err(e) => (
            JobResult {
                id: job_id,
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
                error: Some(e.to_string()),
            },
            Vec::new(),
        ),
    }
}

async fn run_job_inner(
    spec: &JobSpec,
    client: &reqwest::Client,
    coordinator: &CoordinatorAddr,
    file_cache: &FileCache,
    artifact_cache: &ArtifactCache,
) -> Result<(JobResult, Vec<Id>)> {
    let job_id = spec.job.id;

    let output = artifact_cache
        .create(job_id)
        .await
        .with_context(|| format!("creating output artifact for job {job_id}"))?;

    let source_dir = tempfile::tempdir().context("creating source working directory")?;
    for (&file_id, logical_path) in &spec.source_files {
        if let Err(e) =
            download::link_source_file(client, coordinator, file_cache, source_dir.path(), file_id, logical_path)
                .await
        {
            let _ = output.abort().await;
            return Err(e.context(format!("materializing source file {file_id} for job {job_id}")));
        }
    }

    let mut dep_handles = Vec::with_capacity(spec.artifacts.len());
    let mut deps = std::collections::HashMap::with_capacity(spec.artifacts.len());
    let mut newly_downloaded = Vec::new();
    for (&dep_id, worker_endpoint) in &spec.artifacts {
        if !artifact_cache.contains(&dep_id) {
            newly_downloaded.push(dep_id);
        }
        if let Err(e) = download::ensure_artifact(client, worker_endpoint, artifact_cache, dep_id).await {
            let _ = output.abort().await;
            return Err(e.context(format!("downloading dep artifact {dep_id} for job {job_id}")));
        }
        match artifact_cache.get(dep_id).await {
            Ok(handle) => {
                deps.insert(dep_id, handle.path().to_path_buf());
                dep_handles.push(handle);
            }
            Err(e) => {
                let _ = output.abort().await;
                return Err(e).with_context(|| format!("read-locking dep artifact {dep_id} for job {job_id}"));
            }
        }
    }

    let ctx = RenderContext {
        source_dir: source_dir.path().to_path_buf(),
        output_dir: output.path().to_path_buf(),
        deps,
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = 0;

    for cmd in &spec.job.cmds {
        match render::run_cmd(cmd, &ctx).await {
            Ok(out) => {
                stdout.extend_from_slice(&out.stdout);
                stderr.extend_from_slice(&out.stderr);
                exit_code = out.exit_code;
                if exit_code != 0 {
                    break;
                }
            }
            Err(e) => {
                for handle in dep_handles {
                    handle.release();
                }
                let _ = output.abort().await;
                return Err(e.context(format!("executing a command of job {job_id}")));
            }
        }
    }

    for handle in dep_handles {
        handle.release();
    }

    output.commit().await.with_context(|| format!("committing output artifact for job {job_id}"))?;

    Ok((
        JobResult {
            id: job_id,
            exit_code,
            stdout,
            stderr,
            error: None,
        },
        newly_downloaded,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use distbuild_base::{Cmd, Job};
    use std::collections::HashMap;

    async fn caches() -> (FileCache, ArtifactCache, tempfile::TempDir, tempfile::TempDir) {
        let file_dir = tempfile::tempdir().unwrap();
        let artifact_dir = tempfile::tempdir().unwrap();
        let file_cache = FileCache::new(file_dir.path()).await.unwrap();
        let artifact_cache = ArtifactCache::new(artifact_dir.path()).await.unwrap();
        (file_cache, artifact_cache, file_dir, artifact_dir)
    }

    #[tokio::test]
    async fn echo_job_commits_an_empty_artifact_with_captured_stdout() {
        let (file_cache, artifact_cache, _fd, _ad) = caches().await;
        let client = reqwest::Client::new();
        let coordinator: CoordinatorAddr = "http://127.0.0.1:1".parse().unwrap();

        let job_id = distbuild_base::Id([0x31; 16]);
        let spec = JobSpec {
            job: Job {
                id: job_id,
                name: "echo".into(),
                cmds: vec![Cmd::Exec {
                    argv: vec!["echo".into(), "OK".into()],
                    working_dir: ".".into(),
                    environ: vec![],
                }],
                deps: vec![],
                inputs: vec![],
            },
            source_files: HashMap::new(),
            artifacts: HashMap::new(),
        };

        let (result, _added) = run_job(&spec, &client, &coordinator, &file_cache, &artifact_cache).await;
        assert!(result.error.is_none());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"OK\n");
        assert!(artifact_cache.contains(&job_id));
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_infrastructural_error() {
        let (file_cache, artifact_cache, _fd, _ad) = caches().await;
        let client = reqwest::Client::new();
        let coordinator: CoordinatorAddr = "http://127.0.0.1:1".parse().unwrap();

        let job_id = distbuild_base::Id([0x32; 16]);
        let spec = JobSpec {
            job: Job {
                id: job_id,
                name: "fail".into(),
                cmds: vec![Cmd::Exec {
                    argv: vec!["false".into()],
                    working_dir: ".".into(),
                    environ: vec![],
                }],
                deps: vec![],
                inputs: vec![],
            },
            source_files: HashMap::new(),
            artifacts: HashMap::new(),
        };

        let (result, _added) = run_job(&spec, &client, &coordinator, &file_cache, &artifact_cache).await;
        assert!(result.error.is_none());
        assert_eq!(result.exit_code, 1);
        // The output artifact still commits: a nonzero exit finishes the job normally.
        assert!(artifact_cache.contains(&job_id));
    }

    #[tokio::test]
    async fn unspawnable_command_aborts_the_output_and_sets_error() {
        let (file_cache, artifact_cache, _fd, _ad) = caches().await;
        let client = reqwest::Client::new();
        let coordinator: CoordinatorAddr = "http://127.0.0.1:1".parse().unwrap();

        let job_id = distbuild_base::Id([0x33; 16]);
        let spec = JobSpec {
            job: Job {
                id: job_id,
                name: "broken".into(),
                cmds: vec![Cmd::Exec {
                    argv: vec!["/no/such/binary".into()],
                    working_dir: ".".into(),
                    environ: vec![],
                }],
                deps: vec![],
                inputs: vec![],
            },
            source_files: HashMap::new(),
            artifacts: HashMap::new(),
        };

        let (result, _added) = run_job(&spec, &client, &coordinator, &file_cache, &artifact_cache).await;
        assert!(result.error.is_some());
        assert!(!artifact_cache.contains(&job_id));
    }

    #[tokio::test]
    async fn cat_template_job_writes_output_artifact() {
        let (file_cache, artifact_cache, _fd, _ad) = caches().await;
        let client = reqwest::Client::new();
        let coordinator: CoordinatorAddr = "http://127.0.0.1:1".parse().unwrap();

        let job_id = distbuild_base::Id([0x34; 16]);
        let spec = JobSpec {
            job: Job {
                id: job_id,
                name: "stamp".into(),
                cmds: vec![Cmd::CatTemplate {
                    cat_template: "v1".into(),
                    cat_output: "VERSION".into(),
                }],
                deps: vec![],
                inputs: vec![],
            },
            source_files: HashMap::new(),
            artifacts: HashMap::new(),
        };

        let (result, _added) = run_job(&spec, &client, &coordinator, &file_cache, &artifact_cache).await;
        assert!(result.error.is_none());

        let handle = artifact_cache.get(job_id).await.unwrap();
        let contents = tokio::fs::read_to_string(handle.path().join("VERSION")).await.unwrap();
        handle.release();
        assert_eq!(contents, "v1");
    }
}
