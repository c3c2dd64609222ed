use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::Parser;
use distbuild_base::{Cmd, Graph, Id, Job};
use distbuild_client::{BuildListener, Client};
use distbuild_util::config::CoordinatorAddr;
use futures::stream::{self, StreamExt as _};
use slog::{info, o, warn, Drain, Logger};
use std::path::PathBuf;

/// Submits a fixed demo build graph (a 3-job echo chain) to a coordinator, repeated
/// `--build-count` times with up to `--concurrency` builds in flight at once.
#[derive(Parser)]
#[command(name = "distbuild-client")]
struct Args {
    /// The coordinator's endpoint.
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    coordinator: CoordinatorAddr,

    /// Directory source-file paths in submitted graphs are resolved relative to.
    #[arg(long, default_value = ".")]
    source_dir: PathBuf,

    /// How many independent builds to submit.
    #[arg(long, default_value_t = 100)]
    build_count: u32,

    /// How many of those builds may be in flight at once.
    #[arg(long, default_value_t = 20)]
    concurrency: usize,
}

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "client"))
}

/// A 3-job chain, each depending on all its predecessors, that just echoes "OK". Useful as a
/// smoke test against a running coordinator + worker pool.
fn echo_chain(run: u8) -> Graph {
    let id = |stage: u8| Id([stage, run, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    let echo = |id: Id, deps: Vec<Id>| Job {
        id,
        name: "echo".to_owned(),
        cmds: vec![Cmd::Exec {
            argv: vec!["echo".to_owned(), "OK".to_owned()],
            working_dir: ".".into(),
            environ: vec![],
        }],
        deps,
        inputs: vec![],
    };

    Graph {
        jobs: vec![
            echo(id(1), vec![]),
            echo(id(2), vec![id(1)]),
            echo(id(3), vec![id(1), id(2)]),
        ],
        source_files: Default::default(),
    }
}

struct LoggingListener {
    log: Logger,
}

#[async_trait]
impl BuildListener for LoggingListener {
    async fn on_job_finished(&self, job_id: Id) {
        info!(self.log, "job finished"; "job" => %job_id);
    }

    async fn on_job_failed(&self, job_id: Id, exit_code: i32, error: &str) {
        warn!(self.log, "job failed"; "job" => %job_id, "exit_code" => exit_code, "error" => error);
    }

    async fn on_job_stdout(&self, job_id: Id, stdout: &[u8]) {
        if !stdout.is_empty() {
            info!(self.log, "job stdout"; "job" => %job_id, "bytes" => stdout.len());
        }
    }

    async fn on_job_stderr(&self, job_id: Id, stderr: &[u8]) {
        if !stderr.is_empty() {
            warn!(self.log, "job stderr"; "job" => %job_id, "bytes" => stderr.len());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_logger();

    let client = Client::new(log.clone(), args.coordinator.clone(), args.source_dir.clone());
    let listener = LoggingListener { log: log.clone() };

    info!(log, "submitting builds"; "count" => args.build_count, "concurrency" => args.concurrency);

    let results: Vec<Result<()>> = stream::iter(0..args.build_count)
        .map(|run| {
            let client = &client;
            let listener = &listener;
            async move { client.build(echo_chain(run as u8), listener).await.context(format!("build {run}")) }
        })
        .buffer_unordered(args.concurrency)
        .collect()
        .await;

    let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
    if !failures.is_empty() {
        for err in &failures {
            warn!(log, "build failed"; "error" => %err);
        }
        anyhow::bail!("{} of {} builds failed", failures.len(), args.build_count);
    }

    info!(log, "all builds finished successfully");
    Ok(())
}
