use anyhow::{Context as _, Result};
use clap::Parser;
use distbuild_cache::{ArtifactCache, FileCache};
use distbuild_util::config::{BindAddr, CoordinatorAddr};
use distbuild_worker::http::{self, WorkerState};
use distbuild_worker::result_cache::JobResultCache;
use distbuild_worker::run_loop::RunLoop;
use distbuild_worker::state::WorkerState as HeartbeatState;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use slog::{info, o, Drain, Logger};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pulls jobs from a coordinator, downloads inputs, executes commands, and serves its artifact
/// cache to peer workers.
#[derive(Parser)]
#[command(name = "distbuild-worker")]
struct Args {
    /// Address to bind this worker's own HTTP surface on.
    #[arg(long, default_value = "127.0.0.1:9100")]
    bind: BindAddr,

    /// This worker's externally reachable endpoint, handed to the coordinator so peer workers and
    /// the coordinator itself can reach it. Defaults to `http://<bind>`.
    #[arg(long)]
    advertise: Option<String>,

    /// The coordinator's endpoint.
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    coordinator: CoordinatorAddr,

    /// Directory this worker's local file cache (downloaded source files) is rooted at.
    #[arg(long, default_value = "worker-file-cache")]
    file_cache: PathBuf,

    /// Directory this worker's artifact cache (job outputs) is rooted at.
    #[arg(long, default_value = "worker-artifact-cache")]
    artifact_cache: PathBuf,

    /// Number of concurrent job slots. Defaults to the number of logical CPUs.
    #[arg(long)]
    slots: Option<u32>,
}

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "worker"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_logger();

    let advertise = args.advertise.clone().unwrap_or_else(|| format!("http://{}", args.bind));
    let worker_id = advertise.clone();

    let file_cache = FileCache::new(&args.file_cache).await.context("opening worker file cache")?;
    let artifact_cache = ArtifactCache::new(&args.artifact_cache)
        .await
        .context("opening worker artifact cache")?;
    let slots = args.slots.unwrap_or_else(|| num_cpus::get() as u32);
    let heartbeat_state = Arc::new(HeartbeatState::new(slots));
    let job_results = Arc::new(JobResultCache::new());
    let shutdown = CancellationToken::new();

    let run_loop = RunLoop::new(
        worker_id,
        args.coordinator.clone(),
        heartbeat_state.clone(),
        job_results.clone(),
        file_cache.clone(),
        artifact_cache.clone(),
        log.clone(),
    );

    let http_state = Arc::new(WorkerState {
        artifact_cache,
        file_cache,
        log: log.clone(),
    });

    let make_svc = make_service_fn(move |_conn| {
        let http_state = http_state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| http::route(http_state.clone(), req))) }
    });

    let server = Server::bind(&args.bind.0).serve(make_svc);
    info!(log, "worker listening"; "bind" => %args.bind, "advertise" => %advertise, "slots" => slots);

    let server_shutdown = shutdown.clone();
    let graceful = server.with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });
    let server_task = tokio::spawn(graceful);

    let loop_cancel = shutdown.clone();
    let loop_log = log.clone();
    let run_loop_task = tokio::spawn(async move {
        if let Err(e) = run_loop.run(&loop_cancel).await {
            slog::error!(loop_log, "run loop exited with an error"; "error" => %e);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(log, "received ctrl-c, shutting down");
    shutdown.cancel();

    server_task.await.context("worker server task panicked")?.context("worker server error")?;
    let _ = run_loop_task.await;
    Ok(())
}
