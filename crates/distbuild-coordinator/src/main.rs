use anyhow::{Context as _, Result};
use clap::Parser;
use distbuild_cache::FileCache;
use distbuild_coordinator::heartbeat::HeartbeatService;
use distbuild_coordinator::http::{route, CoordinatorState};
use distbuild_coordinator::orchestrator::Orchestrator;
use distbuild_scheduler::Scheduler;
use distbuild_util::config::BindAddr;
use distbuild_util::sync::{KeyLock, SingleFlight};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use slog::{info, o, Drain, Logger};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Coordinates between clients and workers: accepts build submissions, schedules jobs, and
/// brokers artifact locations.
#[derive(Parser)]
#[command(name = "distbuild-coordinator")]
struct Args {
    /// Address to bind the HTTP surface on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    bind: BindAddr,

    /// Directory the coordinator's source-file cache is rooted at.
    #[arg(long, default_value = "file-cache")]
    file_cache: PathBuf,
}

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "coordinator"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_logger();

    let source_cache = FileCache::new(&args.file_cache)
        .await
        .context("opening source-file cache")?;
    let scheduler = Scheduler::new();
    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(scheduler.clone(), source_cache.clone(), log.clone());
    let heartbeat = HeartbeatService::new(scheduler.clone(), log.clone());

    let state = Arc::new(CoordinatorState {
        orchestrator,
        heartbeat,
        source_cache,
        put_lock: KeyLock::new(),
        get_single_flight: SingleFlight::new(),
        log: log.clone(),
        shutdown: shutdown.clone(),
    });

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| route(state.clone(), req)))
        }
    });

    let server = Server::bind(&args.bind.0).serve(make_svc);
    info!(log, "coordinator listening"; "addr" => %args.bind);

    let graceful = server.with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
    });

    graceful.await.context("coordinator server error")?;
    scheduler.stop();
    Ok(())
}
