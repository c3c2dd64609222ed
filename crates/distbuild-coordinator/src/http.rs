//! HTTP surface: JSON request/response for `/build`, `/signal`, `/heartbeat`, and raw bytes for
//! `/file`. Routing is a plain match on (method, path) rather than a framework router, matching
//! the small, hand-wired services this workspace's teacher builds on top of `hyper`.

use crate::heartbeat::HeartbeatService;
use crate::orchestrator::Orchestrator;
use crate::status_writer::StatusWriter;
use distbuild_base::proto::{BuildRequest, HeartbeatRequest, SignalRequest};
use distbuild_base::Id;
use distbuild_cache::{CacheError, FileCache};
use distbuild_util::net::JsonLineSender;
use distbuild_util::sync::{KeyLock, SingleFlight};
use hyper::body::Bytes;
use hyper::{Body, Method, Request, Response, StatusCode};
use slog::{error, Logger};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct CoordinatorState {
    pub orchestrator: Arc<Orchestrator>,
    pub heartbeat: HeartbeatService,
    pub source_cache: FileCache,
    pub put_lock: KeyLock<Id>,
    pub get_single_flight: SingleFlight<Id, Result<Bytes, String>>,
    pub log: Logger,
    pub shutdown: CancellationToken,
}

fn plain_text(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(msg.into()))
        .unwrap()
}

fn query_param<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    let query = req.uri().query()?;
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == name).then_some(v)
    })
}

fn parse_id_param(req: &Request<Body>, name: &str) -> Result<Id, Response<Body>> {
    match query_param(req, name).and_then(|s| s.parse::<Id>().ok()) {
        Some(id) => Ok(id),
        None => Err(plain_text(StatusCode::BAD_REQUEST, format!("missing or malformed {name}"))),
    }
}

pub async fn route(
    state: Arc<CoordinatorState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method().clone(), req.uri().path()) {
        (Method::POST, "/coordinator/build") => handle_build(&state, req).await,
        (Method::POST, "/coordinator/signal") => handle_signal(&state, req).await,
        (Method::POST, "/coordinator/heartbeat") => handle_heartbeat(&state, req).await,
        (Method::GET, "/coordinator/file") => handle_file_get(&state, req).await,
        (Method::PUT, "/coordinator/file") => handle_file_put(&state, req).await,
        (_, "/coordinator/file") => plain_text(StatusCode::METHOD_NOT_ALLOWED, "use GET or PUT"),
        _ => plain_text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn handle_build(state: &Arc<CoordinatorState>, req: Request<Body>) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let build_request: BuildRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, format!("malformed graph: {e}")),
    };

    let (sender, body) = Body::channel();
    let (status_writer, done_rx) = StatusWriter::new(JsonLineSender::new(sender));
    let status_writer = Arc::new(status_writer);

    let build_id = match state.orchestrator.start_build(build_request.graph, status_writer).await {
        Ok(id) => id,
        Err(e) => {
            error!(state.log, "start_build failed"; "error" => %e);
            return plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let _ = done_rx.await;
        orchestrator.forget_build(build_id);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json-seq")
        .body(body)
        .unwrap()
}

async fn handle_signal(state: &Arc<CoordinatorState>, req: Request<Body>) -> Response<Body> {
    let build_id = match parse_id_param(&req, "build_id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let signal: SignalRequest = if bytes.is_empty() {
        SignalRequest::default()
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => return plain_text(StatusCode::BAD_REQUEST, format!("malformed signal: {e}")),
        }
    };

    match state.orchestrator.signal_build(build_id, signal).await {
        Ok(resp) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&resp).unwrap()))
            .unwrap(),
        Err(e) => {
            error!(state.log, "signal_build failed"; "build" => %build_id, "error" => %e);
            plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_heartbeat(state: &Arc<CoordinatorState>, req: Request<Body>) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let heartbeat: HeartbeatRequest = match serde_json::from_slice(&bytes) {
        Ok(h) => h,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, format!("malformed heartbeat: {e}")),
    };

    match state.heartbeat.handle(heartbeat, &state.shutdown).await {
        Ok(resp) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&resp).unwrap()))
            .unwrap(),
        Err(e) => plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_file_get(state: &Arc<CoordinatorState>, req: Request<Body>) -> Response<Body> {
    let id = match parse_id_param(&req, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let cache = state.source_cache.clone();
    let result = state
        .get_single_flight
        .work(id, || async move {
            let handle = cache.get(id).await.map_err(|e| e.to_string())?;
            let bytes = tokio::fs::read(handle.path()).await.map_err(|e| e.to_string());
            handle.release();
            bytes.map(Bytes::from)
        })
        .await;

    match result {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(Body::from(bytes))
            .unwrap(),
        Err(e) if e.contains("no committed entry") => plain_text(StatusCode::NOT_FOUND, e),
        Err(e) => plain_text(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn handle_file_put(state: &Arc<CoordinatorState>, req: Request<Body>) -> Response<Body> {
    let id = match parse_id_param(&req, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, e.to_string()),
    };

    // Serialize concurrent uploads of the same ID so the ErrExists retry below is deterministic.
    let _guard = state.put_lock.lock(id).await;

    let mut attempted_retry = false;
    loop {
        match state.source_cache.write(id).await {
            Ok(mut handle) => {
                if let Err(e) = handle.write_all(&bytes).await {
                    return plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                }
                if let Err(e) = handle.commit().await {
                    return plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                }
                return plain_text(StatusCode::OK, "");
            }
            Err(CacheError::Exists) if !attempted_retry => {
                // One-shot: another upload of this exact ID already completed. Remove and retry
                // once so two concurrent identical PUTs both see success rather than one erroring.
                attempted_retry = true;
                let _ = state.source_cache.remove(id).await;
            }
            Err(CacheError::Exists) => return plain_text(StatusCode::OK, ""),
            Err(e) => return plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}
