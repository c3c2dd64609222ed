//! The worker's HTTP surface: `GET /worker/artifact?id=<hex>` serves a tar stream of a committed
//! output artifact to peer workers; `GET`/`PUT /worker/file?id=<hex>` mirror the coordinator's
//! file-cache API, matching the spec's note that a worker's local file cache is populated only by
//! downloads from the coordinator — nothing depends on the PUT side actually being called.

use distbuild_base::Id;
use distbuild_cache::{ArtifactCache, CacheError, FileCache};
use hyper::{Body, Method, Request, Response, StatusCode};
use slog::{error, Logger};
use std::convert::Infallible;
use std::sync::Arc;

pub struct WorkerState {
    pub artifact_cache: ArtifactCache,
    pub file_cache: FileCache,
    pub log: Logger,
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

pub async fn route(state: Arc<WorkerState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method().clone(), req.uri().path()) {
        (Method::GET, "/worker/artifact") => handle_artifact_get(&state, req).await,
        (Method::GET, "/worker/file") => handle_file_get(&state, req).await,
        (Method::PUT, "/worker/file") => handle_file_put(&state, req).await,
        (_, "/worker/file") => plain_text(StatusCode::METHOD_NOT_ALLOWED, "use GET or PUT"),
        _ => plain_text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn handle_artifact_get(state: &Arc<WorkerState>, req: Request<Body>) -> Response<Body> {
    let id = match parse_id_param(&req, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let handle = match state.artifact_cache.get(id).await {
        Ok(handle) => handle,
        Err(CacheError::NotFound) => return plain_text(StatusCode::NOT_FOUND, "artifact not found"),
        Err(e) => return plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let path = handle.path().to_path_buf();
    let bytes = distbuild_cache::tar::send(path).await;
    handle.release();

    match bytes {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/x-tar")
            .body(Body::from(bytes))
            .unwrap(),
        Err(e) => {
            error!(state.log, "failed to tar artifact for a peer"; "id" => %id, "error" => %e);
            plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_file_get(state: &Arc<WorkerState>, req: Request<Body>) -> Response<Body> {
    let id = match parse_id_param(&req, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.file_cache.get(id).await {
        Ok(handle) => {
            let bytes = tokio::fs::read(handle.path()).await;
            handle.release();
            match bytes {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/octet-stream")
                    .body(Body::from(bytes))
                    .unwrap(),
                Err(e) => plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        Err(CacheError::NotFound) => plain_text(StatusCode::NOT_FOUND, "file not found"),
        Err(e) => plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_file_put(state: &Arc<WorkerState>, req: Request<Body>) -> Response<Body> {
    let id = match parse_id_param(&req, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return plain_text(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let mut attempted_retry = false;
    loop {
        match state.file_cache.write(id).await {
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
                attempted_retry = true;
                let _ = state.file_cache.remove(id).await;
            }
            Err(CacheError::Exists) => return plain_text(StatusCode::OK, ""),
            Err(e) => return plain_text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}
