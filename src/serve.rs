//! HTTP surface: the transparent `/v2` reverse proxy and the blob
//! dispatcher.
//!
//! Blob GETs race the task's two readiness signals and the client's
//! cancellation; whichever delivery channel becomes viable first serves the
//! response. Everything that is not a blob request is proxied verbatim to
//! the upstream registry.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::fetch;
use crate::manager::BlobTaskManager;
use crate::task::BlobTask;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BlobTaskManager>,
}

/// Builds the router: paths under `/v2` containing `/blobs/` go to the
/// dispatcher, everything else to the reverse proxy.
pub fn router(manager: Arc<BlobTaskManager>) -> Router {
    Router::new()
        .route("/v2/*path", any(v2_entry))
        .fallback(proxy)
        .with_state(AppState { manager })
}

/// Splits a `/v2` subpath at the last `/blobs/` into (repo, digest).
/// Returns `None` when either side is empty.
fn split_blob_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind("/blobs/")?;
    let prefix = &path[..idx];
    let repo = prefix.strip_prefix('/').unwrap_or(prefix);
    let digest = &path[idx + "/blobs/".len()..];
    if repo.is_empty() || digest.is_empty() {
        return None;
    }
    Some((repo, digest))
}

async fn v2_entry(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request,
) -> Response {
    if let Some((repo, digest)) = split_blob_path(&path) {
        return dispatch_blob(&state.manager, digest, repo, CancellationToken::new()).await;
    }
    proxy(State(state), req).await
}

/// Waits for the task's delivery decision and serves the blob from whichever
/// channel becomes viable first.
///
/// `cancel` aborts the wait with a 408 and leaves the background driver
/// untouched; under hyper a disconnecting client additionally drops this
/// future, releasing the same resources.
pub async fn dispatch_blob(
    manager: &Arc<BlobTaskManager>,
    digest: &str,
    repo: &str,
    cancel: CancellationToken,
) -> Response {
    let task = manager.ensure_task(digest, "", repo).await;
    tokio::select! {
        _ = task.torrent_ready().fired() => p2p_download(&task).await,
        _ = task.fallback().fired() => fetch::fallback_download(manager, &task).await,
        _ = cancel.cancelled() => {
            log::info!("request for digest {digest} was cancelled");
            StatusCode::REQUEST_TIMEOUT.into_response()
        }
    }
}

/// Streams the torrent's file as the response body. The reader suspends on
/// pieces the engine has not fetched yet.
async fn p2p_download(task: &Arc<BlobTask>) -> Response {
    let torrent = { task.lock().await.torrent.clone() };
    let Some(torrent) = torrent else {
        log::error!("p2p download failed for digest {}: no torrent handle", task.digest());
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let reader = match torrent.reader().await {
        Ok(reader) => reader,
        Err(e) => {
            log::error!("unable to open torrent reader for digest {}: {e}", task.digest());
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, torrent.content_length())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", torrent.display_name()),
        )
        .header("Docker-Content-Digest", task.digest());
    match builder.body(Body::from_stream(ReaderStream::new(reader))) {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("invalid p2p response for digest {}: {e}", task.digest());
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Transparent reverse proxy for everything that is not a blob request.
/// Rewrites scheme, host and the Host header to the upstream registry and
/// streams bodies in both directions.
async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let manager = &state.manager;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", manager.registry_base(), path_and_query);
    log::info!("proxy request: {} {}", req.method(), req.uri().path());

    let method = req.method().clone();
    let mut headers = req.headers().clone();
    headers.remove(header::HOST);

    let upstream = manager
        .http()
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()))
        .send()
        .await;
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            log::error!("proxy to {url} failed: {e}");
            return fetch::gateway_error(&format!("proxy failed: {e}"));
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    match builder.body(Body::from_stream(upstream.bytes_stream())) {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("invalid proxied response: {e}");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
