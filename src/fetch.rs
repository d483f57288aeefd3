//! Fallback delivery: pull the blob straight from the upstream registry,
//! teeing the bytes into the local data dir so the node becomes a seeder for
//! the next one to ask.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use reqwest::Client;
use serde_derive::Deserialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;

use crate::error::fetch::Result;
use crate::error::FetchError;
use crate::manager::BlobTaskManager;
use crate::seed;
use crate::task::{BlobStatus, BlobTask};

/// Bearer challenge parameters advertised by the registry probe.
#[derive(Debug, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
}

/// Parses a `WWW-Authenticate: Bearer realm="…",service="…"` header.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for param in params.split(',') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service?,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

/// Obtains a pull token for `repo`, following the registry's bearer
/// challenge. An empty token means the registry requires no auth.
pub async fn registry_auth_token(http: &Client, registry_base: &str, repo: &str) -> Result<String> {
    let probe = http.get(format!("{registry_base}/v2/")).send().await?;
    match probe.status() {
        StatusCode::OK => return Ok(String::new()),
        StatusCode::UNAUTHORIZED => {}
        status => return Err(FetchError::Probe(status)),
    }

    let challenge = probe
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer_challenge)
        .ok_or(FetchError::MissingChallenge)?;

    let scope = format!("repository:{repo}:pull");
    let resp = http
        .get(&challenge.realm)
        .query(&[("service", challenge.service.as_str()), ("scope", scope.as_str())])
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(FetchError::Probe(resp.status()));
    }

    let body: TokenResponse = resp.json().await?;
    if body.token.is_empty() {
        Ok(body.access_token)
    } else {
        Ok(body.token)
    }
}

/// Serves a blob over the fallback channel.
///
/// The first consumer to arrive while the ingest claim is free tees the
/// upstream bytes to disk and promotes the task to a seeder; concurrent
/// consumers stream the upstream body through untouched. A blob that has
/// already been ingested is served from the data dir without going upstream.
pub async fn fallback_download(manager: &Arc<BlobTaskManager>, task: &Arc<BlobTask>) -> Response {
    let digest = task.digest().to_string();
    let (repo, status) = {
        let state = task.lock().await;
        (state.repo_name.clone(), state.status)
    };

    if status == BlobStatus::Seeding {
        match serve_local(manager, &digest).await {
            Ok(resp) => return resp,
            Err(e) => {
                log::warn!("unable to serve ingested blob {digest} locally, going upstream: {e}")
            }
        }
    }

    if repo.is_empty() {
        log::error!("fallback for digest {digest} has no repository name, cannot authenticate");
        return gateway_error(&FetchError::MissingRepo.to_string());
    }

    let token = match registry_auth_token(manager.http(), manager.registry_base(), &repo).await {
        Ok(token) => token,
        Err(e) => {
            log::error!("fallback auth failed for digest {digest}: {e}");
            return gateway_error(&format!("fallback auth failed: {e}"));
        }
    };

    let url = format!("{}/v2/{repo}/blobs/{digest}", manager.registry_base());
    let mut request = manager.http().get(&url);
    if !token.is_empty() {
        request = request.bearer_auth(&token);
    }
    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("fallback request failed for digest {digest}: {e}");
            return gateway_error(&format!("fallback request failed: {e}"));
        }
    };
    if resp.status() != StatusCode::OK {
        log::error!(
            "fallback for digest {digest} got unexpected status {}",
            resp.status()
        );
        return gateway_error(&format!("fallback unexpected status: {}", resp.status()));
    }
    let content_length = resp.content_length();

    // at most one consumer ever holds the ingest claim
    let claimed = {
        let mut state = task.lock().await;
        let claimable = matches!(
            state.status,
            BlobStatus::Initializing | BlobStatus::Downloading
        );
        if claimable && !state.ingesting {
            state.status = BlobStatus::Downloading;
            state.ingesting = true;
            true
        } else {
            false
        }
    };
    if !claimed {
        return blob_response(&digest, content_length, Body::from_stream(resp.bytes_stream()));
    }

    let temp_path = manager
        .data_dir()
        .join(format!("{digest}{}", seed::TMP_SUFFIX));
    let out = match File::create(&temp_path).await {
        Ok(out) => out,
        Err(e) => {
            log::error!("cannot create temp file for digest {digest}: {e}");
            release_claim(task).await;
            return internal_error(&format!("cannot create temp file: {e}"));
        }
    };

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
    let ingest = Ingest {
        manager: manager.clone(),
        task: task.clone(),
        final_path: manager.blob_path(&digest),
        temp_path,
        digest,
        content_length,
    };
    let digest_header = ingest.digest.clone();
    tokio::spawn(ingest.run(resp, out, tx));

    blob_response(
        &digest_header,
        content_length,
        Body::from_stream(ReceiverStream::new(rx)),
    )
}

/// One claimed ingest: the background tee between the upstream body, the
/// client channel and the temp file.
struct Ingest {
    manager: Arc<BlobTaskManager>,
    task: Arc<BlobTask>,
    digest: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    content_length: Option<u64>,
}

impl Ingest {
    async fn run(
        self,
        mut resp: reqwest::Response,
        mut out: File,
        tx: mpsc::Sender<io::Result<Bytes>>,
    ) {
        let mut written: u64 = 0;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = out.write_all(&chunk).await {
                        log::error!("failed to write temp file for digest {}: {e}", self.digest);
                        let _ = tx.send(Err(e)).await;
                        self.abort().await;
                        return;
                    }
                    written += chunk.len() as u64;
                    // the rename below is only valid if the client saw every
                    // byte; a dropped receiver aborts the ingest
                    if tx.send(Ok(chunk)).await.is_err() {
                        log::warn!("client disconnected during fallback for digest {}", self.digest);
                        self.abort().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("upstream body failed for digest {}: {e}", self.digest);
                    let _ = tx.send(Err(io::Error::other(e))).await;
                    self.abort().await;
                    return;
                }
            }
        }

        if let Some(expected) = self.content_length {
            if written != expected {
                let e = FetchError::LengthMismatch {
                    expected,
                    actual: written,
                };
                log::error!("digest {}: {e}", self.digest);
                self.abort().await;
                return;
            }
        }
        if let Err(e) = out.sync_all().await {
            log::error!("failed to sync temp file for digest {}: {e}", self.digest);
            self.abort().await;
            return;
        }
        drop(out);

        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.final_path).await {
            log::error!(
                "{} fallback downloading failed to rename tmp file: {e}",
                self.digest
            );
            self.abort().await;
            return;
        }
        self.promote().await;
    }

    /// Removes the temp file and releases the ingest claim so a later
    /// request may try again.
    async fn abort(&self) {
        let _ = tokio::fs::remove_file(&self.temp_path).await;
        release_claim(&self.task).await;
    }

    /// Registers the ingested file with the engine and marks the task
    /// seeding. At most once per task: a task that is already `Seeding` is
    /// left untouched.
    async fn promote(&self) {
        let mut state = self.task.lock().await;
        if state.status == BlobStatus::Seeding {
            state.ingesting = false;
            return;
        }
        // seeding registration and the status transition must be atomic;
        // this is the one sanctioned network call under the task mutex
        if let Err(e) = seed::seed_from_file(&self.manager, &self.digest, &self.final_path).await {
            log::error!("failed to seed ingested digest {}: {e}", self.digest);
        }
        state.status = BlobStatus::Seeding;
        state.ingesting = false;
    }
}

async fn release_claim(task: &Arc<BlobTask>) {
    task.lock().await.ingesting = false;
}

/// Streams an already ingested blob from the data dir.
async fn serve_local(manager: &Arc<BlobTaskManager>, digest: &str) -> io::Result<Response> {
    let file = File::open(manager.blob_path(digest)).await?;
    let len = file.metadata().await?.len();
    Ok(blob_response(
        digest,
        Some(len),
        Body::from_stream(ReaderStream::new(file)),
    ))
}

/// Standard blob delivery headers around `body`.
fn blob_response(digest: &str, content_length: Option<u64>, body: Body) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("Docker-Content-Digest", digest);
    if let Some(len) = content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    match builder.body(body) {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("invalid blob response for digest {digest}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub(crate) fn gateway_error(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::engine::fake::{FakeEngine, FakeTorrent};
    use crate::index::IndexClient;

    const DIGEST: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";

    #[test]
    fn parses_a_quoted_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:foo:pull""#,
        )
        .expect("challenge");
        assert_eq!(
            challenge,
            BearerChallenge {
                realm: "https://auth.example/token".to_string(),
                service: "registry.example".to_string(),
            }
        );
    }

    #[test]
    fn rejects_non_bearer_and_incomplete_challenges() {
        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer service=\"y\"").is_none());
    }

    #[tokio::test]
    async fn an_open_registry_needs_no_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/")
            .with_status(200)
            .create_async()
            .await;

        let token = registry_auth_token(&Client::new(), &server.url(), "library/alpine")
            .await
            .unwrap();
        assert_eq!(token, "");
    }

    #[tokio::test]
    async fn follows_the_bearer_challenge_to_the_token_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        server
            .mock("GET", "/v2/")
            .with_status(401)
            .with_header(
                "WWW-Authenticate",
                &format!(r#"Bearer realm="{base}/token",service="registry.example""#),
            )
            .create_async()
            .await;
        let token_mock = server
            .mock("GET", "/token")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("service".into(), "registry.example".into()),
                mockito::Matcher::UrlEncoded("scope".into(), "repository:library/alpine:pull".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"token":"T"}"#)
            .create_async()
            .await;

        let token = registry_auth_token(&Client::new(), &base, "library/alpine")
            .await
            .unwrap();
        assert_eq!(token, "T");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn prefers_token_but_accepts_access_token() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        server
            .mock("GET", "/v2/")
            .with_status(401)
            .with_header(
                "WWW-Authenticate",
                &format!(r#"Bearer realm="{base}/token",service="s""#),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/token")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"access_token":"A"}"#)
            .create_async()
            .await;

        let token = registry_auth_token(&Client::new(), &base, "r").await.unwrap();
        assert_eq!(token, "A");
    }

    #[tokio::test]
    async fn unexpected_probe_statuses_are_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/")
            .with_status(500)
            .create_async()
            .await;

        let err = registry_auth_token(&Client::new(), &server.url(), "r")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Probe(status) if status == StatusCode::INTERNAL_SERVER_ERROR));
    }

    fn manager_for(registry: &str, index: &str, data_dir: &std::path::Path) -> Arc<BlobTaskManager> {
        let torrent = FakeTorrent::new(DIGEST, b"");
        torrent.ready.fire();
        BlobTaskManager::new(
            FakeEngine::new(torrent),
            IndexClient::new(index),
            data_dir,
            registry,
            "http://tracker.test/announce",
        )
    }

    /// Builds a dormant fallback-mode task without racing a live driver.
    fn fallback_task(repo: &str) -> Arc<BlobTask> {
        let task = BlobTask::new(DIGEST, "", repo);
        task.fallback().fire();
        task
    }

    async fn body_bytes(resp: Response) -> Bytes {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("collect body")
    }

    async fn wait_status(task: &Arc<BlobTask>, want: BlobStatus) {
        timeout(Duration::from_secs(5), async {
            loop {
                if task.status().await == want {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("status never reached {want}"));
    }

    #[tokio::test]
    async fn ingests_the_blob_while_streaming_it_to_the_client() {
        let data_dir = tempfile::tempdir().unwrap();
        let mut registry = mockito::Server::new_async().await;
        registry
            .mock("GET", "/v2/")
            .with_status(200)
            .create_async()
            .await;
        registry
            .mock("GET", format!("/v2/library/alpine/blobs/{DIGEST}").as_str())
            .with_status(200)
            .with_body(b"BYTES")
            .create_async()
            .await;
        let mut index = mockito::Server::new_async().await;
        index
            .mock("GET", "/infohash")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        index
            .mock("POST", "/infohash")
            .with_status(200)
            .create_async()
            .await;

        let manager = manager_for(&registry.url(), &index.url(), data_dir.path());
        let task = fallback_task("library/alpine");

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get("Docker-Content-Digest")
                .unwrap()
                .to_str()
                .unwrap(),
            DIGEST
        );
        assert_eq!(body_bytes(resp).await.as_ref(), b"BYTES");

        wait_status(&task, BlobStatus::Seeding).await;
        assert_eq!(std::fs::read(data_dir.path().join(DIGEST)).unwrap(), b"BYTES");
        assert!(!data_dir
            .path()
            .join(format!("{DIGEST}{TMP_SUFFIX}", TMP_SUFFIX = seed::TMP_SUFFIX))
            .exists());
    }

    #[tokio::test]
    async fn upstream_failures_leave_no_blob_behind() {
        let data_dir = tempfile::tempdir().unwrap();
        let mut registry = mockito::Server::new_async().await;
        registry
            .mock("GET", "/v2/")
            .with_status(200)
            .create_async()
            .await;
        registry
            .mock("GET", format!("/v2/library/alpine/blobs/{DIGEST}").as_str())
            .with_status(500)
            .create_async()
            .await;

        let manager = manager_for(&registry.url(), "http://unused.test", data_dir.path());
        let task = fallback_task("library/alpine");

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(!data_dir.path().join(DIGEST).exists());
        assert_eq!(task.status().await, BlobStatus::Initializing);
    }

    #[tokio::test]
    async fn a_task_without_a_repo_name_is_a_gateway_error() {
        let data_dir = tempfile::tempdir().unwrap();
        let manager = manager_for("http://unused.test", "http://unused.test", data_dir.path());
        let task = fallback_task("");

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_double_ingest() {
        let data_dir = tempfile::tempdir().unwrap();
        let mut registry = mockito::Server::new_async().await;
        registry
            .mock("GET", "/v2/")
            .with_status(200)
            .create_async()
            .await;
        registry
            .mock("GET", format!("/v2/library/alpine/blobs/{DIGEST}").as_str())
            .with_status(200)
            .with_body(b"BYTES")
            .create_async()
            .await;

        let manager = manager_for(&registry.url(), "http://unused.test", data_dir.path());
        let task = fallback_task("library/alpine");
        // someone else already holds the claim
        {
            let mut state = task.lock().await;
            state.status = BlobStatus::Downloading;
            state.ingesting = true;
        }

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await.as_ref(), b"BYTES");
        // passthrough: no tee, no temp file
        assert!(!data_dir
            .path()
            .join(format!("{DIGEST}{}", seed::TMP_SUFFIX))
            .exists());
        assert!(!data_dir.path().join(DIGEST).exists());
    }

    #[tokio::test]
    async fn a_client_abort_cleans_up_the_temp_file_and_releases_the_claim() {
        let data_dir = tempfile::tempdir().unwrap();
        let mut registry = mockito::Server::new_async().await;
        registry
            .mock("GET", "/v2/")
            .with_status(200)
            .create_async()
            .await;
        // far more bytes than the tee's channel can buffer, so the ingest is
        // still in flight when the client goes away
        let big_blob = registry
            .mock("GET", format!("/v2/library/alpine/blobs/{DIGEST}").as_str())
            .with_status(200)
            .with_body(vec![7u8; 16 * 1024 * 1024])
            .create_async()
            .await;
        let mut index = mockito::Server::new_async().await;
        index
            .mock("GET", "/infohash")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        index
            .mock("POST", "/infohash")
            .with_status(200)
            .create_async()
            .await;

        let manager = manager_for(&registry.url(), &index.url(), data_dir.path());
        let task = fallback_task("library/alpine");

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::OK);
        // the client disconnects mid-stream
        drop(resp);

        let temp_path = data_dir
            .path()
            .join(format!("{DIGEST}{}", seed::TMP_SUFFIX));
        timeout(Duration::from_secs(5), async {
            loop {
                let released = !task.lock().await.ingesting;
                if released && !temp_path.exists() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("ingest never aborted");

        // nothing was promoted and the claim is free again
        assert!(!data_dir.path().join(DIGEST).exists());
        {
            let state = task.lock().await;
            assert_eq!(state.status, BlobStatus::Downloading);
            assert!(!state.ingesting);
        }

        // a later request re-claims the ingest and carries it to the end
        big_blob.remove_async().await;
        registry
            .mock("GET", format!("/v2/library/alpine/blobs/{DIGEST}").as_str())
            .with_status(200)
            .with_body(b"BYTES")
            .create_async()
            .await;

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await.as_ref(), b"BYTES");
        wait_status(&task, BlobStatus::Seeding).await;
        assert_eq!(std::fs::read(data_dir.path().join(DIGEST)).unwrap(), b"BYTES");
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn an_errored_task_gets_passthrough_bytes_without_promotion() {
        let data_dir = tempfile::tempdir().unwrap();
        let mut registry = mockito::Server::new_async().await;
        registry
            .mock("GET", "/v2/")
            .with_status(200)
            .create_async()
            .await;
        registry
            .mock("GET", format!("/v2/library/alpine/blobs/{DIGEST}").as_str())
            .with_status(200)
            .with_body(b"BYTES")
            .create_async()
            .await;

        let manager = manager_for(&registry.url(), "http://unused.test", data_dir.path());
        let task = fallback_task("library/alpine");
        task.lock().await.status = BlobStatus::Error;

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await.as_ref(), b"BYTES");

        // an errored task stays a sink: bytes pass through, nothing is
        // tee'd or promoted
        assert!(!data_dir
            .path()
            .join(format!("{DIGEST}{}", seed::TMP_SUFFIX))
            .exists());
        assert!(!data_dir.path().join(DIGEST).exists());
        let state = task.lock().await;
        assert_eq!(state.status, BlobStatus::Error);
        assert!(!state.ingesting);
    }

    #[tokio::test]
    async fn an_ingested_blob_is_served_from_disk() {
        let data_dir = tempfile::tempdir().unwrap();
        std::fs::write(data_dir.path().join(DIGEST), b"LOCAL").unwrap();

        let manager = manager_for("http://unused.test", "http://unused.test", data_dir.path());
        let task = fallback_task("library/alpine");
        task.lock().await.status = BlobStatus::Seeding;

        let resp = fallback_download(&manager, &task).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_LENGTH)
                .unwrap()
                .to_str()
                .unwrap(),
            "5"
        );
        assert_eq!(body_bytes(resp).await.as_ref(), b"LOCAL");
    }
}
