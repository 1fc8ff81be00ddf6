//! HTTP adapter: implements [`RemoteStore`] against the Dropbox v2 API.
//! RPC endpoints live on the api host, upload/download endpoints on the
//! content host. Transient failures are retried here with bounded backoff
//! so the sync core never sees them; an unauthorized response forces one
//! token refresh and a single retry.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::auth::TokenProvider;
use crate::config::Config;
use crate::remote::{ListPage, RemoteEntry, RemoteKind, RemoteStore};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Non-success answer from the remote service. Carried inside the anyhow
/// chain so callers can branch on the status.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub body: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http {}: {}", self.status, self.body)
    }
}

impl std::error::Error for HttpStatusError {}

pub struct DropboxClient {
    http: HttpClient,
    api_url: String,
    content_url: String,
    tokens: TokenProvider,
    call_timeout: Duration,
}

impl DropboxClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        if cfg.app_key.is_empty() || cfg.refresh_token.is_empty() {
            anyhow::bail!("app_key and refresh_token are required; check the config file");
        }
        let http = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("dropsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(DropboxClient {
            http,
            api_url: cfg.api_url.clone(),
            content_url: cfg.content_url.clone(),
            tokens: TokenProvider::new(
                &cfg.api_url,
                &cfg.app_key,
                &cfg.app_secret,
                &cfg.refresh_token,
            ),
            call_timeout: Duration::from_secs(cfg.call_timeout_seconds),
        })
    }

    async fn rpc<T: for<'de> Deserialize<'de>>(
        &self,
        op: &str,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/2/{}", self.api_url, endpoint);
        let payload = serde_json::to_vec(&body)?;
        let resp = self
            .send_authed(op, || {
                self.http
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload.clone())
            })
            .await?;
        map_json(resp, op).await
    }

    async fn content_call(
        &self,
        op: &str,
        endpoint: &str,
        arg: serde_json::Value,
        bytes: Vec<u8>,
    ) -> Result<Response> {
        let url = format!("{}/2/{}", self.content_url, endpoint);
        let arg = serde_json::to_string(&arg)?;
        self.send_authed(op, || {
            self.http
                .post(url.clone())
                .header("Dropbox-API-Arg", arg.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes.clone())
        })
        .await
    }

    /// Send with a fresh bearer token, retrying transient failures with
    /// 1-2-4 s backoff and refreshing the token once on 401.
    async fn send_authed<F>(&self, op: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            let token = self
                .tokens
                .bearer_token(&self.http)
                .await
                .with_context(|| format!("{op}: authorization"))?;
            let result = build()
                .bearer_auth(token)
                .timeout(self.call_timeout)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED && !refreshed => {
                    refreshed = true;
                    self.tokens.invalidate().await;
                }
                Ok(resp) if is_transient_status(resp.status()) && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_BASE_DELAY * (1 << (attempt - 1))).await;
                }
                Ok(resp) => return Ok(resp),
                Err(err) if is_transient_error(&err) && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_BASE_DELAY * (1 << (attempt - 1))).await;
                }
                Err(err) => return Err(err).with_context(|| op.to_string()),
            }
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

async fn map_json<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.with_context(|| format!("{op}: decode response"));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::Error::new(HttpStatusError { status, body }).context(op.to_string()))
}

async fn map_status(resp: Response, op: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::Error::new(HttpStatusError { status, body }).context(op.to_string()))
}

/// 409 answers carry a structured error summary; this picks out the cases
/// the core treats as signals rather than failures.
fn conflict_summary_contains(err: &anyhow::Error, needle: &str) -> bool {
    err.downcast_ref::<HttpStatusError>()
        .is_some_and(|e| e.status == StatusCode::CONFLICT && e.body.contains(needle))
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<MetadataEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct MetadataEntry {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    server_modified: Option<String>,
    #[serde(default)]
    content_hash: Option<String>,
}

impl MetadataEntry {
    fn into_remote(self) -> Option<RemoteEntry> {
        let kind = match self.tag.as_str() {
            "file" => RemoteKind::File,
            "folder" => RemoteKind::Folder,
            // Tombstones and future kinds are ignored upstream.
            _ => RemoteKind::Deleted,
        };
        Some(RemoteEntry {
            path_display: self.path_display?,
            kind,
            size: self.size.unwrap_or(0),
            server_modified: self.server_modified.as_deref().and_then(parse_epoch),
            content_hash: self.content_hash,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileMetadataResponse {
    path_display: String,
    size: u64,
    server_modified: String,
    #[serde(default)]
    content_hash: Option<String>,
}

impl FileMetadataResponse {
    fn into_remote(self) -> RemoteEntry {
        RemoteEntry {
            path_display: self.path_display,
            kind: RemoteKind::File,
            size: self.size,
            server_modified: parse_epoch(&self.server_modified),
            content_hash: self.content_hash,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionStartResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct DeleteBatchLaunch {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    async_job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = ".tag")]
    tag: String,
}

fn parse_epoch(raw: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp() as f64)
}

fn page_from(resp: ListFolderResponse) -> ListPage {
    ListPage {
        entries: resp
            .entries
            .into_iter()
            .filter_map(MetadataEntry::into_remote)
            .collect(),
        cursor: resp.cursor,
        has_more: resp.has_more,
    }
}

fn commit_mode(overwrite: bool) -> &'static str {
    if overwrite {
        "overwrite"
    } else {
        "add"
    }
}

#[async_trait]
impl RemoteStore for DropboxClient {
    async fn list(&self, root: &str, recursive: bool) -> Result<ListPage> {
        let resp: ListFolderResponse = self
            .rpc(
                "list folder",
                "files/list_folder",
                serde_json::json!({ "path": root, "recursive": recursive }),
            )
            .await?;
        Ok(page_from(resp))
    }

    async fn list_continue(&self, cursor: &str) -> Result<ListPage> {
        let resp: ListFolderResponse = self
            .rpc(
                "list folder continue",
                "files/list_folder/continue",
                serde_json::json!({ "cursor": cursor }),
            )
            .await?;
        Ok(page_from(resp))
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>> {
        let result: Result<MetadataEntry> = self
            .rpc(
                "get metadata",
                "files/get_metadata",
                serde_json::json!({ "path": path }),
            )
            .await;
        match result {
            Ok(entry) => Ok(entry.into_remote()),
            Err(err) if conflict_summary_contains(&err, "not_found") => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>, overwrite: bool) -> Result<RemoteEntry> {
        let resp = self
            .content_call(
                "upload",
                "files/upload",
                serde_json::json!({
                    "path": path,
                    "mode": commit_mode(overwrite),
                    "mute": true
                }),
                bytes,
            )
            .await?;
        let meta: FileMetadataResponse = map_json(resp, "upload").await?;
        Ok(meta.into_remote())
    }

    async fn session_start(&self, bytes: Vec<u8>) -> Result<String> {
        let resp = self
            .content_call(
                "upload session start",
                "files/upload_session/start",
                serde_json::json!({ "close": false }),
                bytes,
            )
            .await?;
        let body: SessionStartResponse = map_json(resp, "upload session start").await?;
        Ok(body.session_id)
    }

    async fn session_append(&self, session_id: &str, offset: u64, bytes: Vec<u8>) -> Result<()> {
        let resp = self
            .content_call(
                "upload session append",
                "files/upload_session/append_v2",
                serde_json::json!({
                    "cursor": { "session_id": session_id, "offset": offset },
                    "close": false
                }),
                bytes,
            )
            .await?;
        map_status(resp, "upload session append").await
    }

    async fn session_finish(
        &self,
        session_id: &str,
        offset: u64,
        bytes: Vec<u8>,
        path: &str,
        overwrite: bool,
    ) -> Result<RemoteEntry> {
        let resp = self
            .content_call(
                "upload session finish",
                "files/upload_session/finish",
                serde_json::json!({
                    "cursor": { "session_id": session_id, "offset": offset },
                    "commit": { "path": path, "mode": commit_mode(overwrite), "mute": true }
                }),
                bytes,
            )
            .await?;
        let meta: FileMetadataResponse = map_json(resp, "upload session finish").await?;
        Ok(meta.into_remote())
    }

    async fn download_to(&self, path: &str, local_path: &Path) -> Result<()> {
        let url = format!("{}/2/files/download", self.content_url);
        let arg = serde_json::to_string(&serde_json::json!({ "path": path }))?;
        let resp = self
            .send_authed("download", || {
                self.http
                    .post(url.clone())
                    .header("Dropbox-API-Arg", arg.clone())
            })
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(
                anyhow::Error::new(HttpStatusError { status, body }).context("download")
            );
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("create {}", local_path.display()))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("download stream")?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let result: Result<serde_json::Value> = self
            .rpc(
                "create folder",
                "files/create_folder_v2",
                serde_json::json!({ "path": path, "autorename": false }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already present: the operation is idempotent.
            Err(err) if conflict_summary_contains(&err, "conflict") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<String> {
        let entries: Vec<serde_json::Value> = paths
            .iter()
            .map(|p| serde_json::json!({ "path": p }))
            .collect();
        let launch: DeleteBatchLaunch = self
            .rpc(
                "delete batch",
                "files/delete_batch",
                serde_json::json!({ "entries": entries }),
            )
            .await?;
        match launch.tag.as_str() {
            "complete" => Ok(String::new()),
            "async_job_id" => launch
                .async_job_id
                .ok_or_else(|| anyhow::anyhow!("delete batch: missing async_job_id")),
            other => anyhow::bail!("delete batch: unexpected launch tag {other}"),
        }
    }

    async fn delete_batch_check(&self, job_id: &str) -> Result<bool> {
        let status: JobStatus = self
            .rpc(
                "delete batch check",
                "files/delete_batch/check",
                serde_json::json!({ "async_job_id": job_id }),
            )
            .await?;
        match status.tag.as_str() {
            "complete" => Ok(true),
            "in_progress" => Ok(false),
            other => anyhow::bail!("delete batch check: job ended as {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::testutil::make_temp_dir;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn test_config(base: &str) -> Config {
        let tmp = make_temp_dir();
        std::fs::write(
            tmp.join("config.json"),
            format!(
                r#"{{
                  "app_key": "k", "app_secret": "s", "refresh_token": "r",
                  "local_folder": "{}",
                  "api_url": "{base}", "content_url": "{base}"
                }}"#,
                tmp.join("box").display()
            ),
        )
        .unwrap();
        Config::load_with_overrides(&tmp.join("config.json"), ConfigOverrides::default()).unwrap()
    }

    fn token_route(router: axum::Router) -> axum::Router {
        router.route(
            "/oauth2/token",
            axum::routing::post(|| async {
                axum::Json(serde_json::json!({
                    "access_token": "test-token",
                    "token_type": "bearer",
                    "expires_in": 14400
                }))
            }),
        )
    }

    async fn serve(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stat_maps_not_found_conflict_to_none() {
        let app = token_route(axum::Router::new().route(
            "/2/files/get_metadata",
            axum::routing::post(|| async {
                (
                    axum::http::StatusCode::CONFLICT,
                    axum::Json(serde_json::json!({
                        "error_summary": "path/not_found/..",
                        "error": {".tag": "path", "path": {".tag": "not_found"}}
                    })),
                )
            }),
        ));
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        let got = client.stat("/missing.txt").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn stat_decodes_file_metadata() {
        let app = token_route(axum::Router::new().route(
            "/2/files/get_metadata",
            axum::routing::post(|| async {
                axum::Json(serde_json::json!({
                    ".tag": "file",
                    "name": "b.txt",
                    "path_display": "/a/b.txt",
                    "size": 5,
                    "server_modified": "2024-05-24T14:12:03Z",
                    "content_hash": "abc123"
                }))
            }),
        ));
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        let entry = client.stat("/a/b.txt").await.unwrap().unwrap();
        assert_eq!(entry.kind, RemoteKind::File);
        assert_eq!(entry.path_display, "/a/b.txt");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.server_modified, Some(1716559923.0));
        assert_eq!(entry.content_hash.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn transient_server_error_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = token_route(axum::Router::new().route(
            "/2/files/list_folder",
            axum::routing::post({
                let hits = hits.clone();
                move || {
                    let hits = hits.clone();
                    async move {
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            return (
                                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                                axum::Json(serde_json::json!({"error": "transient"})),
                            );
                        }
                        (
                            axum::http::StatusCode::OK,
                            axum::Json(serde_json::json!({
                                "entries": [], "cursor": "", "has_more": false
                            })),
                        )
                    }
                }
            }),
        ));
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        let page = client.list("", true).await.unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_forces_one_token_refresh_and_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = token_route(axum::Router::new().route(
            "/2/files/list_folder",
            axum::routing::post({
                let hits = hits.clone();
                move || {
                    let hits = hits.clone();
                    async move {
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            return (
                                axum::http::StatusCode::UNAUTHORIZED,
                                axum::Json(serde_json::json!({"error": "expired_access_token"})),
                            );
                        }
                        (
                            axum::http::StatusCode::OK,
                            axum::Json(serde_json::json!({
                                "entries": [], "cursor": "", "has_more": false
                            })),
                        )
                    }
                }
            }),
        ));
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        client.list("", true).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn create_folder_tolerates_existing_folder() {
        let app = token_route(axum::Router::new().route(
            "/2/files/create_folder_v2",
            axum::routing::post(|| async {
                (
                    axum::http::StatusCode::CONFLICT,
                    axum::Json(serde_json::json!({
                        "error_summary": "path/conflict/folder/..",
                        "error": {".tag": "path", "path": {".tag": "conflict"}}
                    })),
                )
            }),
        ));
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        client.create_folder("/exists").await.unwrap();
    }

    #[tokio::test]
    async fn delete_batch_returns_job_id_and_check_reports_progress() {
        let app = token_route(
            axum::Router::new()
                .route(
                    "/2/files/delete_batch",
                    axum::routing::post(|| async {
                        axum::Json(serde_json::json!({
                            ".tag": "async_job_id", "async_job_id": "job-1"
                        }))
                    }),
                )
                .route(
                    "/2/files/delete_batch/check",
                    axum::routing::post(|| async {
                        axum::Json(serde_json::json!({ ".tag": "in_progress" }))
                    }),
                ),
        );
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        let job = client.delete_batch(&["/x".to_string()]).await.unwrap();
        assert_eq!(job, "job-1");
        assert!(!client.delete_batch_check(&job).await.unwrap());
    }

    #[tokio::test]
    async fn download_streams_body_to_file() {
        let app = token_route(axum::Router::new().route(
            "/2/files/download",
            axum::routing::post(|| async { "hello stream" }),
        ));
        let base = serve(app).await;
        let client = DropboxClient::new(&test_config(&base)).unwrap();

        let tmp = make_temp_dir();
        let target = tmp.join("out.bin");
        client.download_to("/a.txt", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello stream");
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected_up_front() {
        let tmp = make_temp_dir();
        let cfg =
            Config::load_with_overrides(&tmp.join("absent.json"), ConfigOverrides::default())
                .unwrap();
        assert!(DropboxClient::new(&cfg).is_err());
    }
}
