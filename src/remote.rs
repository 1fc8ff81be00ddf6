//! Interface to the remote object store. The sync core only ever talks to
//! this trait; the HTTP adapter in `http` implements it against the real
//! service and tests substitute an in-memory store.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Folder,
    /// Tombstones and anything else the listing may return. Ignored by the
    /// remote indexer; deletions are re-derived from snapshot diffs.
    Deleted,
}

/// One listing or metadata result as the server reports it.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub path_display: String,
    pub kind: RemoteKind,
    pub size: u64,
    /// Epoch seconds. Folders carry no server timestamp.
    pub server_modified: Option<f64>,
    /// Present for files only.
    pub content_hash: Option<String>,
}

#[derive(Debug, Default)]
pub struct ListPage {
    pub entries: Vec<RemoteEntry>,
    pub cursor: String,
    pub has_more: bool,
}

/// The remote service surface the reconciliation core depends on. Paths are
/// absolute API paths under the remote namespace; the root renders as the
/// empty string.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, root: &str, recursive: bool) -> Result<ListPage>;

    async fn list_continue(&self, cursor: &str) -> Result<ListPage>;

    /// Metadata probe. `Ok(None)` when the path does not exist; any other
    /// failure propagates.
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>>;

    /// Single-call whole-file upload, used below the chunking threshold.
    async fn upload(&self, path: &str, bytes: Vec<u8>, overwrite: bool) -> Result<RemoteEntry>;

    /// Open a chunked upload session with the first chunk. The returned id
    /// is opaque.
    async fn session_start(&self, bytes: Vec<u8>) -> Result<String>;

    /// Append a chunk at `offset` = bytes sent so far.
    async fn session_append(&self, session_id: &str, offset: u64, bytes: Vec<u8>) -> Result<()>;

    /// Commit the session with its final chunk and target path.
    async fn session_finish(
        &self,
        session_id: &str,
        offset: u64,
        bytes: Vec<u8>,
        path: &str,
        overwrite: bool,
    ) -> Result<RemoteEntry>;

    async fn download_to(&self, path: &str, local_path: &Path) -> Result<()>;

    /// Idempotent: creating a folder that already exists succeeds.
    async fn create_folder(&self, path: &str) -> Result<()>;

    /// Submit up to [`crate::apply::DELETE_BATCH_SIZE`] paths for deletion.
    /// Returns an async job id; an empty id means the batch completed
    /// synchronously.
    async fn delete_batch(&self, paths: &[String]) -> Result<String>;

    /// True once the batch job has completed.
    async fn delete_batch_check(&self, job_id: &str) -> Result<bool>;
}
