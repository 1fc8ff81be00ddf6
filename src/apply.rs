//! Execution of staged operations against the remote store and the local
//! filesystem. Any single path failing never aborts the pass; the failure
//! is recorded and the next pass re-reconciles.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use filetime::FileTime;

use crate::hasher;
use crate::logging;
use crate::paths;
use crate::remote::{RemoteEntry, RemoteStore};
use crate::types::{round_mtime, ConflictReason, ConflictSkip, Entry, Index, Op, OpFailure};

/// Files at or above this size go through a chunked upload session, in
/// chunks of this size.
pub const UPLOAD_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Upper bound on paths per delete batch call.
pub const DELETE_BATCH_SIZE: usize = 1000;

const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What one applier primitive did.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Paths applied successfully.
    pub completed: Vec<String>,
    /// Server-returned entries to fold back into the remote index so the
    /// end-of-pass snapshot records the server's view of uploads.
    pub refined: Vec<Entry>,
    pub skipped: Vec<ConflictSkip>,
    pub failed: Vec<OpFailure>,
}

pub struct Applier<'a, S: RemoteStore + ?Sized> {
    store: &'a S,
    local_root: PathBuf,
    remote_root: String,
    /// When set, upward operations are classified and logged but not
    /// executed; downward operations always execute.
    debug: bool,
}

impl<'a, S: RemoteStore + ?Sized> Applier<'a, S> {
    pub fn new(store: &'a S, local_root: &Path, remote_root: &str, debug: bool) -> Self {
        Applier {
            store,
            local_root: local_root.to_path_buf(),
            remote_root: remote_root.to_string(),
            debug,
        }
    }

    pub async fn apply(&self, op: Op, staged: &Index) -> ApplyOutcome {
        match op {
            Op::UploadAdd => self.upload(staged).await,
            Op::UploadDel => self.delete_remote(staged).await,
            Op::DownloadAdd => self.download(staged).await,
            Op::DownloadDel => self.delete_local(staged).await,
        }
    }

    /// Remote metadata probe. `Ok(None)` when the path does not exist.
    pub async fn stat(&self, rel: &str) -> Result<Option<RemoteEntry>> {
        self.store
            .stat(&paths::api_path(&self.remote_root, rel))
            .await
    }

    /// Two-phase: create staged folders shortest-first so parents precede
    /// children, then upload files.
    async fn upload(&self, staged: &Index) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();
        if self.debug_skip(Op::UploadAdd, staged) {
            return out;
        }

        for entry in folders_by_depth(staged, false) {
            let api = paths::api_path(&self.remote_root, &entry.path);
            match self.store.create_folder(&api).await {
                Ok(()) => out.completed.push(entry.path.clone()),
                Err(err) => record_failure(&mut out, Op::UploadAdd, &entry.path, err),
            }
        }

        for entry in staged.values().filter(|e| !e.is_folder) {
            match self.upload_file(entry).await {
                Ok(remote_entry) => {
                    let refined = entry_from_upload(entry, &remote_entry);
                    // Align the local timestamp with the server's so both
                    // sides carry the same mtime for this version; delete
                    // arbitration depends on it.
                    let abs = paths::fs_path(&self.local_root, &entry.path);
                    if let Err(err) = set_mtime(&abs, refined.mtime) {
                        logging::warn(format!("mtime fixup failed for {}: {err:#}", entry.path));
                    }
                    out.refined.push(refined);
                    out.completed.push(entry.path.clone());
                }
                Err(err) => record_failure(&mut out, Op::UploadAdd, &entry.path, err),
            }
        }
        out
    }

    async fn upload_file(&self, entry: &Entry) -> Result<RemoteEntry> {
        let abs = paths::fs_path(&self.local_root, &entry.path);
        let api = paths::api_path(&self.remote_root, &entry.path);
        let size = fs::metadata(&abs)
            .with_context(|| format!("stat {}", abs.display()))?
            .len();

        if size < UPLOAD_CHUNK_SIZE {
            let bytes = fs::read(&abs).with_context(|| format!("read {}", abs.display()))?;
            return self.store.upload(&api, bytes, true).await;
        }
        self.upload_chunked(&abs, &api, size).await
    }

    /// Chunked session: `session_start(first)` then `session_append` at
    /// `offset = bytes sent so far`, committing the final chunk via
    /// `session_finish`.
    async fn upload_chunked(&self, abs: &Path, api: &str, size: u64) -> Result<RemoteEntry> {
        let mut file = fs::File::open(abs).with_context(|| format!("open {}", abs.display()))?;
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE as usize];

        let n = read_full(&mut file, &mut buf)?;
        let session_id = self.store.session_start(buf[..n].to_vec()).await?;
        let mut offset = n as u64;

        loop {
            let n = read_full(&mut file, &mut buf)?;
            // A short or empty read means the file ends here, even if it
            // shrank under us since the size probe.
            let last = n == 0 || offset + n as u64 >= size;
            if last {
                return self
                    .store
                    .session_finish(&session_id, offset, buf[..n].to_vec(), api, true)
                    .await;
            }
            self.store
                .session_append(&session_id, offset, buf[..n].to_vec())
                .await?;
            offset += n as u64;
        }
    }

    /// Folders first (parents before children), then files via a temporary
    /// target renamed into place. After a successful download the local
    /// mtime is set to the server timestamp so later passes see the file as
    /// unchanged.
    async fn download(&self, staged: &Index) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();

        for entry in folders_by_depth(staged, false) {
            let abs = paths::fs_path(&self.local_root, &entry.path);
            match fs::create_dir_all(&abs) {
                Ok(()) => out.completed.push(entry.path.clone()),
                Err(err) => record_failure(&mut out, Op::DownloadAdd, &entry.path, err.into()),
            }
        }

        for entry in staged.values().filter(|e| !e.is_folder) {
            match self.download_file(entry).await {
                Ok(true) => out.completed.push(entry.path.clone()),
                Ok(false) => {
                    logging::warn_kv(
                        "conflict skip",
                        &[
                            ("op", Op::DownloadAdd.label()),
                            ("path", &entry.path),
                            ("reason", ConflictReason::LocalNewer.as_str()),
                        ],
                    );
                    out.skipped.push(ConflictSkip {
                        path: entry.path.clone(),
                        op: Op::DownloadAdd,
                        reason: ConflictReason::LocalNewer,
                    });
                }
                Err(err) => record_failure(&mut out, Op::DownloadAdd, &entry.path, err),
            }
        }
        out
    }

    /// `Ok(false)` when the live target already holds equal content or a
    /// newer version than the staged remote entry.
    async fn download_file(&self, entry: &Entry) -> Result<bool> {
        let abs = paths::fs_path(&self.local_root, &entry.path);

        if let Ok(meta) = fs::metadata(&abs) {
            if meta.is_file() {
                let live_mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| round_mtime(d.as_secs_f64()))
                    .unwrap_or(0.0);
                if live_mtime >= entry.mtime {
                    return Ok(false);
                }
                if entry.content_hash.is_some()
                    && hasher::hash_file(&abs).ok() == entry.content_hash
                {
                    return Ok(false);
                }
            }
        }

        let parent = abs
            .parent()
            .with_context(|| format!("target has no parent: {}", abs.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let fname = abs
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        let tmp = parent.join(format!(".{}.tmp-{}", fname, uuid::Uuid::new_v4()));

        let api = paths::api_path(&self.remote_root, &entry.path);
        if let Err(err) = self.store.download_to(&api, &tmp).await {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &abs)
            .with_context(|| format!("rename {} -> {}", tmp.display(), abs.display()))?;
        set_mtime(&abs, entry.mtime)?;
        Ok(true)
    }

    /// Files first in batches with async completion polling, then folders
    /// in ascending depth order, eliding folders already covered by a
    /// queued ancestor.
    async fn delete_remote(&self, staged: &Index) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();
        if self.debug_skip(Op::UploadDel, staged) {
            return out;
        }

        let files: Vec<String> = staged
            .values()
            .filter(|e| !e.is_folder)
            .map(|e| e.path.clone())
            .collect();
        self.delete_batches(files, &mut out).await;

        let mut queued: Vec<String> = Vec::new();
        for entry in folders_by_depth(staged, false) {
            if queued.iter().any(|q| paths::is_ancestor(q, &entry.path)) {
                continue;
            }
            queued.push(entry.path.clone());
        }
        self.delete_batches(queued, &mut out).await;
        out
    }

    async fn delete_batches(&self, rels: Vec<String>, out: &mut ApplyOutcome) {
        let mut jobs: Vec<(String, Vec<String>)> = Vec::new();

        for chunk in rels.chunks(DELETE_BATCH_SIZE) {
            let api_paths: Vec<String> = chunk
                .iter()
                .map(|rel| paths::api_path(&self.remote_root, rel))
                .collect();
            match self.store.delete_batch(&api_paths).await {
                Ok(job_id) => jobs.push((job_id, chunk.to_vec())),
                Err(err) => {
                    for rel in chunk {
                        record_failure(out, Op::UploadDel, rel, anyhow::anyhow!("{err:#}"));
                    }
                }
            }
        }

        // 1 Hz until every job reports complete.
        let mut pending = jobs;
        while !pending.is_empty() {
            let mut still = Vec::new();
            for (job_id, rels) in pending {
                if job_id.is_empty() {
                    out.completed.extend(rels);
                    continue;
                }
                match self.store.delete_batch_check(&job_id).await {
                    Ok(true) => out.completed.extend(rels),
                    Ok(false) => still.push((job_id, rels)),
                    Err(err) => {
                        for rel in &rels {
                            record_failure(out, Op::UploadDel, rel, anyhow::anyhow!("{err:#}"));
                        }
                    }
                }
            }
            pending = still;
            if !pending.is_empty() {
                tokio::time::sleep(DELETE_POLL_INTERVAL).await;
            }
        }
    }

    /// Files first with a live `(size, mtime)` check against the expected
    /// entry, then folders in descending depth order via non-recursive
    /// rmdir; a non-empty folder is a conflict, not an error.
    async fn delete_local(&self, staged: &Index) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();

        for entry in staged.values().filter(|e| !e.is_folder) {
            let abs = paths::fs_path(&self.local_root, &entry.path);
            match fs::metadata(&abs) {
                Err(_) => self.skip(&mut out, entry, ConflictReason::TargetMissing),
                Ok(meta) if !meta.is_file() => {
                    self.skip(&mut out, entry, ConflictReason::UnexpectedTarget)
                }
                Ok(meta) => {
                    let live_mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| round_mtime(d.as_secs_f64()))
                        .unwrap_or(0.0);
                    if meta.len() != entry.size || live_mtime != entry.mtime {
                        self.skip(&mut out, entry, ConflictReason::UnexpectedTarget);
                        continue;
                    }
                    match fs::remove_file(&abs) {
                        Ok(()) => out.completed.push(entry.path.clone()),
                        Err(err) => {
                            record_failure(&mut out, Op::DownloadDel, &entry.path, err.into())
                        }
                    }
                }
            }
        }

        for entry in folders_by_depth(staged, true) {
            let abs = paths::fs_path(&self.local_root, &entry.path);
            if !abs.exists() {
                self.skip(&mut out, entry, ConflictReason::TargetMissing);
                continue;
            }
            match fs::remove_dir(&abs) {
                Ok(()) => out.completed.push(entry.path.clone()),
                // Anything still inside means the folder diverged.
                Err(_) => self.skip(&mut out, entry, ConflictReason::UnexpectedTarget),
            }
        }
        out
    }

    fn skip(&self, out: &mut ApplyOutcome, entry: &Entry, reason: ConflictReason) {
        logging::warn_kv(
            "conflict skip",
            &[
                ("op", Op::DownloadDel.label()),
                ("path", &entry.path),
                ("reason", reason.as_str()),
            ],
        );
        out.skipped.push(ConflictSkip {
            path: entry.path.clone(),
            op: Op::DownloadDel,
            reason,
        });
    }

    fn debug_skip(&self, op: Op, staged: &Index) -> bool {
        if !self.debug {
            return false;
        }
        for path in staged.keys() {
            logging::info_kv("debug: not executing", &[("op", op.label()), ("path", path)]);
        }
        true
    }
}

fn folders_by_depth(staged: &Index, deepest_first: bool) -> Vec<&Entry> {
    let mut folders: Vec<&Entry> = staged.values().filter(|e| e.is_folder).collect();
    folders.sort_by(|a, b| {
        let key_a = (paths::depth(&a.path), a.path.as_str());
        let key_b = (paths::depth(&b.path), b.path.as_str());
        if deepest_first {
            key_b.cmp(&key_a)
        } else {
            key_a.cmp(&key_b)
        }
    });
    folders
}

fn entry_from_upload(staged: &Entry, remote: &RemoteEntry) -> Entry {
    Entry::file(
        staged.path.clone(),
        remote.size,
        remote
            .server_modified
            .map(round_mtime)
            .unwrap_or(staged.mtime),
        remote.content_hash.clone(),
    )
}

fn record_failure(out: &mut ApplyOutcome, op: Op, path: &str, err: anyhow::Error) {
    logging::error(format!("{} failed for {}: {err:#}", op.label(), path));
    out.failed.push(OpFailure {
        path: path.to_string(),
        op,
        error: format!("{err:#}"),
    });
}

fn read_full(file: &mut fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).context("read local file")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn set_mtime(path: &Path, mtime: f64) -> Result<()> {
    let secs = mtime.trunc() as i64;
    let nanos = ((mtime - mtime.trunc()) * 1e9).round() as u32;
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, nanos))
        .with_context(|| format!("set mtime on {}", path.display()))
}
